//! Loopback CPU miner.
//!
//! Iterates the 32-bit nonce space against the current job and pushes any
//! solves through the same share path sessions use, so integration tests and
//! single-box experiments exercise the full pipeline without external miner
//! hardware. Enabled by the `enable_cpuminer` config option.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broadcast::Broadcaster;
use crate::job::{Job, Share};
use crate::tracing::prelude::*;
use crate::types::{Extranonce1, Extranonce2};

/// Username recorded on loopback shares.
const USERNAME: &str = "loopback";

/// Nonces hashed between cooperative yields.
const BATCH: u32 = 2048;

/// Minimum interval between hash-rate reports.
const REPORT_INTERVAL: Duration = Duration::from_secs(15);

/// Pause after finding a solve, so one lucky template does not flood the
/// submission path.
const SOLVE_PAUSE: Duration = Duration::from_secs(10);

/// Run the loopback miner until shutdown.
pub async fn run(
    job_cast: Broadcaster<Arc<Job>>,
    new_share: mpsc::Sender<Share>,
    extranonce1: Extranonce1,
    shutdown: CancellationToken,
) {
    let mut jobs = job_cast.subscribe();
    let mut work: Option<Work> = None;
    let mut nonce: u32 = 0;
    let mut hashes: u64 = 0;
    let mut last_report = Instant::now();

    info!("loopback miner started");
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        // Pick up the newest job without blocking the hash loop.
        while let Some(job) = jobs.try_recv() {
            work = Some(Work::prepare(job, &extranonce1));
            nonce = 0;
        }

        let Some(current) = &work else {
            // Nothing to mine yet; wait for the first job.
            tokio::select! {
                _ = shutdown.cancelled() => return,
                job = jobs.recv() => match job {
                    Some(job) => {
                        work = Some(Work::prepare(job, &extranonce1));
                        nonce = 0;
                    }
                    None => return,
                },
            }
            continue;
        };

        let mut solved = false;
        for _ in 0..BATCH {
            let header = current.job.header(current.merkle_root, current.job.curtime, nonce);
            let blocks = current.job.check_solves(&current.coinbase, &header);
            nonce = nonce.wrapping_add(1);
            hashes += 1;
            if blocks.is_empty() {
                continue;
            }
            info!(chains = blocks.len(), nonce, "loopback miner solved a block");
            let share = Share {
                username: USERNAME.to_string(),
                time: SystemTime::now(),
                difficulty: 0.0,
                blocks,
            };
            if new_share.send(share).await.is_err() {
                return;
            }
            solved = true;
            break;
        }

        let elapsed = last_report.elapsed();
        if elapsed >= REPORT_INTERVAL {
            let rate = hashes as f64 / elapsed.as_secs_f64();
            info!(rate = format!("{rate:.0} hps"), "loopback hashrate");
            hashes = 0;
            last_report = Instant::now();
        }

        if solved {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(SOLVE_PAUSE) => {}
            }
            last_report = Instant::now();
            hashes = 0;
        } else {
            // Keep the executor responsive between batches.
            tokio::task::yield_now().await;
        }
    }
}

/// A job with its loopback coinbase precomputed.
struct Work {
    job: Arc<Job>,
    coinbase: Vec<u8>,
    merkle_root: bitcoin::TxMerkleNode,
}

impl Work {
    fn prepare(job: Arc<Job>, extranonce1: &Extranonce1) -> Self {
        let extranonce2 = Extranonce2::zeroed(job.extranonce2_size)
            .expect("job extranonce2 size is validated by config");
        let coinbase = job.coinbase(extranonce1, &extranonce2);
        let merkle_root = job.merkle_root(&coinbase);
        Self {
            job,
            coinbase,
            merkle_root,
        }
    }
}
