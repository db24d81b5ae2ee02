//! Stratum server orchestration.
//!
//! One [`StratumServer`] value owns every piece of cross-task state: the job
//! broadcast, the last-job pointer, the per-currency block broadcasts, the
//! extranonce allocator, and the recorder handle. Tasks get exactly the
//! handles they need; watchers in particular never see the server. Locking
//! follows the ownership split: `block_cast` has a mutex for the
//! read-or-create pattern, `last_job` a mutex for a pointer swap, and
//! everything else is owned by a single task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::job::{BlockSolve, Job, JobError, Share, TemplateSet};
use crate::miner;
use crate::registry::{Action, ServiceRegistry, ServiceStatusUpdate, UpstreamSpec};
use crate::store::{BlockRow, ShareRow, SolveStore};
use crate::stratum::{Connection, Session, SessionHandles, SessionSettings};
use crate::template::Template;
use crate::tracing::prelude::*;
use crate::types::Extranonce1Allocator;
use crate::upstream::CoinserverWatcher;

/// Depth of the template fan-in channel.
const TEMPLATE_CHANNEL: usize = 64;

/// Depth of the share fan-in channel. When the recorder falls behind, this
/// fills and sessions block on submit; miners retry.
const SHARE_CHANNEL: usize = 256;

/// The server value shared by every orchestration task.
pub struct StratumServer {
    config: Arc<Config>,
    store: Arc<dyn SolveStore>,
    job_cast: Broadcaster<Arc<Job>>,
    last_job: Arc<StdMutex<Option<Arc<Job>>>>,
    /// Keyed by currency code.
    block_cast: StdMutex<HashMap<String, Broadcaster<Arc<BlockSolve>>>>,
    extranonce1: Arc<Extranonce1Allocator>,
    job_counter: AtomicU64,
}

impl StratumServer {
    pub fn new(config: Arc<Config>, store: Arc<dyn SolveStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            job_cast: Broadcaster::new(),
            last_job: Arc::new(StdMutex::new(None)),
            block_cast: StdMutex::new(HashMap::new()),
            extranonce1: Arc::new(Extranonce1Allocator::new()),
            job_counter: AtomicU64::new(1),
        })
    }

    /// Get or create the block broadcast for a currency.
    pub fn block_cast(&self, currency: &str) -> Broadcaster<Arc<BlockSolve>> {
        let mut casts = self.block_cast.lock().unwrap_or_else(|e| e.into_inner());
        casts
            .entry(currency.to_string())
            .or_insert_with(Broadcaster::new)
            .clone()
    }

    /// A snapshot of the most recent job.
    pub fn last_job(&self) -> Option<Arc<Job>> {
        self.last_job
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run the server over a pre-bound listener until shutdown.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        registry: Arc<dyn ServiceRegistry>,
        shutdown: CancellationToken,
    ) {
        let (template_tx, template_rx) = mpsc::channel(TEMPLATE_CHANNEL);
        let (share_tx, share_rx) = mpsc::channel(SHARE_CHANNEL);

        let tracker = TaskTracker::new();
        tracker.spawn(self.clone().listen_templates(template_rx, shutdown.clone()));
        tracker.spawn(self.clone().listen_shares(share_rx, shutdown.clone()));

        let updates = registry.watch().await;
        tracker.spawn(self.clone().handle_registry_updates(
            updates,
            template_tx,
            shutdown.clone(),
        ));
        tracker.spawn({
            let registry = registry.clone();
            let shutdown = shutdown.clone();
            async move { registry.keep_alive(shutdown).await }
        });

        if self.config.enable_cpuminer {
            tracker.spawn(miner::run(
                self.job_cast.clone(),
                share_tx.clone(),
                self.extranonce1.next(),
                shutdown.clone(),
            ));
        }

        tracker.spawn(self.clone().listen_miners(listener, share_tx, shutdown.clone()));
        tracker.close();

        shutdown.cancelled().await;
        tracker.wait().await;
    }

    /// Fold arriving templates into the set and broadcast a fresh job.
    async fn listen_templates(
        self: Arc<Self>,
        mut templates: mpsc::Receiver<Template>,
        shutdown: CancellationToken,
    ) {
        debug!("starting template listener");
        let mut set = TemplateSet::new();
        loop {
            let template = tokio::select! {
                _ = shutdown.cancelled() => return,
                template = templates.recv() => match template {
                    Some(template) => template,
                    None => return,
                },
            };
            info!(key = %template.key, "got new template");
            set.update(template);

            let job_id = format!("{:x}", self.job_counter.fetch_add(1, Ordering::Relaxed));
            match set.assemble(job_id, self.config.extranonce2_size) {
                Ok(job) => {
                    let job = Arc::new(job);
                    info!(job_id = %job.id, "new job generated, pushing");
                    *self.last_job.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(job.clone());
                    self.job_cast.submit(job);
                }
                Err(JobError::NoBaseTemplate) => {
                    debug!("no base template yet, holding off job generation");
                }
                Err(e) => {
                    // Keep serving the prior job.
                    error!(error = %e, "error generating job");
                }
            }
        }
    }

    /// Record shares and fan solved blocks out to the owning watchers.
    async fn listen_shares(
        self: Arc<Self>,
        mut shares: mpsc::Receiver<Share>,
        shutdown: CancellationToken,
    ) {
        debug!("starting share listener");
        let chain = self.config.share_chain_name.clone();
        loop {
            let share = tokio::select! {
                _ = shutdown.cancelled() => return,
                share = shares.recv() => match share {
                    Some(share) => share,
                    None => return,
                },
            };
            debug!(username = %share.username, difficulty = share.difficulty, "got share");

            for (currency, solve) in &share.blocks {
                self.block_cast(currency).submit(solve.clone());
                let row = BlockRow {
                    height: solve.height as i64,
                    currency: currency.clone(),
                    hash: solve.block_hash().to_string(),
                    powhash: hex::encode(solve.powhash.to_be_bytes()),
                    subsidy: solve.subsidy,
                    mined_at: share.time,
                    mined_by: share.username.clone(),
                    difficulty: solve.difficulty.to_string(),
                    chain: chain.clone(),
                };
                if let Err(e) = self.store.insert_block(&row).await {
                    error!(error = %e, "failed to save block");
                }
            }

            let row = ShareRow {
                username: share.username.clone(),
                difficulty: share.difficulty,
                mined_at: share.time,
                chain: chain.clone(),
            };
            if let Err(e) = self.store.insert_share(&row).await {
                error!(error = %e, "failed to save share");
            }
        }
    }

    /// React to coinserver lifecycle events from the registry.
    ///
    /// The watcher map is owned by this task alone; no locking.
    async fn handle_registry_updates(
        self: Arc<Self>,
        mut updates: mpsc::Receiver<ServiceStatusUpdate>,
        template_tx: mpsc::Sender<Template>,
        shutdown: CancellationToken,
    ) {
        info!("listening for coinserver services");
        let interest = self.config.interest_keys();
        let mut watchers: HashMap<String, CoinserverWatcher> = HashMap::new();
        loop {
            let update = tokio::select! {
                _ = shutdown.cancelled() => break,
                update = updates.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
            };
            match update.action {
                Action::Removed => {
                    if let Some(watcher) = watchers.remove(&update.service_id) {
                        info!(id = %update.service_id, "coinserver shutdown");
                        watcher.stop().await;
                    }
                }
                Action::Updated => {
                    debug!(id = %update.service_id, "coinserver status update");
                }
                Action::Added => {
                    let spec = match UpstreamSpec::from_status(&update.status) {
                        Ok(spec) => spec,
                        Err(e) => {
                            warn!(
                                id = %update.service_id,
                                error = %e,
                                "ignoring malformed coinserver advertisement"
                            );
                            continue;
                        }
                    };
                    if !interest.contains(&spec.key) {
                        debug!(id = %update.service_id, key = %spec.key, "ignoring coinserver");
                        continue;
                    }
                    let watcher = CoinserverWatcher::new(
                        update.service_id.clone(),
                        spec.key.clone(),
                        spec.endpoint,
                        template_tx.clone(),
                        self.block_cast(&spec.key.currency),
                    );
                    watcher.start();
                    debug!(id = %update.service_id, key = %spec.key, "new coinserver detected");
                    watchers.insert(update.service_id, watcher);
                }
            }
        }
        for (_, watcher) in watchers.drain() {
            watcher.stop().await;
        }
    }

    /// Accept miner connections and spawn a session per connection.
    async fn listen_miners(
        self: Arc<Self>,
        listener: TcpListener,
        share_tx: mpsc::Sender<Share>,
        shutdown: CancellationToken,
    ) {
        let handles = SessionHandles {
            job_cast: self.job_cast.clone(),
            last_job: self.last_job.clone(),
            new_share: share_tx,
            extranonce1: self.extranonce1.clone(),
        };
        let settings = SessionSettings {
            vardiff: self.config.vardiff(),
            extranonce2_size: self.config.extranonce2_size,
        };
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => return,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "miner connected");
                    let session = Session::new(
                        Connection::new(stream),
                        handles.clone(),
                        settings,
                        shutdown.child_token(),
                    );
                    tokio::spawn(session.run());
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                }
            }
        }
    }
}
