//! Upstream coinserver watchers.
//!
//! One [`CoinserverWatcher`] per discovered coin daemon. Each watcher owns two
//! tasks: a template broadcaster that follows the daemon's SSE stream and
//! feeds decoded templates into the shared template channel, and a block
//! listener that forwards solved blocks from this currency's broadcast onto
//! the daemon's `submitblock` RPC. The stream reconnects forever with a short
//! backoff until the watcher is stopped.

pub mod rpc;
pub mod sse;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use base64::Engine;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::job::BlockSolve;
use crate::template::{Template, TemplateKey};
use rpc::{RpcClient, SubmitResult};
use sse::SseStream;

/// Delay between SSE reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Errors from upstream communication.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
}

/// Watcher lifecycle status.
///
/// `Up` means the SSE stream is connected; `Live` means at least one template
/// arrived since the last `Up` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherStatus {
    Starting,
    Up,
    Live,
    Down,
}

/// Per-upstream subscriber and block submitter.
pub struct CoinserverWatcher {
    id: String,
    key: TemplateKey,
    endpoint: String,
    new_template: mpsc::Sender<Template>,
    block_cast: Broadcaster<Arc<BlockSolve>>,
    status: Arc<StdMutex<WatcherStatus>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl CoinserverWatcher {
    /// `id` is the registry service id; `endpoint` the daemon's base URL
    /// (trailing slash included, per the registry convention).
    pub fn new(
        id: String,
        key: TemplateKey,
        endpoint: String,
        new_template: mpsc::Sender<Template>,
        block_cast: Broadcaster<Arc<BlockSolve>>,
    ) -> Self {
        Self {
            id,
            key,
            endpoint,
            new_template,
            block_cast,
            status: Arc::new(StdMutex::new(WatcherStatus::Starting)),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn status(&self) -> WatcherStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the template broadcaster and block listener tasks.
    pub fn start(&self) {
        let stream = StreamTask {
            short_id: short_id(&self.id),
            key: self.key.clone(),
            url: format!("{}blocks", self.endpoint),
            new_template: self.new_template.clone(),
            status: self.status.clone(),
            shutdown: self.shutdown.clone(),
        };
        self.tracker.spawn(stream.run());

        let blocks = BlockTask {
            short_id: short_id(&self.id),
            currency: self.key.currency.clone(),
            rpc: RpcClient::new(&self.endpoint),
            subscriber: self.block_cast.subscribe(),
            shutdown: self.shutdown.clone(),
        };
        self.tracker.spawn(blocks.run());
        self.tracker.close();
    }

    /// Stop the watcher and wait for its tasks to unwind.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.wait().await;
    }
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

/// The SSE-following half of a watcher.
struct StreamTask {
    short_id: String,
    key: TemplateKey,
    url: String,
    new_template: mpsc::Sender<Template>,
    status: Arc<StdMutex<WatcherStatus>>,
    shutdown: CancellationToken,
}

impl StreamTask {
    fn set_status(&self, status: WatcherStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn get_status(&self) -> WatcherStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run(self) {
        let client = reqwest::Client::new();
        loop {
            match SseStream::connect(&client, &self.url).await {
                Ok(stream) => {
                    self.set_status(WatcherStatus::Up);
                    debug!(id = %self.short_id, key = %self.key, "coinserver watcher is now UP");
                    if self.follow_stream(stream).await {
                        return;
                    }
                }
                Err(e) => {
                    if self.get_status() != WatcherStatus::Down {
                        warn!(id = %self.short_id, error = %e, "coinserver watcher is now DOWN");
                    }
                    self.set_status(WatcherStatus::Down);
                }
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    /// Consume events until the stream breaks. Returns true on shutdown.
    async fn follow_stream(&self, mut stream: SseStream) -> bool {
        // The stream yields one event per line; an event-name line updates
        // the pending label, a data line completes an event.
        let mut pending_event: Option<String> = None;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return true,
                event = stream.next_event() => {
                    match event {
                        Ok(Some(event)) => {
                            if let Some(name) = event.event {
                                pending_event = Some(name);
                            }
                            if let Some(data) = event.data {
                                self.emit_template(pending_event.as_deref(), &data).await;
                            }
                        }
                        Ok(None) => {
                            warn!(id = %self.short_id, "coinserver stream closed, watcher is now DOWN");
                            self.set_status(WatcherStatus::Down);
                            return false;
                        }
                        Err(e) => {
                            warn!(id = %self.short_id, error = %e, "coinserver stream error, watcher is now DOWN");
                            self.set_status(WatcherStatus::Down);
                            return false;
                        }
                    }
                }
            }
        }
    }

    async fn emit_template(&self, event: Option<&str>, payload: &str) {
        let decoded = match base64::engine::general_purpose::STANDARD.decode(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(id = %self.short_id, error = %e, "bad payload from coinserver");
                return;
            }
        };
        debug!(
            id = %self.short_id,
            event = event.unwrap_or("message"),
            bytes = decoded.len(),
            "got new template"
        );
        if self
            .new_template
            .send(Template {
                key: self.key.clone(),
                data: decoded,
            })
            .await
            .is_err()
        {
            // Template listener gone; the daemon is shutting down.
            return;
        }
        if self.get_status() != WatcherStatus::Live {
            info!(id = %self.short_id, key = %self.key, "coinserver watcher is now LIVE");
        }
        self.set_status(WatcherStatus::Live);
    }
}

/// The block-submitting half of a watcher.
struct BlockTask {
    short_id: String,
    currency: String,
    rpc: RpcClient,
    subscriber: crate::broadcast::Subscriber<Arc<BlockSolve>>,
    shutdown: CancellationToken,
}

impl BlockTask {
    async fn run(mut self) {
        loop {
            let solve = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                solve = self.subscriber.recv() => match solve {
                    Some(solve) => solve,
                    None => return,
                },
            };
            let block_hex = hex::encode(&solve.data);
            // RPC errors are logged, not retried; consensus sorts out the
            // rest.
            match self.rpc.submit_block(&block_hex).await {
                Ok(SubmitResult::Accepted) => {
                    info!(id = %self.short_id, currency = %self.currency, "found a block!");
                }
                Ok(SubmitResult::Inconclusive) => {
                    info!(
                        id = %self.short_id,
                        currency = %self.currency,
                        "found a block! (inconclusive)"
                    );
                }
                Ok(SubmitResult::Other(resp)) => {
                    info!(
                        id = %self.short_id,
                        currency = %self.currency,
                        resp = %resp,
                        "maybe found a block"
                    );
                }
                Err(e) => {
                    info!(id = %self.short_id, error = %e, "error submitting block");
                }
            }
        }
    }
}
