//! Process lifecycle for stratumd.
//!
//! Boot acquires every must-have resource up front, so a broken database URL
//! or an occupied listen port kills the process before any miner connects.
//! After that the daemon parks on the signal handlers; teardown is
//! cancellation-driven, with one token fanning out to every task and the
//! process exiting only after all of them have unwound.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::registry::{ServiceRegistry, StaticRegistry};
use crate::server::StratumServer;
use crate::store::{PgStore, SolveStore};
use crate::tracing::prelude::*;

/// Boot the daemon and block until a termination signal has been handled.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    // Fatal-at-boot acquisitions; past this point every error is recovered
    // locally by the owning subsystem.
    let store: Arc<dyn SolveStore> = Arc::new(
        PgStore::connect(&config.db_connection_string)
            .await
            .context("failed to connect to db")?,
    );
    let listener = TcpListener::bind(&config.stratum_bind)
        .await
        .with_context(|| format!("failed to listen on {}", config.stratum_bind))?;
    info!(endpoint = %config.stratum_bind, "listening for stratum miners");

    let registry: Arc<dyn ServiceRegistry> =
        Arc::new(StaticRegistry::new(config.static_upstreams.clone()));

    let stop = CancellationToken::new();
    let tasks = TaskTracker::new();
    let server = StratumServer::new(config, store);
    tasks.spawn(server.run(listener, registry, stop.clone()));
    tasks.close();
    info!("stratumd up");

    let caught = wait_for_termination().await?;
    info!(signal = caught, "shutting down");

    stop.cancel();
    tasks.wait().await;
    info!("all tasks drained, goodbye");
    Ok(())
}

/// Park until SIGINT or SIGTERM arrives; report which one did.
async fn wait_for_termination() -> anyhow::Result<&'static str> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let caught = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    };
    Ok(caught)
}
