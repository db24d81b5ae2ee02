//! Merge-mining Stratum coordinator.
//!
//! stratumd connects to upstream coin daemons, folds their block templates
//! into a single merge-mined job, serves that job to Stratum v1 miners,
//! validates their shares, submits winning blocks back to the owning daemons,
//! and records shares and blocks durably.
//!
//! The flow, upstream to downstream:
//!
//! - [`upstream`]: one watcher per discovered coinserver follows its SSE
//!   template stream and submits solved blocks over RPC
//! - [`job`]: the latest template per key becomes a fresh [`job::Job`] with a
//!   unified coinbase and aux commitment
//! - [`server`]: orchestrates the tasks and owns the shared state
//! - [`stratum`]: the per-miner protocol sessions
//! - [`store`]: append-only share and block recording

pub mod broadcast;
pub mod config;
pub mod daemon;
pub mod job;
pub mod miner;
pub mod registry;
pub mod server;
pub mod store;
pub mod stratum;
pub mod template;
pub mod tracing;
pub mod types;
pub mod u256;
pub mod upstream;
