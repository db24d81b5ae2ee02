//! Stratum v1 server protocol.
//!
//! Line-delimited JSON-RPC over TCP with the merge-mining job extensions.
//! [`connection`] owns the wire, [`messages`] the format, [`session`] the
//! per-miner state machine, and [`vardiff`] the difficulty retargeting.

pub mod connection;
pub mod error;
pub mod messages;
pub mod session;
pub mod vardiff;

pub use connection::{Connection, Transport};
pub use error::{RejectReason, StratumError, StratumResult};
pub use session::{Session, SessionHandles, SessionSettings};
