//! Error types for the Stratum v1 server.

use thiserror::Error;

/// Stratum protocol errors that end a connection.
#[derive(Error, Debug)]
pub enum StratumError {
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid message format received from the miner
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// Connection closed by the peer
    #[error("connection closed")]
    Disconnected,

    /// No inbound message within the idle window
    #[error("idle timeout")]
    IdleTimeout,
}

/// Convenient Result type for Stratum operations.
pub type StratumResult<T> = Result<T, StratumError>;

/// Share and method reject codes, per the de facto Stratum v1 convention.
///
/// Rejects are protocol-level replies, not connection errors: the miner gets
/// an `[code, message, null]` error object and the session continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Unknown method or malformed parameters.
    Other,
    JobNotFound,
    Duplicate,
    LowDifficulty,
    Unauthorized,
    NotSubscribed,
}

impl RejectReason {
    pub fn code(&self) -> i64 {
        match self {
            RejectReason::Other => 20,
            RejectReason::JobNotFound => 21,
            RejectReason::Duplicate => 22,
            RejectReason::LowDifficulty => 23,
            RejectReason::Unauthorized => 24,
            RejectReason::NotSubscribed => 25,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::Other => "other",
            RejectReason::JobNotFound => "job-not-found",
            RejectReason::Duplicate => "duplicate",
            RejectReason::LowDifficulty => "low-difficulty",
            RejectReason::Unauthorized => "unauthorized",
            RejectReason::NotSubscribed => "not-subscribed",
        }
    }
}
