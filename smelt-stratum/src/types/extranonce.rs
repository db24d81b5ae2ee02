//! Extranonce types for coinbase construction.
//!
//! The coinbase of a merge-mined job carries an eight-byte rolling region
//! split between the server and the client: `extranonce1` is assigned once per
//! session at subscribe time and must be unique among concurrent sessions,
//! while `extranonce2` is chosen by the miner for every share. Together they
//! let a miner vary the merkle root without requesting new work.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

/// Errors arising from extranonce parsing and validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtranonceError {
    #[error("invalid extranonce2 size: {0} (must be 1-8 bytes)")]
    InvalidSize(usize),

    #[error("extranonce2 is {got} bytes, session requires {want}")]
    SizeMismatch { got: usize, want: usize },

    #[error("extranonce2 is not valid hex: {0}")]
    BadHex(String),
}

/// Server-assigned per-session extranonce, four bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extranonce1([u8; 4]);

impl Extranonce1 {
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for Extranonce1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Allocator handing out session extranonces.
///
/// A monotonic counter combined with a random per-process offset; the counter
/// alone guarantees uniqueness modulo 2^32, the offset keeps values from
/// colliding with a previous incarnation of the process that miners may still
/// be submitting against.
#[derive(Debug)]
pub struct Extranonce1Allocator {
    counter: AtomicU32,
}

impl Extranonce1Allocator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU32::new(rand::random()),
        }
    }

    /// Allocate the next extranonce1. Unique among the last 2^32 allocations.
    pub fn next(&self) -> Extranonce1 {
        let value = self.counter.fetch_add(1, Ordering::Relaxed);
        Extranonce1(value.to_be_bytes())
    }
}

impl Default for Extranonce1Allocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Client-chosen extranonce, parsed from the hex field of `mining.submit`.
///
/// Stored as raw bytes with the size fixed by the session's negotiated
/// `extranonce2_size`; serialization order is exactly the submitted bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Extranonce2(Vec<u8>);

impl Extranonce2 {
    /// Parse from the hex string of a `mining.submit`, enforcing the size the
    /// session advertised at subscribe time.
    pub fn from_hex(hex_str: &str, expected_size: usize) -> Result<Self, ExtranonceError> {
        let bytes =
            hex::decode(hex_str).map_err(|e| ExtranonceError::BadHex(e.to_string()))?;
        if bytes.len() != expected_size {
            return Err(ExtranonceError::SizeMismatch {
                got: bytes.len(),
                want: expected_size,
            });
        }
        Ok(Self(bytes))
    }

    /// An all-zero extranonce2 of the given size.
    pub fn zeroed(size: usize) -> Result<Self, ExtranonceError> {
        if size == 0 || size > 8 {
            return Err(ExtranonceError::InvalidSize(size));
        }
        Ok(Self(vec![0u8; size]))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Extranonce2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}
