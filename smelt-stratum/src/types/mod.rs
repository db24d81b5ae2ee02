//! Shared value types.

mod extranonce;

pub use extranonce::{Extranonce1, Extranonce1Allocator, Extranonce2, ExtranonceError};
