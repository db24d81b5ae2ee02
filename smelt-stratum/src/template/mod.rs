//! Block template identity and transport types.
//!
//! Upstream coinservers stream raw template payloads; everything downstream of
//! the watcher treats a template as `(key, bytes)` until job assembly parses
//! it into chain-specific structure (see [`parse`]).

mod parse;

pub use parse::{AuxInfo, BlockTemplate, TemplateRole, TemplateTx};

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

use crate::u256::U256;

/// Errors from template identity parsing and payload decoding.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unknown algorithm: {0}")]
    UnknownAlgo(String),

    #[error("unknown template type: {0}")]
    UnknownTemplateType(String),

    #[error("template payload is not valid JSON: {0}")]
    BadPayload(#[from] serde_json::Error),

    #[error("template field {field}: {reason}")]
    BadField {
        field: &'static str,
        reason: String,
    },

    #[error("{0} template missing required field {1}")]
    MissingField(TemplateType, &'static str),
}

/// Proof-of-work algorithm of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algo {
    Sha256d,
    Scrypt,
}

impl Algo {
    pub fn parse(s: &str) -> Result<Self, TemplateError> {
        match s.to_ascii_lowercase().as_str() {
            "sha256d" | "sha256" => Ok(Algo::Sha256d),
            "scrypt" => Ok(Algo::Scrypt),
            other => Err(TemplateError::UnknownAlgo(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algo::Sha256d => "sha256d",
            Algo::Scrypt => "scrypt",
        }
    }

    /// The target corresponding to difficulty 1 on this algorithm.
    ///
    /// Session share targets are `diff1_target / difficulty`; the constants
    /// are the classic pool diff-1 thresholds (compact 0x1d00ffff for sha256d
    /// chains, 0x1f00ffff-family for scrypt chains).
    pub fn diff1_target(&self) -> U256 {
        let mut bytes = [0u8; 32];
        match self {
            Algo::Sha256d => {
                bytes[4] = 0xff;
                bytes[5] = 0xff;
            }
            Algo::Scrypt => {
                bytes[2] = 0xff;
                bytes[3] = 0xff;
            }
        }
        U256::from_be_bytes(bytes)
    }

    /// Hash an 80-byte header with this chain's proof-of-work function.
    ///
    /// The result is the number the chain compares against its target, so it
    /// is interpreted little-endian like every Bitcoin-family hash.
    pub fn powhash(&self, header: &[u8]) -> U256 {
        match self {
            Algo::Sha256d => {
                use bitcoin::hashes::{sha256d, Hash};
                U256::from_le_bytes(sha256d::Hash::hash(header).to_byte_array())
            }
            Algo::Scrypt => {
                // scrypt(N=1024, r=1, p=1) keyed and salted with the header
                let params = scrypt::Params::new(10, 1, 1, 32)
                    .expect("static scrypt params are valid");
                let mut out = [0u8; 32];
                scrypt::scrypt(header, header, &params, &mut out)
                    .expect("output length is fixed at 32");
                U256::from_le_bytes(out)
            }
        }
    }
}

impl fmt::Display for Algo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a template anchors the job or rides along in the aux commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateType {
    Aux,
    Base,
}

impl TemplateType {
    pub fn parse(s: &str) -> Result<Self, TemplateError> {
        match s.to_ascii_lowercase().as_str() {
            "aux" => Ok(TemplateType::Aux),
            "base" => Ok(TemplateType::Base),
            other => Err(TemplateError::UnknownTemplateType(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateType::Aux => "aux",
            TemplateType::Base => "base",
        }
    }
}

impl fmt::Display for TemplateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a template stream: at most one live template per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct TemplateKey {
    pub algo: Algo,
    pub currency: String,
    pub template_type: TemplateType,
}

impl fmt::Display for TemplateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.algo, self.currency, self.template_type)
    }
}

/// A template in transport form, opaque until job assembly.
#[derive(Debug, Clone)]
pub struct Template {
    pub key: TemplateKey,
    pub data: Vec<u8>,
}
