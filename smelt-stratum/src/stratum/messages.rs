//! Stratum v1 message types and JSON-RPC serialization.
//!
//! This module defines the wire format for Stratum v1 protocol messages using
//! serde for JSON serialization. Messages follow the JSON-RPC format with
//! some Stratum-specific conventions: notifications carry `id: null` rather
//! than omitting the field, and errors are `[code, message, traceback]`
//! triples rather than structured objects.

use bitcoin::BlockHash;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::RejectReason;
use crate::job::Job;
use crate::types::Extranonce1;

/// JSON-RPC message envelope.
///
/// Miners send requests with numeric or string ids; the server echoes the id
/// verbatim in its response. Server-to-miner notifications are requests with
/// a null id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request or notification
    Request {
        /// Message ID (null for notifications), echoed verbatim in replies
        id: Value,
        /// Method name (e.g., "mining.submit")
        method: String,
        /// Method parameters
        params: Value,
    },

    /// Response to a request
    Response {
        /// Message ID matching the request
        id: Value,
        /// Result value (null on failure)
        result: Value,
        /// `[code, message, traceback]` triple (null on success)
        error: Value,
    },
}

impl JsonRpcMessage {
    /// A successful response echoing the request id.
    pub fn result(id: Value, result: Value) -> Self {
        JsonRpcMessage::Response {
            id,
            result,
            error: Value::Null,
        }
    }

    /// A reject response with a Stratum error triple.
    pub fn reject(id: Value, reason: RejectReason) -> Self {
        JsonRpcMessage::Response {
            id,
            result: Value::Null,
            error: json!([reason.code(), reason.message(), Value::Null]),
        }
    }

    /// A notification (request with a null id).
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: Value::Null,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, JsonRpcMessage::Request { id: Value::Null, .. })
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request { method, .. } => Some(method),
            JsonRpcMessage::Response { .. } => None,
        }
    }
}

/// Parameters of `mining.subscribe`.
#[derive(Debug, Clone, Default)]
pub struct SubscribeParams {
    pub user_agent: Option<String>,
    pub session_hint: Option<String>,
}

impl SubscribeParams {
    /// Both params are optional; miners send anywhere from zero to two.
    pub fn from_params(params: &[Value]) -> Self {
        Self {
            user_agent: params.first().and_then(|v| v.as_str()).map(String::from),
            session_hint: params.get(1).and_then(|v| v.as_str()).map(String::from),
        }
    }
}

/// Parameters of `mining.authorize`.
#[derive(Debug, Clone)]
pub struct AuthorizeParams {
    pub username: String,
    pub password: String,
}

impl AuthorizeParams {
    pub fn from_params(params: &[Value]) -> Result<Self, String> {
        let username = params
            .first()
            .and_then(|v| v.as_str())
            .ok_or("username not a string")?
            .to_string();
        let password = params
            .get(1)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(Self { username, password })
    }
}

/// Parameters of `mining.submit`.
///
/// Hex fields are kept in raw form for the deduplication key and parsed into
/// integers for validation.
#[derive(Debug, Clone)]
pub struct SubmitParams {
    pub username: String,
    pub job_id: String,
    pub extranonce2: String,
    pub ntime: u32,
    pub nonce: u32,
}

impl SubmitParams {
    /// Parse from the Stratum JSON array. Manual parsing for better error
    /// context than serde tuple structs.
    pub fn from_params(params: &[Value]) -> Result<Self, String> {
        if params.len() < 5 {
            return Err("mining.submit params too short".to_string());
        }
        let field = |i: usize, name: &str| -> Result<&str, String> {
            params[i]
                .as_str()
                .ok_or_else(|| format!("{name} not a string"))
        };
        let ntime_str = field(3, "ntime")?;
        let nonce_str = field(4, "nonce")?;
        Ok(Self {
            username: field(0, "username")?.to_string(),
            job_id: field(1, "job_id")?.to_string(),
            extranonce2: field(2, "extranonce2")?.to_ascii_lowercase(),
            ntime: u32::from_str_radix(ntime_str, 16).map_err(|e| format!("ntime hex: {e}"))?,
            nonce: u32::from_str_radix(nonce_str, 16).map_err(|e| format!("nonce hex: {e}"))?,
        })
    }
}

/// Build the `mining.subscribe` result:
/// `[[["mining.notify", <subid>]], extranonce1, extranonce2_size]`.
pub fn subscribe_result(extranonce1: &Extranonce1, extranonce2_size: usize) -> Value {
    let e1 = extranonce1.to_string();
    json!([[["mining.notify", e1.clone()]], e1, extranonce2_size])
}

/// Build a `mining.set_difficulty` notification.
pub fn set_difficulty(difficulty: f64) -> JsonRpcMessage {
    JsonRpcMessage::notification("mining.set_difficulty", json!([difficulty]))
}

/// Build a `mining.notify` notification for a job.
pub fn notify(job: &Job, clean_jobs: bool) -> JsonRpcMessage {
    let branches: Vec<String> = job
        .merkle_branch
        .iter()
        .map(|node| {
            use bitcoin::hashes::Hash;
            hex::encode(node.to_byte_array())
        })
        .collect();
    JsonRpcMessage::notification(
        "mining.notify",
        json!([
            job.id,
            encode_prev_hash(&job.prev_hash),
            hex::encode(&job.coinbase1),
            hex::encode(&job.coinbase2),
            branches,
            format!("{:08x}", job.version),
            format!("{:08x}", job.bits),
            format!("{:08x}", job.curtime),
            clean_jobs
        ]),
    )
}

/// Encode a block hash in Stratum's "word-swapped" order.
///
/// Stratum transmits the previous block hash as eight 4-byte words: the words
/// run in internal little-endian order but the bytes within each word are
/// hex-encoded big-endian. A historical accident of 32-bit miner firmware,
/// preserved forever by the protocol.
pub fn encode_prev_hash(hash: &BlockHash) -> String {
    use bitcoin::hashes::Hash;
    let mut bytes = hash.to_byte_array();
    for chunk in bytes.chunks_mut(4) {
        chunk.reverse();
    }
    hex::encode(bytes)
}
