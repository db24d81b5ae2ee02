//! Merge-mined job assembly and solve detection.
//!
//! A [`TemplateSet`] holds the latest template per key; every template arrival
//! produces a fresh [`Job`] that commits to the single base chain and every
//! live aux chain at once. Sessions and the loopback miner share
//! [`Job::check_solves`] so a winning share is assembled into submittable
//! block bytes exactly one way.

mod auxpow;
mod builder;
mod merkle;

pub use auxpow::AuxCommitment;
pub use merkle::{apply_branch, coinbase_branch};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use bitcoin::hash_types::{BlockHash, TxMerkleNode};
use bitcoin::hashes::{sha256d, Hash};
use thiserror::Error;

use crate::template::{Algo, Template, TemplateError, TemplateKey};
use crate::types::{Extranonce1, Extranonce2};
use crate::u256::U256;

/// Errors from job assembly.
#[derive(Debug, Error)]
pub enum JobError {
    /// No base template has arrived yet; assembly is skipped, not failed.
    #[error("no base template available yet")]
    NoBaseTemplate,

    #[error("conflicting base templates live: {0} and {1}")]
    ConflictingBaseTemplates(String, String),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// A solved block ready for daemon submission.
#[derive(Debug, Clone)]
pub struct BlockSolve {
    /// Proof-of-work hash of the parent header, as a little-endian number.
    pub powhash: U256,
    /// The chain's network target the hash beat.
    pub difficulty: U256,
    pub height: u64,
    pub subsidy: i64,
    /// Serialized block, hex-encoded at the RPC boundary.
    pub data: Vec<u8>,
}

impl BlockSolve {
    /// Hash of the block's 80-byte header prefix.
    ///
    /// Always double-SHA256 regardless of the proof-of-work algorithm; this
    /// is the hash chains index blocks by.
    pub fn block_hash(&self) -> BlockHash {
        let header = &self.data[..80.min(self.data.len())];
        BlockHash::from_byte_array(sha256d::Hash::hash(header).to_byte_array())
    }
}

/// An accepted share, en route to the recorder.
#[derive(Debug, Clone)]
pub struct Share {
    pub username: String,
    pub time: SystemTime,
    /// The session's accepted difficulty, not any chain's network difficulty.
    pub difficulty: f64,
    /// Non-empty only when the share met some chain's network target.
    pub blocks: HashMap<String, Arc<BlockSolve>>,
}

/// How to turn a winning header into a chain's submittable block.
#[derive(Debug)]
enum SolveData {
    /// Base chain: header, then the coinbase and the template's transactions.
    Base { transactions: Vec<Vec<u8>> },
    /// Aux chain: the daemon's block with the aux-PoW proof spliced in after
    /// its header.
    Aux {
        block: Vec<u8>,
        chain_index: u32,
        chain_branch: Vec<[u8; 32]>,
    },
}

/// Per-chain solve parameters carried by a job.
#[derive(Debug)]
struct ChainSolve {
    currency: String,
    target: U256,
    height: u64,
    subsidy: i64,
    data: SolveData,
}

/// An assembled merge-mined work unit.
///
/// Immutable once built; distributed as `Arc<Job>` over the job broadcast.
#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub algo: Algo,
    pub prev_hash: BlockHash,
    pub version: i32,
    pub curtime: u32,
    pub bits: u32,
    /// Coinbase bytes before the extranonce region.
    pub coinbase1: Vec<u8>,
    /// Coinbase bytes after the extranonce region.
    pub coinbase2: Vec<u8>,
    /// Width of the client half of the extranonce region, bytes.
    pub extranonce2_size: usize,
    pub merkle_branch: Vec<TxMerkleNode>,
    /// Network target per live currency.
    pub targets: HashMap<String, U256>,
    /// Per-currency block height.
    pub heights: HashMap<String, u64>,
    chains: Vec<ChainSolve>,
}

impl Job {
    /// Reassemble the full coinbase for a given extranonce pair.
    pub fn coinbase(&self, extranonce1: &Extranonce1, extranonce2: &Extranonce2) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.coinbase1.len() + 4 + extranonce2.as_bytes().len() + self.coinbase2.len(),
        );
        out.extend_from_slice(&self.coinbase1);
        out.extend_from_slice(extranonce1.as_bytes());
        out.extend_from_slice(extranonce2.as_bytes());
        out.extend_from_slice(&self.coinbase2);
        out
    }

    /// Merkle root for a given coinbase serialization.
    pub fn merkle_root(&self, coinbase: &[u8]) -> TxMerkleNode {
        let coinbase_hash = sha256d::Hash::hash(coinbase).to_byte_array();
        merkle::apply_branch(coinbase_hash, &self.merkle_branch)
    }

    /// Serialize the 80-byte base-chain header.
    pub fn header(&self, merkle_root: TxMerkleNode, ntime: u32, nonce: u32) -> [u8; 80] {
        let mut header = [0u8; 80];
        header[0..4].copy_from_slice(&self.version.to_le_bytes());
        header[4..36].copy_from_slice(&self.prev_hash.to_byte_array());
        header[36..68].copy_from_slice(&merkle_root.to_byte_array());
        header[68..72].copy_from_slice(&ntime.to_le_bytes());
        header[72..76].copy_from_slice(&self.bits.to_le_bytes());
        header[76..80].copy_from_slice(&nonce.to_le_bytes());
        header
    }

    /// Proof-of-work hash of a header under the base chain's algorithm.
    pub fn powhash(&self, header: &[u8; 80]) -> U256 {
        self.algo.powhash(header)
    }

    /// Check a header against every chain's network target and assemble the
    /// full block for each chain it solves.
    pub fn check_solves(
        &self,
        coinbase: &[u8],
        header: &[u8; 80],
    ) -> HashMap<String, Arc<BlockSolve>> {
        let powhash = self.powhash(header);
        let mut solves = HashMap::new();
        for chain in &self.chains {
            if powhash > chain.target {
                continue;
            }
            let data = match &chain.data {
                SolveData::Base { transactions } => {
                    let mut out = Vec::new();
                    out.extend_from_slice(header);
                    auxpow::write_varint(&mut out, 1 + transactions.len() as u64);
                    out.extend_from_slice(coinbase);
                    for tx in transactions {
                        out.extend_from_slice(tx);
                    }
                    out
                }
                SolveData::Aux {
                    block,
                    chain_index,
                    chain_branch,
                } => {
                    let parent_hash = BlockHash::from_byte_array(
                        sha256d::Hash::hash(header).to_byte_array(),
                    );
                    let proof = auxpow::serialize_proof(
                        coinbase,
                        parent_hash,
                        &self.merkle_branch,
                        chain_branch,
                        *chain_index,
                        header,
                    );
                    let mut out = Vec::with_capacity(block.len() + proof.len());
                    out.extend_from_slice(&block[..80]);
                    out.extend_from_slice(&proof);
                    out.extend_from_slice(&block[80..]);
                    out
                }
            };
            solves.insert(
                chain.currency.clone(),
                Arc::new(BlockSolve {
                    powhash,
                    difficulty: chain.target,
                    height: chain.height,
                    subsidy: chain.subsidy,
                    data,
                }),
            );
        }
        solves
    }
}

/// Latest-template-per-key store.
///
/// Owned by the single template-listener task; no internal locking.
#[derive(Debug, Default)]
pub struct TemplateSet {
    latest: HashMap<TemplateKey, Template>,
}

impl TemplateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry for the incoming template's key.
    ///
    /// Newest always wins; a base template at a lower height than its
    /// predecessor still replaces it, because the upstream daemon is
    /// authoritative about reorgs.
    pub fn update(&mut self, template: Template) {
        self.latest.insert(template.key.clone(), template);
    }

    /// Assemble a job from every live template.
    pub fn assemble(&self, job_id: String, extranonce2_size: usize) -> Result<Job, JobError> {
        builder::assemble(job_id, self.latest.values(), extranonce2_size)
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}
