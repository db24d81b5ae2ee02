//! Merkle branch construction and application.
//!
//! The pool side of the Stratum merkle dance: from the base template's
//! transaction list we precompute the branch a miner needs to climb from its
//! coinbase hash to the block's merkle root, and we climb the same branch
//! ourselves when validating submitted shares.

use bitcoin::hash_types::{TxMerkleNode, Txid};
use bitcoin::hashes::{sha256d, Hash};

/// Compute the merkle branch for the coinbase (leaf index 0).
///
/// `txids` are the non-coinbase transactions in template order. The returned
/// siblings, applied bottom-up with [`apply_branch`], reproduce the block's
/// merkle root from any coinbase hash. Empty input yields an empty branch
/// (the coinbase hash is the root).
pub fn coinbase_branch(txids: &[Txid]) -> Vec<TxMerkleNode> {
    let mut branch = Vec::new();
    let mut level: Vec<[u8; 32]> = txids.iter().map(|t| t.to_byte_array()).collect();

    while !level.is_empty() {
        // The coinbase path's sibling is always the first hash of the level.
        branch.push(TxMerkleNode::from_byte_array(level[0]));

        // Fold the remainder pairwise, duplicating a trailing odd hash.
        let rest = &level[1..];
        let mut next = Vec::with_capacity(rest.len().div_ceil(2));
        let mut i = 0;
        while i < rest.len() {
            let a = rest[i];
            let b = if i + 1 < rest.len() { rest[i + 1] } else { a };
            next.push(combine(a, b));
            i += 2;
        }
        level = next;
    }

    branch
}

/// Climb a merkle branch from the coinbase hash to the root.
pub fn apply_branch(coinbase_hash: [u8; 32], branch: &[TxMerkleNode]) -> TxMerkleNode {
    let mut current = coinbase_hash;
    for sibling in branch {
        current = combine(current, sibling.to_byte_array());
    }
    TxMerkleNode::from_byte_array(current)
}

fn combine(left: [u8; 32], right: [u8; 32]) -> [u8; 32] {
    let mut concat = [0u8; 64];
    concat[..32].copy_from_slice(&left);
    concat[32..].copy_from_slice(&right);
    sha256d::Hash::hash(&concat).to_byte_array()
}
