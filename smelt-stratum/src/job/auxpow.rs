//! Aux-PoW commitment and proof assembly for merged mining.
//!
//! The base coinbase commits to every live aux chain through an `OP_RETURN`
//! output carrying the merged-mining magic, the root of a small merkle tree
//! of aux block hashes, the slot count, and a tree nonce. When a share meets
//! an aux chain's target, the chain's daemon is handed its own block plus an
//! aux-PoW proof: the parent coinbase, the parent header, and the two merkle
//! branches linking the aux hash to the parent's proof of work.

use bitcoin::hash_types::{BlockHash, TxMerkleNode};
use bitcoin::hashes::{sha256d, Hash};

/// Tag marking a merged-mining commitment inside a script.
pub const MERGED_MINING_MAGIC: [u8; 4] = [0xfa, 0xbe, 0x6d, 0x6d];

/// Tree nonce committed alongside the root. With slot assignment fixed to
/// `chain_id % slots` a rolling nonce buys nothing, so it stays zero.
const TREE_NONCE: u32 = 0;

/// The aux commitment embedded in a job's coinbase.
#[derive(Debug, Clone)]
pub struct AuxCommitment {
    /// Leaf layer of the commitment tree, one slot per power-of-two position.
    /// Unoccupied slots hold the zero hash.
    leaves: Vec<[u8; 32]>,
    /// Slot index occupied by each committed chain, ordered as the chains
    /// were given (chain-id ascending).
    slots: Vec<u32>,
    root: [u8; 32],
}

impl AuxCommitment {
    /// Build the commitment tree for the given aux chains.
    ///
    /// `chains` must be sorted by chain id ascending; each entry is
    /// `(chain_id, aux_block_hash)`. The slot count is the smallest power of
    /// two holding every chain at its `chain_id % slots` position; on a slot
    /// collision the count doubles until every chain fits.
    pub fn build(chains: &[(u32, BlockHash)]) -> Self {
        let mut size = chains.len().next_power_of_two().max(1);
        loop {
            let mut leaves = vec![[0u8; 32]; size];
            let mut occupied = vec![false; size];
            let mut slots = Vec::with_capacity(chains.len());
            let mut collided = false;
            for &(chain_id, hash) in chains {
                let slot = (chain_id as usize) % size;
                if occupied[slot] {
                    collided = true;
                    break;
                }
                occupied[slot] = true;
                leaves[slot] = hash.to_byte_array();
                slots.push(slot as u32);
            }
            if !collided {
                let root = tree_root(&leaves);
                return Self { leaves, slots, root };
            }
            size *= 2;
        }
    }

    pub fn root(&self) -> [u8; 32] {
        self.root
    }

    pub fn size(&self) -> u32 {
        self.leaves.len() as u32
    }

    /// Slot of the `nth` committed chain (in the order given to `build`).
    pub fn slot(&self, nth: usize) -> u32 {
        self.slots[nth]
    }

    /// Merkle branch from slot `index` up to the commitment root.
    pub fn branch(&self, index: u32) -> Vec<[u8; 32]> {
        let mut branch = Vec::new();
        let mut level = self.leaves.clone();
        let mut idx = index as usize;
        while level.len() > 1 {
            branch.push(level[idx ^ 1]);
            let mut next = Vec::with_capacity(level.len() / 2);
            for pair in level.chunks(2) {
                next.push(combine(pair[0], pair[1]));
            }
            level = next;
            idx /= 2;
        }
        branch
    }

    /// The 44-byte commitment payload: magic, root, size, nonce.
    pub fn payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(44);
        out.extend_from_slice(&MERGED_MINING_MAGIC);
        out.extend_from_slice(&self.root);
        out.extend_from_slice(&self.size().to_le_bytes());
        out.extend_from_slice(&TREE_NONCE.to_le_bytes());
        out
    }

    /// The commitment as an unspendable `OP_RETURN` output script.
    pub fn script(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut script = Vec::with_capacity(2 + payload.len());
        script.push(0x6a); // OP_RETURN
        script.push(payload.len() as u8);
        script.extend_from_slice(&payload);
        script
    }
}

/// Serialized aux-PoW proof, spliced into the aux block after its header.
///
/// Wire layout follows the merged-mining standard: parent coinbase tx,
/// parent block hash, coinbase merkle branch (with index mask 0, the coinbase
/// is always leaf zero), commitment-tree branch with the chain's slot index,
/// then the 80-byte parent header.
pub fn serialize_proof(
    parent_coinbase: &[u8],
    parent_hash: BlockHash,
    coinbase_branch: &[TxMerkleNode],
    chain_branch: &[[u8; 32]],
    chain_index: u32,
    parent_header: &[u8; 80],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        parent_coinbase.len() + 32 + (coinbase_branch.len() + chain_branch.len()) * 32 + 100,
    );
    out.extend_from_slice(parent_coinbase);
    out.extend_from_slice(&parent_hash.to_byte_array());

    write_varint(&mut out, coinbase_branch.len() as u64);
    for node in coinbase_branch {
        out.extend_from_slice(&node.to_byte_array());
    }
    out.extend_from_slice(&0u32.to_le_bytes());

    write_varint(&mut out, chain_branch.len() as u64);
    for node in chain_branch {
        out.extend_from_slice(node);
    }
    out.extend_from_slice(&chain_index.to_le_bytes());

    out.extend_from_slice(parent_header);
    out
}

/// Bitcoin CompactSize encoding.
pub fn write_varint(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

fn tree_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks(2) {
            next.push(combine(pair[0], pair[1]));
        }
        level = next;
    }
    level[0]
}

fn combine(left: [u8; 32], right: [u8; 32]) -> [u8; 32] {
    let mut concat = [0u8; 64];
    concat[..32].copy_from_slice(&left);
    concat[32..].copy_from_slice(&right);
    sha256d::Hash::hash(&concat).to_byte_array()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> BlockHash {
        BlockHash::from_byte_array([byte; 32])
    }

    #[test]
    fn test_single_chain_root_is_leaf() {
        let commitment = AuxCommitment::build(&[(0, hash(0x11))]);
        assert_eq!(commitment.size(), 1);
        assert_eq!(commitment.root(), [0x11; 32]);
        assert!(commitment.branch(0).is_empty());
    }

    #[test]
    fn test_slot_count_is_power_of_two() {
        let chains: Vec<_> = (0..3).map(|i| (i, hash(i as u8 + 1))).collect();
        let commitment = AuxCommitment::build(&chains);
        assert_eq!(commitment.size(), 4);
    }

    #[test]
    fn test_colliding_chain_ids_widen_the_tree() {
        // chain ids 0 and 2 both map to slot 0 of a 2-leaf tree
        let commitment = AuxCommitment::build(&[(0, hash(1)), (2, hash(2))]);
        assert_eq!(commitment.size(), 4);
        assert_eq!(commitment.slot(0), 0);
        assert_eq!(commitment.slot(1), 2);
    }

    #[test]
    fn test_branch_reproduces_root() {
        let chains: Vec<_> = (0..4).map(|i| (i, hash(i as u8 + 1))).collect();
        let commitment = AuxCommitment::build(&chains);
        for (nth, &(_, leaf)) in chains.iter().enumerate() {
            let mut idx = commitment.slot(nth);
            let mut current = leaf.to_byte_array();
            for sibling in commitment.branch(commitment.slot(nth)) {
                current = if idx & 1 == 0 {
                    combine(current, sibling)
                } else {
                    combine(sibling, current)
                };
                idx /= 2;
            }
            assert_eq!(current, commitment.root());
        }
    }

    #[test]
    fn test_payload_layout() {
        let commitment = AuxCommitment::build(&[(0, hash(0xaa)), (1, hash(0xbb))]);
        let payload = commitment.payload();
        assert_eq!(payload.len(), 44);
        assert_eq!(&payload[..4], &MERGED_MINING_MAGIC);
        assert_eq!(&payload[4..36], &commitment.root());
        assert_eq!(&payload[36..40], &2u32.to_le_bytes());
        assert_eq!(&payload[40..44], &0u32.to_le_bytes());
    }

    #[test]
    fn test_script_is_op_return() {
        let script = AuxCommitment::build(&[(0, hash(1))]).script();
        assert_eq!(script[0], 0x6a);
        assert_eq!(script[1] as usize, script.len() - 2);
    }

    #[test]
    fn test_varint_boundaries() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 0xfc);
        assert_eq!(buf, vec![0xfc]);
        buf.clear();
        write_varint(&mut buf, 0xfd);
        assert_eq!(buf, vec![0xfd, 0xfd, 0x00]);
        buf.clear();
        write_varint(&mut buf, 0x1_0000);
        assert_eq!(buf, vec![0xfe, 0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_proof_layout() {
        let coinbase = vec![0xcc; 60];
        let header = [0x55_u8; 80];
        let proof = serialize_proof(
            &coinbase,
            hash(0x22),
            &[TxMerkleNode::from_byte_array([0x33; 32])],
            &[[0x44; 32]],
            1,
            &header,
        );
        let mut offset = 0;
        assert_eq!(&proof[..60], &coinbase[..]);
        offset += 60;
        assert_eq!(&proof[offset..offset + 32], &[0x22; 32]);
        offset += 32;
        assert_eq!(proof[offset], 1); // coinbase branch length
        offset += 1 + 32 + 4;
        assert_eq!(proof[offset], 1); // chain branch length
        offset += 1;
        assert_eq!(&proof[offset..offset + 32], &[0x44; 32]);
        offset += 32;
        assert_eq!(&proof[offset..offset + 4], &1u32.to_le_bytes());
        offset += 4;
        assert_eq!(&proof[offset..], &header[..]);
    }
}
