//! Merkle Checkpoints
//!
//! Summarizes a run of entries as a Merkle root over their `current_hash`
//! values. Publishing the root out of band lets an auditor detect tail
//! truncation, which the hash chain alone cannot reveal.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::audit::entry::AuditEntry;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Leaf digest for an entry's `current_hash`.
pub fn leaf_hash(current_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(current_hash.as_bytes());
    hex::encode(hasher.finalize())
}

fn combine(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hex::encode(hasher.finalize())
}

// An odd node is paired with itself.
fn next_level(level: &[String]) -> Vec<String> {
    level
        .chunks(2)
        .map(|pair| combine(&pair[0], pair.get(1).unwrap_or(&pair[0])))
        .collect()
}

/// Root over leaf digests, in append order.
pub fn merkle_root(leaves: &[String]) -> Result<String> {
    if leaves.is_empty() {
        return Err(anyhow!("Cannot build Merkle tree from empty entries"));
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }

    let root = level
        .pop()
        .ok_or_else(|| anyhow!("Merkle tree construction produced no root"))?;
    debug!("Merkle root over {} leaves: {}", leaves.len(), root);
    Ok(root)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

/// Inclusion proof: sibling hashes from leaf to root, with the side each
/// sibling sits on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_hash: String,
    pub siblings: Vec<(Side, String)>,
    pub root_hash: String,
}

impl MerkleProof {
    pub fn verify(&self) -> bool {
        let computed = self
            .siblings
            .iter()
            .fold(self.leaf_hash.clone(), |acc, (side, sibling)| match side {
                Side::Left => combine(sibling, &acc),
                Side::Right => combine(&acc, sibling),
            });
        computed == self.root_hash
    }
}

pub fn generate_merkle_proof(leaves: &[String], index: usize) -> Result<MerkleProof> {
    if index >= leaves.len() {
        return Err(anyhow!("Entry index {} out of range ({} entries)", index, leaves.len()));
    }

    let mut level = leaves.to_vec();
    let leaf_hash = level[index].clone();
    let mut position = index;
    let mut siblings = Vec::new();

    while level.len() > 1 {
        let sibling_index = position ^ 1;
        let sibling = level.get(sibling_index).unwrap_or(&level[position]).clone();
        let side = if position % 2 == 0 { Side::Right } else { Side::Left };
        siblings.push((side, sibling));

        level = next_level(&level);
        position /= 2;
    }

    Ok(MerkleProof {
        leaf_hash,
        siblings,
        root_hash: level[0].clone(),
    })
}

/// Anchorable summary of a contiguous run of entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainCheckpoint {
    pub entry_count: usize,
    pub first_sequence: i64,
    pub last_sequence: i64,
    pub first_hash: String,
    pub last_hash: String,
    pub merkle_root: String,
}

impl ChainCheckpoint {
    pub fn summary(&self) -> String {
        format!(
            "Checkpoint #{}..#{}: {} entries, root {}",
            self.first_sequence, self.last_sequence, self.entry_count, self.merkle_root
        )
    }
}

/// Accumulates a checkpoint one entry at a time, holding only leaf
/// digests so a long range never has to be resident in memory.
#[derive(Debug, Default)]
pub struct CheckpointBuilder {
    leaves: Vec<String>,
    first: Option<(i64, String)>,
    last: Option<(i64, String)>,
}

impl CheckpointBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry's leaf index within the checkpoint.
    pub fn push(&mut self, entry: &AuditEntry) -> usize {
        if self.first.is_none() {
            self.first = Some((entry.sequence, entry.current_hash.clone()));
        }
        self.last = Some((entry.sequence, entry.current_hash.clone()));
        self.leaves.push(leaf_hash(&entry.current_hash));
        self.leaves.len() - 1
    }

    pub fn proof(&self, index: usize) -> Result<MerkleProof> {
        generate_merkle_proof(&self.leaves, index)
    }

    pub fn finish(self) -> Result<ChainCheckpoint> {
        let merkle_root = merkle_root(&self.leaves)?;
        let (first, last) = self
            .first
            .zip(self.last)
            .ok_or_else(|| anyhow!("Cannot checkpoint an empty range"))?;

        Ok(ChainCheckpoint {
            entry_count: self.leaves.len(),
            first_sequence: first.0,
            last_sequence: last.0,
            first_hash: first.1,
            last_hash: last.1,
            merkle_root,
        })
    }
}
