//! # Merkle Trees
//!
//! RFC 6962 style Merkle trees over SHA-256, used for:
//! - the validator set hash (leaves = canonical validator encodings)
//! - the block header hash (leaves = encoded header fields)
//! - block part sets (each part carries an inclusion proof)
//!
//! Leaves and inner nodes are domain-separated with a one-byte prefix so a
//! leaf can never be reinterpreted as an inner node. The root of zero leaves
//! is the hash of the empty string.

use serde::{Deserialize, Serialize};

use crate::hash::{sha256, Hasher};
use crate::{CryptoError, Hash, Result};

/// Domain prefix for leaf nodes.
const LEAF_PREFIX: u8 = 0x00;
/// Domain prefix for inner nodes.
const INNER_PREFIX: u8 = 0x01;

/// Hash a leaf: `SHA-256(0x00 || leaf)`.
#[inline]
pub fn leaf_hash(leaf: &[u8]) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(leaf);
    hasher.finalize()
}

/// Hash an inner node: `SHA-256(0x01 || left || right)`.
#[inline]
pub fn inner_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(&[INNER_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize()
}

/// Largest power of two strictly less than `n`. Requires `n > 1`.
fn split_point(n: usize) -> usize {
    debug_assert!(n > 1);
    let mut k = 1usize;
    while k * 2 < n {
        k *= 2;
    }
    k
}

/// Compute the Merkle root of a list of byte leaves.
///
/// The empty list hashes to `SHA-256("")`, a single leaf to its leaf hash,
/// and larger lists recurse on the split point (largest power of two smaller
/// than the item count).
pub fn merkle_root<T: AsRef<[u8]>>(leaves: &[T]) -> Hash {
    match leaves.len() {
        0 => sha256(b""),
        1 => leaf_hash(leaves[0].as_ref()),
        n => {
            let k = split_point(n);
            let left = merkle_root(&leaves[..k]);
            let right = merkle_root(&leaves[k..]);
            inner_hash(&left, &right)
        }
    }
}

/// An inclusion proof for a single leaf in a Merkle tree.
///
/// `aunts` holds the sibling hashes from the leaf up to the root, in
/// bottom-up order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Total number of leaves in the tree
    pub total: u32,
    /// Zero-based index of the proven leaf
    pub index: u32,
    /// Hash of the proven leaf
    pub leaf_hash: Hash,
    /// Sibling hashes, bottom-up
    pub aunts: Vec<Hash>,
}

impl MerkleProof {
    /// Build proofs for every leaf in the list, returning the root alongside.
    pub fn from_leaves<T: AsRef<[u8]>>(leaves: &[T]) -> (Hash, Vec<MerkleProof>) {
        let total = leaves.len();
        let leaf_hashes: Vec<Hash> = leaves.iter().map(|l| leaf_hash(l.as_ref())).collect();
        let mut proofs: Vec<MerkleProof> = leaf_hashes
            .iter()
            .enumerate()
            .map(|(i, lh)| MerkleProof {
                total: total as u32,
                index: i as u32,
                leaf_hash: *lh,
                aunts: Vec::new(),
            })
            .collect();
        let root = build_proofs(&leaf_hashes, 0, &mut proofs);
        (root, proofs)
    }

    /// Recompute the root implied by this proof.
    pub fn compute_root(&self) -> Hash {
        compute_from_aunts(self.index as usize, self.total as usize, self.leaf_hash, &self.aunts)
    }

    /// Verify this proof against an expected root and leaf content.
    pub fn verify(&self, root: &Hash, leaf: &[u8]) -> Result<()> {
        if self.leaf_hash != leaf_hash(leaf) {
            return Err(CryptoError::InvalidProof("leaf hash mismatch".into()));
        }
        let computed = self.compute_root();
        if &computed != root {
            return Err(CryptoError::InvalidProof(format!(
                "root mismatch: computed {}, expected {}",
                hex::encode(computed),
                hex::encode(root)
            )));
        }
        Ok(())
    }
}

/// Recursively hash the subtree `hashes[..]`, appending each sibling hash to
/// the proofs whose leaves live in the opposite half.
fn build_proofs(hashes: &[Hash], offset: usize, proofs: &mut [MerkleProof]) -> Hash {
    match hashes.len() {
        0 => sha256(b""),
        1 => hashes[0],
        n => {
            let k = split_point(n);
            let left = build_proofs(&hashes[..k], offset, proofs);
            let right = build_proofs(&hashes[k..], offset + k, proofs);
            for proof in proofs.iter_mut() {
                let i = proof.index as usize;
                if i >= offset && i < offset + k {
                    proof.aunts.push(right);
                } else if i >= offset + k && i < offset + n {
                    proof.aunts.push(left);
                }
            }
            inner_hash(&left, &right)
        }
    }
}

fn compute_from_aunts(index: usize, total: usize, leaf: Hash, aunts: &[Hash]) -> Hash {
    match total {
        0 | 1 => leaf,
        n => {
            let Some((sibling, rest)) = aunts.split_last() else {
                return leaf;
            };
            let k = split_point(n);
            if index < k {
                let left = compute_from_aunts(index, k, leaf, rest);
                inner_hash(&left, sibling)
            } else {
                let right = compute_from_aunts(index - k, n - k, leaf, rest);
                inner_hash(sibling, &right)
            }
        }
    }
}
