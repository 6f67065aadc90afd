// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transfer root construction.
//!
//! Leaves are paired left to right in input order and hashed with keccak256.
//! When a level has an odd number of nodes, the last node is paired with the
//! default hash for that depth, where `default[0] = keccak256(bytes32(0))` and
//! `default[d + 1] = keccak256(default[d] ++ default[d])`. A single leaf is its
//! own root. This matches the verifier deployed with the bridge contracts.

use crate::error::{BonderError, BonderResult};
use ethers::types::H256;
use ethers::utils::keccak256;

fn hash_pair(left: &H256, right: &H256) -> H256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_bytes());
    buf[32..].copy_from_slice(right.as_bytes());
    H256::from(keccak256(buf))
}

fn default_hashes(depth: usize) -> Vec<H256> {
    let mut defaults = Vec::with_capacity(depth + 1);
    defaults.push(H256::from(keccak256([0u8; 32])));
    for i in 0..depth {
        let next = hash_pair(&defaults[i], &defaults[i]);
        defaults.push(next);
    }
    defaults
}

fn tree_depth(leaves: usize) -> usize {
    let mut depth = 0;
    let mut size = leaves;
    while size > 1 {
        size = size / 2 + size % 2;
        depth += 1;
    }
    depth
}

/// Inclusion proof for one leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub index: usize,
    pub total_leaves: usize,
    pub siblings: Vec<H256>,
}

/// Merkle tree over an ordered list of transfer ids. Keeps every level so
/// proofs are cheap.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<H256>>,
    defaults: Vec<H256>,
}

impl MerkleTree {
    pub fn new(leaves: &[H256]) -> BonderResult<Self> {
        if leaves.is_empty() {
            return Err(BonderError::InternalError(
                "cannot build a merkle tree without leaves".into(),
            ));
        }
        let defaults = default_hashes(tree_depth(leaves.len()));
        let mut levels = vec![leaves.to_vec()];
        let mut depth = 0;
        while levels[depth].len() > 1 {
            let row = &levels[depth];
            let next = row
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => hash_pair(left, right),
                    [last] => hash_pair(last, &defaults[depth]),
                    _ => unreachable!("chunks(2) yields one or two items"),
                })
                .collect::<Vec<_>>();
            levels.push(next);
            depth += 1;
        }
        Ok(Self { levels, defaults })
    }

    pub fn root(&self) -> H256 {
        // levels always ends with a single node
        self.levels[self.levels.len() - 1][0]
    }

    pub fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    pub fn leaves(&self) -> &[H256] {
        &self.levels[0]
    }

    pub fn proof(&self, index: usize) -> BonderResult<MerkleProof> {
        let total_leaves = self.levels[0].len();
        if index >= total_leaves {
            return Err(BonderError::InternalError(format!(
                "leaf index {} out of range for {} leaves",
                index, total_leaves
            )));
        }
        let mut siblings = Vec::with_capacity(self.depth());
        let mut i = index;
        for (depth, row) in self.levels[..self.depth()].iter().enumerate() {
            let sibling = if i % 2 == 1 {
                row[i - 1]
            } else {
                row.get(i + 1).copied().unwrap_or(self.defaults[depth])
            };
            siblings.push(sibling);
            i /= 2;
        }
        Ok(MerkleProof {
            index,
            total_leaves,
            siblings,
        })
    }

    /// Proof for the first occurrence of `leaf`.
    pub fn proof_for(&self, leaf: &H256) -> BonderResult<MerkleProof> {
        let index = self.levels[0]
            .iter()
            .position(|l| l == leaf)
            .ok_or_else(|| BonderError::InternalError(format!("{:?} is not a leaf", leaf)))?;
        self.proof(index)
    }
}

pub fn build_root(ids: &[H256]) -> BonderResult<H256> {
    Ok(MerkleTree::new(ids)?.root())
}

pub fn verify_proof(root: &H256, leaf: &H256, proof: &MerkleProof) -> bool {
    if proof.total_leaves == 0 || proof.index >= proof.total_leaves {
        return false;
    }
    if proof.siblings.len() != tree_depth(proof.total_leaves) {
        return false;
    }
    let mut computed = *leaf;
    let mut index = proof.index;
    for sibling in &proof.siblings {
        computed = if index & 1 == 1 {
            hash_pair(sibling, &computed)
        } else {
            hash_pair(&computed, sibling)
        };
        index >>= 1;
    }
    &computed == root
}

/// Recompute the root from a stored id list and compare with the observed one.
pub fn check_root(expected: &H256, ids: &[H256]) -> BonderResult<()> {
    let computed = build_root(ids)?;
    if &computed != expected {
        return Err(BonderError::MerkleRootMismatch {
            expected: *expected,
            computed,
        });
    }
    Ok(())
}
