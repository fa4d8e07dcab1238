use crate::core::Transaction;
use crate::error::{BlockchainError, Result};
use crate::utils::sha256_digest;
use serde::{Deserialize, Serialize};

/// Binary hash tree over transaction ids.
///
/// Every level is kept so inclusion proofs can be read off directly. A level
/// with an odd number of nodes pairs its last node with itself, and a single
/// leaf is still hashed once with itself, so the root is never a raw id.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<Vec<u8>>>,
}

/// Inclusion proof for one leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf: Vec<u8>,
    pub root: Vec<u8>,
    pub path: Vec<ProofElement>,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofElement {
    pub hash: Vec<u8>,
    /// true when the sibling sits to the right of the running hash
    pub is_right: bool,
}

impl MerkleTree {
    pub fn new(transactions: &[Transaction]) -> Result<MerkleTree> {
        let ids: Vec<Vec<u8>> = transactions.iter().map(|tx| tx.get_id().to_vec()).collect();
        MerkleTree::from_hashes(&ids)
    }

    pub fn from_hashes(hashes: &[Vec<u8>]) -> Result<MerkleTree> {
        if hashes.is_empty() {
            return Err(BlockchainError::InvalidBlock(
                "Cannot build a Merkle tree without leaves".to_string(),
            ));
        }

        let mut levels = vec![hashes.to_vec()];
        loop {
            let current = &levels[levels.len() - 1];
            let next: Vec<Vec<u8>> = current
                .chunks(2)
                // an odd node at the end is paired with itself
                .map(|pair| hash_pair(&pair[0], &pair[pair.len() - 1]))
                .collect();
            let done = next.len() == 1;
            levels.push(next);
            if done {
                break;
            }
        }

        Ok(MerkleTree { levels })
    }

    pub fn root(&self) -> &[u8] {
        // from_hashes always pushes a final single-node level
        self.levels[self.levels.len() - 1][0].as_slice()
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    pub fn proof(&self, index: usize) -> Result<MerkleProof> {
        if index >= self.leaf_count() {
            return Err(BlockchainError::InvalidBlock(format!(
                "Leaf index {index} out of bounds ({} leaves)",
                self.leaf_count()
            )));
        }

        let mut path = vec![];
        let mut position = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = if position % 2 == 0 {
                level.get(position + 1).unwrap_or(&level[position])
            } else {
                &level[position - 1]
            };
            path.push(ProofElement {
                hash: sibling.clone(),
                is_right: position % 2 == 0,
            });
            position /= 2;
        }

        Ok(MerkleProof {
            leaf: self.levels[0][index].clone(),
            root: self.root().to_vec(),
            path,
            index,
        })
    }
}

impl MerkleProof {
    pub fn verify(&self) -> bool {
        let computed = self.path.iter().fold(self.leaf.clone(), |acc, element| {
            if element.is_right {
                hash_pair(&acc, &element.hash)
            } else {
                hash_pair(&element.hash, &acc)
            }
        });
        computed == self.root
    }
}

/// Merkle root over the ids of `transactions`
pub fn merkle_root(transactions: &[Transaction]) -> Result<Vec<u8>> {
    Ok(MerkleTree::new(transactions)?.root().to_vec())
}

/// Double SHA-256 of `left || right`
fn hash_pair(left: &[u8], right: &[u8]) -> Vec<u8> {
    let mut combined = Vec::with_capacity(left.len() + right.len());
    combined.extend_from_slice(left);
    combined.extend_from_slice(right);
    sha256_digest(&sha256_digest(&combined))
}
