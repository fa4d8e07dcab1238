use crate::core::{MerkleProof, MerkleTree, ProofOfWork, Transaction};
use crate::error::{BlockchainError, Result};
use crate::utils::{current_timestamp, deserialize, serialize};
use data_encoding::HEXLOWER;
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Block {
    timestamp: i64,
    pre_block_hash: Vec<u8>,
    hash: Vec<u8>,
    transactions: Vec<Transaction>,
    nonce: i64,
    height: usize,
}

impl Block {
    /// Assembles a block on top of `pre_block_hash` and mines it
    pub fn new_block(
        pre_block_hash: &[u8],
        transactions: &[Transaction],
        height: usize,
    ) -> Result<Block> {
        if transactions.is_empty() {
            return Err(BlockchainError::InvalidBlock(
                "Block must contain at least one transaction".to_string(),
            ));
        }

        let mut block = Block {
            timestamp: current_timestamp()?,
            pre_block_hash: pre_block_hash.to_vec(),
            hash: vec![],
            transactions: transactions.to_vec(),
            nonce: 0,
            height,
        };

        let (nonce, hash) = ProofOfWork::new_proof_of_work(&block)?.run()?;
        block.nonce = nonce;
        block.hash = hash;
        info!(
            "Mined block {} at height {height}",
            HEXLOWER.encode(block.hash.as_slice())
        );

        Ok(block)
    }

    /// Height-0 block with an empty previous hash
    pub fn generate_genesis_block(transaction: &Transaction) -> Result<Block> {
        Block::new_block(&[], &[transaction.clone()], 0)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        deserialize::<Block>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn is_genesis(&self) -> bool {
        self.pre_block_hash.is_empty()
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        self.transactions.as_slice()
    }

    pub fn get_pre_block_hash(&self) -> &[u8] {
        self.pre_block_hash.as_slice()
    }

    pub fn get_hash(&self) -> &[u8] {
        self.hash.as_slice()
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_nonce(&self) -> i64 {
        self.nonce
    }

    pub fn get_height(&self) -> usize {
        self.height
    }

    pub fn hash_transactions(&self) -> Result<Vec<u8>> {
        Ok(MerkleTree::new(&self.transactions)?.root().to_vec())
    }

    /// Whether the stored hash commits to this block's current transaction list
    pub fn verify_merkle_root(&self) -> Result<bool> {
        let pow = ProofOfWork::new_proof_of_work(self)?;
        Ok(pow.hash_with_nonce(self.nonce) == self.hash)
    }

    pub fn merkle_proof(&self, transaction_index: usize) -> Result<MerkleProof> {
        MerkleTree::new(&self.transactions)?.proof(transaction_index)
    }

    #[cfg(test)]
    pub(crate) fn with_nonce(&self, nonce: i64) -> Block {
        Block {
            nonce,
            ..self.clone()
        }
    }

    #[cfg(test)]
    pub(crate) fn with_transactions(&self, transactions: Vec<Transaction>) -> Block {
        Block {
            transactions,
            ..self.clone()
        }
    }
}
