use crate::core::{merkle_root, Block};
use crate::error::{BlockchainError, Result};
use crate::utils::sha256_digest;
use data_encoding::HEXLOWER;
use log::{debug, info};
use num_bigint::{BigInt, Sign};
use std::ops::ShlAssign;

/// Fixed difficulty: a valid hash has this many leading zero bits
pub const TARGET_BITS: u32 = 16;

/// Upper bound on the nonce search
pub const MAX_NONCE: i64 = i64::MAX;

pub struct ProofOfWork<'a> {
    block: &'a Block,
    merkle_root: Vec<u8>,
    target: BigInt,
}

impl<'a> ProofOfWork<'a> {
    pub fn new_proof_of_work(block: &'a Block) -> Result<ProofOfWork<'a>> {
        let merkle_root = merkle_root(block.get_transactions())?;
        Ok(ProofOfWork {
            block,
            merkle_root,
            target: ProofOfWork::target(),
        })
    }

    /// `2^(256 - TARGET_BITS)`
    pub fn target() -> BigInt {
        let mut target = BigInt::from(1);
        target.shl_assign(256 - TARGET_BITS);
        target
    }

    /// Recomputes the block hash from its stored nonce and checks it against the target
    pub fn validate(block: &Block) -> bool {
        let pow = match ProofOfWork::new_proof_of_work(block) {
            Ok(pow) => pow,
            Err(_) => return false,
        };
        let hash = sha256_digest(pow.prepare_data(block.get_nonce()).as_slice());
        BigInt::from_bytes_be(Sign::Plus, hash.as_slice()) < pow.target
    }

    /// Hash the block header would have with `nonce`
    pub fn hash_with_nonce(&self, nonce: i64) -> Vec<u8> {
        sha256_digest(self.prepare_data(nonce).as_slice())
    }

    fn prepare_data(&self, nonce: i64) -> Vec<u8> {
        let mut data_bytes = vec![];
        data_bytes.extend(self.block.get_pre_block_hash());
        data_bytes.extend(self.merkle_root.as_slice());
        data_bytes.extend(self.block.get_timestamp().to_be_bytes());
        data_bytes.extend((TARGET_BITS as i64).to_be_bytes());
        data_bytes.extend(nonce.to_be_bytes());
        data_bytes
    }

    pub fn run(&self) -> Result<(i64, Vec<u8>)> {
        self.run_with_limit(MAX_NONCE)
    }

    /// Searches nonces `0..max_nonce` for a hash below the target
    pub fn run_with_limit(&self, max_nonce: i64) -> Result<(i64, Vec<u8>)> {
        info!(
            "Mining block at height {} (target bits {TARGET_BITS})",
            self.block.get_height()
        );
        let mut nonce = 0;
        while nonce < max_nonce {
            let hash = self.hash_with_nonce(nonce);
            if BigInt::from_bytes_be(Sign::Plus, hash.as_slice()) < self.target {
                debug!("Found nonce {nonce}: {}", HEXLOWER.encode(hash.as_slice()));
                return Ok((nonce, hash));
            }
            nonce += 1;
        }
        Err(BlockchainError::Mining(format!(
            "No valid nonce below {max_nonce}"
        )))
    }
}
