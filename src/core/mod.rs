//! Core ledger functionality
//!
//! Blocks, transactions, the Merkle commitment, proof-of-work and the
//! append-only chain store.

pub mod block;
pub mod blockchain;
pub mod merkle;
pub mod proof_of_work;
pub mod transaction;

pub use block::Block;
pub use blockchain::{Blockchain, BlockchainIterator, GENESIS_COINBASE_DATA};
pub use merkle::{merkle_root, MerkleProof, MerkleTree, ProofElement};
pub use proof_of_work::{ProofOfWork, MAX_NONCE, TARGET_BITS};
pub use transaction::{TXInput, TXOutput, TXOutputs, Transaction, SUBSIDY};
