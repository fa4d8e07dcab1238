//! # tallychain
//!
//! A small UTXO ledger: proof-of-work blocks, ECDSA P-256 signed transfers,
//! a persistent unspent-output index and a gossip protocol that lets nodes
//! exchange inventories, blocks and pending transactions.
//!
//! ## Layout
//! - `core/`: blocks, transactions, Merkle roots, proof-of-work, the chain store
//! - `storage/`: the unspent-output index, the pending pool, download queue
//! - `network/`: message framing, peer registry, node server
//! - `wallet/`: key pairs, addresses, the wallet file
//! - `config/`: environment-driven node settings
//! - `utils/`: hashing, signing, Base58 and bincode helpers
//! - `cli/`: argument parsing for the binary

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod storage;
pub mod utils;
pub mod wallet;

#[cfg(test)]
pub mod testnet;

pub use cli::{Command, Opt};
pub use config::{Config, GLOBAL_CONFIG};
pub use core::{
    Block, Blockchain, MerkleProof, MerkleTree, ProofOfWork, TXInput, TXOutput, TXOutputs,
    Transaction, SUBSIDY, TARGET_BITS,
};
pub use error::{BlockchainError, Result};
pub use network::{
    send_tx, Node, Nodes, Package, Server, ServerConfig, CENTRAL_NODE, TRANSACTION_THRESHOLD,
};
pub use storage::{BlockInTransit, MemoryPool, UTXOSet};
pub use utils::{
    base58_decode, base58_encode, current_timestamp, ecdsa_p256_sha256_sign_digest,
    ecdsa_p256_sha256_sign_verify, new_key_pair, ripemd160_digest, sha256_digest,
};
pub use wallet::{
    address_to_pub_key_hash, convert_address, hash_pub_key, validate_address, Wallet, Wallets,
    ADDRESS_CHECK_SUM_LEN,
};
