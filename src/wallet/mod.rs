//! Wallet management and cryptographic operations
//!
//! Key pairs, Base58Check addresses and the on-disk wallet file.

#[allow(clippy::module_inception)]
pub mod wallet;
pub mod wallets;

pub use wallet::{
    address_to_pub_key_hash, convert_address, hash_pub_key, validate_address, Wallet,
    ADDRESS_CHECK_SUM_LEN,
};
pub use wallets::{wallet_file_name, Wallets, WALLET_FILE};
