//! Test utilities for ledger and node tests

use crate::core::{Blockchain, Transaction};
use crate::storage::UTXOSet;
use crate::wallet::Wallet;
use tempfile::TempDir;

/// Loopback port nothing listens on
pub const UNREACHABLE_PEER: &str = "127.0.0.1:1";

/// Create a ledger in a fresh temporary directory, genesis reward to `address`
pub fn create_test_blockchain(address: &str) -> (Blockchain, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let blockchain = Blockchain::create_blockchain_with_path(address, temp_dir.path()).unwrap();
    (blockchain, temp_dir)
}

/// Build and sign a transfer against a freshly rebuilt index
pub fn signed_transfer(
    blockchain: &Blockchain,
    from: &Wallet,
    to: &Wallet,
    amount: i64,
) -> Transaction {
    let utxo_set = UTXOSet::new(blockchain.clone());
    utxo_set.reindex().unwrap();
    Transaction::new_utxo_transaction(from, &to.get_address(), amount, &utxo_set).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_blockchain() {
        let alice = Wallet::new().unwrap();
        let (blockchain, _temp_dir) = create_test_blockchain(&alice.get_address());
        assert_eq!(blockchain.get_best_height().unwrap(), 0);
    }

    #[test]
    fn test_signed_transfer_verifies() {
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        let (blockchain, _temp_dir) = create_test_blockchain(&alice.get_address());

        let transfer = signed_transfer(&blockchain, &alice, &bob, 4);
        assert!(blockchain.verify_transaction(&transfer).unwrap());
    }
}
