//! Ledger integration tests
//!
//! Chain linkage, signature binding, double-spend refusal and index
//! consistency exercised through the public API.

use data_encoding::HEXLOWER;
use num_bigint::{BigInt, Sign};
use std::collections::HashMap;
use tallychain::core::{Block, Blockchain, ProofOfWork, TXOutput, Transaction};
use tallychain::storage::UTXOSet;
use tallychain::wallet::{hash_pub_key, Wallet};
use tallychain::BlockchainError;
use tempfile::{tempdir, TempDir};

fn new_chain(genesis_address: &str) -> (Blockchain, TempDir) {
    let temp_dir = tempdir().unwrap();
    let blockchain =
        Blockchain::create_blockchain_with_path(genesis_address, temp_dir.path().join("ledger"))
            .unwrap();
    (blockchain, temp_dir)
}

fn indexed(blockchain: &Blockchain) -> UTXOSet {
    let utxo_set = UTXOSet::new(blockchain.clone());
    utxo_set.reindex().unwrap();
    utxo_set
}

fn genesis_block(blockchain: &Blockchain) -> Block {
    blockchain.iterator().last().unwrap().unwrap()
}

#[test]
fn test_chain_linkage_after_sequential_mining() {
    let miner = Wallet::new().unwrap();
    let (blockchain, _dir) = new_chain(&miner.get_address());

    let rounds = 3;
    for _ in 0..rounds {
        let coinbase = Transaction::new_coinbase_tx(&miner.get_address(), "").unwrap();
        blockchain.mine_block(&[coinbase]).unwrap();
    }
    assert_eq!(blockchain.get_best_height().unwrap(), rounds);

    let blocks: Vec<Block> = blockchain.iterator().map(|b| b.unwrap()).collect();
    assert_eq!(blocks.len(), rounds + 1);
    for pair in blocks.windows(2) {
        assert_eq!(pair[0].get_pre_block_hash(), pair[1].get_hash());
        assert_eq!(pair[0].get_height(), pair[1].get_height() + 1);
    }

    let genesis = blocks.last().unwrap();
    assert!(genesis.get_pre_block_hash().is_empty());
    assert_eq!(genesis.get_height(), 0);
    assert!(blocks.iter().all(ProofOfWork::validate));
}

#[test]
fn test_genesis_spend_scenario() {
    let alice = Wallet::new().unwrap();
    let bob = Wallet::new().unwrap();
    let alice_hash = hash_pub_key(alice.get_public_key());
    let bob_hash = hash_pub_key(bob.get_public_key());
    let (blockchain, _dir) = new_chain(&alice.get_address());
    let utxo_set = indexed(&blockchain);

    let genesis_txid = HEXLOWER.encode(genesis_block(&blockchain).get_transactions()[0].get_id());
    let (accumulated, outputs) = utxo_set.find_spendable_outputs(&alice_hash, 10).unwrap();
    assert_eq!(accumulated, 10);
    assert_eq!(outputs, HashMap::from([(genesis_txid, vec![0])]));

    let transfer =
        Transaction::new_utxo_transaction(&alice, &bob.get_address(), 10, &utxo_set).unwrap();
    assert_eq!(transfer.get_vout().len(), 1);
    let block = blockchain.mine_block(&[transfer]).unwrap();
    utxo_set.update(&block).unwrap();

    assert!(utxo_set.find_utxo(&alice_hash).unwrap().is_empty());
    let bob_total: i64 = utxo_set
        .find_utxo(&bob_hash)
        .unwrap()
        .iter()
        .map(TXOutput::get_value)
        .sum();
    assert_eq!(bob_total, 10);
}

#[test]
fn test_insufficient_funds() {
    let alice = Wallet::new().unwrap();
    let bob = Wallet::new().unwrap();
    let (blockchain, _dir) = new_chain(&alice.get_address());
    let utxo_set = indexed(&blockchain);

    let result = Transaction::new_utxo_transaction(&alice, &bob.get_address(), 11, &utxo_set);
    assert!(matches!(
        result,
        Err(BlockchainError::InsufficientFunds {
            required: 11,
            available: 10
        })
    ));
}

#[test]
fn test_tampered_transaction_is_not_mined() {
    let alice = Wallet::new().unwrap();
    let bob = Wallet::new().unwrap();
    let (blockchain, _dir) = new_chain(&alice.get_address());
    let utxo_set = indexed(&blockchain);
    let tip_before = blockchain.get_tip_hash();

    let transfer =
        Transaction::new_utxo_transaction(&alice, &bob.get_address(), 4, &utxo_set).unwrap();
    assert!(blockchain.verify_transaction(&transfer).unwrap());

    // Same signed inputs, but the payment now claims the whole output
    let tampered = Transaction::new(
        transfer.get_vin().to_vec(),
        vec![TXOutput::new(10, &bob.get_address()).unwrap()],
    )
    .unwrap();
    assert!(!blockchain.verify_transaction(&tampered).unwrap());

    let result = blockchain.mine_block(&[tampered]);
    assert!(matches!(result, Err(BlockchainError::Transaction(_))));
    assert_eq!(blockchain.get_tip_hash(), tip_before);
    assert_eq!(blockchain.get_best_height().unwrap(), 0);
}

#[test]
fn test_batch_double_spend_is_refused() {
    let alice = Wallet::new().unwrap();
    let bob = Wallet::new().unwrap();
    let carol = Wallet::new().unwrap();
    let (blockchain, _dir) = new_chain(&alice.get_address());
    let utxo_set = indexed(&blockchain);
    let tip_before = blockchain.get_tip_hash();

    let to_bob =
        Transaction::new_utxo_transaction(&alice, &bob.get_address(), 6, &utxo_set).unwrap();
    let to_carol =
        Transaction::new_utxo_transaction(&alice, &carol.get_address(), 6, &utxo_set).unwrap();
    assert!(blockchain.verify_transaction(&to_bob).unwrap());
    assert!(blockchain.verify_transaction(&to_carol).unwrap());

    let result = blockchain.mine_block(&[to_bob.clone(), to_carol.clone()]);
    assert!(matches!(result, Err(BlockchainError::Transaction(_))));
    assert_eq!(blockchain.get_tip_hash(), tip_before);

    // Once one of them is on the chain, the other spends a consumed output
    let block = blockchain.mine_block(&[to_bob]).unwrap();
    utxo_set.update(&block).unwrap();
    assert!(blockchain.mine_block(&[to_carol]).is_err());
    assert_eq!(blockchain.get_best_height().unwrap(), 1);
}

#[test]
fn test_incremental_update_matches_reindex() {
    let alice = Wallet::new().unwrap();
    let bob = Wallet::new().unwrap();
    let carol = Wallet::new().unwrap();
    let (blockchain, _dir) = new_chain(&alice.get_address());
    let utxo_set = indexed(&blockchain);

    let transfers = [(&alice, &bob, 7), (&bob, &carol, 3), (&alice, &carol, 2)];
    for (from, to, amount) in transfers {
        let transfer =
            Transaction::new_utxo_transaction(from, &to.get_address(), amount, &utxo_set)
                .unwrap();
        let coinbase = Transaction::new_coinbase_tx(&carol.get_address(), "").unwrap();
        let block = blockchain.mine_block(&[coinbase, transfer]).unwrap();
        utxo_set.update(&block).unwrap();
    }

    let incremental = utxo_set.get_entries().unwrap();
    utxo_set.reindex().unwrap();
    assert_eq!(utxo_set.get_entries().unwrap(), incremental);

    assert_eq!(utxo_set.get_balance(&hash_pub_key(alice.get_public_key())).unwrap(), 1);
    assert_eq!(utxo_set.get_balance(&hash_pub_key(bob.get_public_key())).unwrap(), 4);
    assert_eq!(utxo_set.get_balance(&hash_pub_key(carol.get_public_key())).unwrap(), 35);
}

#[test]
fn test_block_and_transaction_round_trip() {
    let alice = Wallet::new().unwrap();
    let bob = Wallet::new().unwrap();
    let (blockchain, _dir) = new_chain(&alice.get_address());
    let utxo_set = indexed(&blockchain);

    let transfer =
        Transaction::new_utxo_transaction(&alice, &bob.get_address(), 3, &utxo_set).unwrap();
    let block = blockchain.mine_block(&[transfer.clone()]).unwrap();

    let decoded_tx = Transaction::deserialize(&transfer.serialize().unwrap()).unwrap();
    assert_eq!(decoded_tx, transfer);
    let decoded_block = Block::deserialize(&block.serialize().unwrap()).unwrap();
    assert_eq!(decoded_block, block);
    assert_eq!(blockchain.get_block(block.get_hash()).unwrap(), Some(block.clone()));
}

#[test]
fn test_proof_of_work_is_bound_to_nonce() {
    let miner = Wallet::new().unwrap();
    let (blockchain, _dir) = new_chain(&miner.get_address());
    let coinbase = Transaction::new_coinbase_tx(&miner.get_address(), "").unwrap();
    let block = blockchain.mine_block(&[coinbase]).unwrap();
    assert!(ProofOfWork::validate(&block));

    let pow = ProofOfWork::new_proof_of_work(&block).unwrap();
    let nonce = block.get_nonce();
    assert_eq!(pow.hash_with_nonce(nonce), block.get_hash());
    assert_ne!(pow.hash_with_nonce(nonce + 1), block.get_hash());

    // The search stops at the first hash under the target
    let target = ProofOfWork::target();
    for earlier in 0..nonce {
        let hash = pow.hash_with_nonce(earlier);
        assert!(BigInt::from_bytes_be(Sign::Plus, &hash) >= target);
    }
}

#[test]
fn test_merkle_proofs_cover_every_transaction() {
    let alice = Wallet::new().unwrap();
    let bob = Wallet::new().unwrap();
    let (blockchain, _dir) = new_chain(&alice.get_address());
    let utxo_set = indexed(&blockchain);

    let transfer =
        Transaction::new_utxo_transaction(&alice, &bob.get_address(), 5, &utxo_set).unwrap();
    let coinbase = Transaction::new_coinbase_tx(&alice.get_address(), "").unwrap();
    let block = blockchain.mine_block(&[coinbase, transfer]).unwrap();

    assert!(block.verify_merkle_root().unwrap());
    for index in 0..block.get_transactions().len() {
        let proof = block.merkle_proof(index).unwrap();
        assert!(proof.verify());
    }
    assert!(block.merkle_proof(2).is_err());
}
