use crate::core::{Block, Blockchain, TXOutput, TXOutputs};
use crate::error::{BlockchainError, Result};
use data_encoding::HEXLOWER;
use log::info;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
};
use sled::{Batch, Tree};
use std::collections::{BTreeMap, HashMap};

const UTXO_TREE: &str = "chainstate";

/// Unspent outputs cached in the "chainstate" tree, keyed by raw transaction id.
///
/// Derived entirely from the ledger: `reindex` rebuilds it from scratch, `update`
/// applies one block incrementally.
pub struct UTXOSet {
    blockchain: Blockchain,
}

impl UTXOSet {
    pub fn new(blockchain: Blockchain) -> UTXOSet {
        UTXOSet { blockchain }
    }

    pub fn get_blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    fn utxo_tree(&self) -> Result<Tree> {
        self.blockchain
            .get_db()
            .open_tree(UTXO_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open UTXO tree: {e}")))
    }

    /// Greedily picks outputs locked to `pub_key_hash` until `amount` is covered.
    ///
    /// The returned total may be short of `amount`; callers treat that as
    /// insufficient funds.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: i64,
    ) -> Result<(i64, HashMap<String, Vec<usize>>)> {
        let mut unspent_outputs: HashMap<String, Vec<usize>> = HashMap::new();
        let mut accumulated = 0;

        for item in self.utxo_tree()?.iter() {
            if accumulated >= amount {
                break;
            }
            let (k, v) = item?;
            let txid_hex = HEXLOWER.encode(k.as_ref());
            let outs = TXOutputs::deserialize(v.as_ref())?;

            for (idx, out) in outs.iter() {
                if out.is_locked_with_key(pub_key_hash) && accumulated < amount {
                    accumulated += out.get_value();
                    unspent_outputs
                        .entry(txid_hex.clone())
                        .or_default()
                        .push(idx);
                }
            }
        }
        Ok((accumulated, unspent_outputs))
    }

    /// Every output locked to `pub_key_hash`
    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TXOutput>> {
        let mut utxos = vec![];
        for item in self.utxo_tree()?.iter() {
            let (_, v) = item?;
            let outs = TXOutputs::deserialize(v.as_ref())?;
            utxos.extend(
                outs.iter()
                    .filter(|(_, out)| out.is_locked_with_key(pub_key_hash))
                    .map(|(_, out)| out.clone()),
            );
        }
        Ok(utxos)
    }

    pub fn get_balance(&self, pub_key_hash: &[u8]) -> Result<i64> {
        Ok(self
            .find_utxo(pub_key_hash)?
            .iter()
            .map(TXOutput::get_value)
            .sum())
    }

    /// Number of transactions with at least one unspent output
    pub fn count_transactions(&self) -> Result<u64> {
        let mut counter = 0;
        for item in self.utxo_tree()?.iter() {
            item?;
            counter += 1;
        }
        Ok(counter)
    }

    /// Index contents as an ordered map, raw txid to surviving outputs
    pub fn get_entries(&self) -> Result<BTreeMap<Vec<u8>, TXOutputs>> {
        let mut entries = BTreeMap::new();
        for item in self.utxo_tree()?.iter() {
            let (k, v) = item?;
            entries.insert(k.to_vec(), TXOutputs::deserialize(v.as_ref())?);
        }
        Ok(entries)
    }

    /// Rebuilds the index from a full scan of the ledger.
    ///
    /// Stale keys are removed and fresh entries written in one atomic batch.
    /// Rebuilds are serialized, so the last one to commit saw the newest tip.
    pub fn reindex(&self) -> Result<()> {
        // the scan and the batch must not interleave with another rebuild
        let _guard = self.blockchain.lock_utxo_index();
        let utxo_tree = self.utxo_tree()?;
        let utxo_map = self.blockchain.find_utxo()?;

        let mut batch = Batch::default();
        for item in utxo_tree.iter() {
            let (k, _) = item?;
            if !utxo_map.contains_key(&HEXLOWER.encode(k.as_ref())) {
                batch.remove(k);
            }
        }
        for (txid_hex, outs) in &utxo_map {
            let txid = HEXLOWER.decode(txid_hex.as_bytes()).map_err(|e| {
                BlockchainError::Serialization(format!("Failed to decode transaction ID: {e}"))
            })?;
            batch.insert(txid, outs.serialize()?);
        }
        utxo_tree.apply_batch(batch)?;

        info!(
            "Reindexed UTXO set: {} transactions with unspent outputs",
            utxo_map.len()
        );
        Ok(())
    }

    /// Applies one newly appended block.
    ///
    /// Must run exactly once per block, in chain order. An input whose source
    /// entry is missing aborts the update with no changes written.
    pub fn update(&self, block: &Block) -> Result<()> {
        let _guard = self.blockchain.lock_utxo_index();
        let utxo_tree = self.utxo_tree()?;

        utxo_tree
            .transaction(|tx_db| -> ConflictableTransactionResult<(), BlockchainError> {
                for tx in block.get_transactions() {
                    if !tx.is_coinbase() {
                        for vin in tx.get_vin() {
                            let outs_bytes = tx_db.get(vin.get_txid())?.ok_or_else(|| {
                                ConflictableTransactionError::Abort(BlockchainError::Database(
                                    format!(
                                        "UTXO entry {} not found",
                                        HEXLOWER.encode(vin.get_txid())
                                    ),
                                ))
                            })?;
                            let mut outs = TXOutputs::deserialize(outs_bytes.as_ref())
                                .map_err(ConflictableTransactionError::Abort)?;

                            if let Some(index) = vin.output_index() {
                                outs.remove(index);
                            }

                            if outs.is_empty() {
                                tx_db.remove(vin.get_txid())?;
                            } else {
                                let bytes =
                                    outs.serialize().map_err(ConflictableTransactionError::Abort)?;
                                tx_db.insert(vin.get_txid(), bytes)?;
                            }
                        }
                    }

                    let bytes = TXOutputs::from_outputs(tx.get_vout())
                        .serialize()
                        .map_err(ConflictableTransactionError::Abort)?;
                    tx_db.insert(tx.get_id(), bytes)?;
                }
                Ok(())
            })
            .map_err(|e| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => e.into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Transaction;
    use crate::testnet::test_utils::{create_test_blockchain, signed_transfer};
    use crate::wallet::{hash_pub_key, Wallet};

    #[test]
    fn test_genesis_spendable_outputs() {
        let alice = Wallet::new().unwrap();
        let (blockchain, _dir) = create_test_blockchain(&alice.get_address());
        let utxo_set = UTXOSet::new(blockchain.clone());
        utxo_set.reindex().unwrap();

        let alice_hash = hash_pub_key(alice.get_public_key());
        let (accumulated, outputs) = utxo_set.find_spendable_outputs(&alice_hash, 10).unwrap();
        let genesis_txid = blockchain
            .iterator()
            .next()
            .unwrap()
            .unwrap()
            .get_transactions()[0]
            .get_id()
            .to_vec();

        assert_eq!(accumulated, 10);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[&HEXLOWER.encode(&genesis_txid)], vec![0]);
        assert_eq!(utxo_set.count_transactions().unwrap(), 1);
    }

    #[test]
    fn test_insufficient_accumulation() {
        let alice = Wallet::new().unwrap();
        let (blockchain, _dir) = create_test_blockchain(&alice.get_address());
        let utxo_set = UTXOSet::new(blockchain);
        utxo_set.reindex().unwrap();

        let alice_hash = hash_pub_key(alice.get_public_key());
        let (accumulated, _) = utxo_set.find_spendable_outputs(&alice_hash, 25).unwrap();
        assert_eq!(accumulated, 10);

        let stranger = Wallet::new().unwrap();
        let (accumulated, outputs) = utxo_set
            .find_spendable_outputs(&hash_pub_key(stranger.get_public_key()), 1)
            .unwrap();
        assert_eq!(accumulated, 0);
        assert!(outputs.is_empty());
    }

    #[test]
    fn test_update_keeps_change_index() {
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        let (blockchain, _dir) = create_test_blockchain(&alice.get_address());
        let utxo_set = UTXOSet::new(blockchain.clone());
        utxo_set.reindex().unwrap();

        // pays 4 to bob at index 0, change 6 to alice at index 1
        let transfer = signed_transfer(&blockchain, &alice, &bob, 4);
        let block = blockchain.mine_block(&[transfer.clone()]).unwrap();
        utxo_set.update(&block).unwrap();

        let alice_hash = hash_pub_key(alice.get_public_key());
        assert_eq!(utxo_set.get_balance(&alice_hash).unwrap(), 6);
        assert_eq!(
            utxo_set
                .get_balance(&hash_pub_key(bob.get_public_key()))
                .unwrap(),
            4
        );

        // bob spends his output; alice's change must stay reachable at index 1
        let bob_spend = signed_transfer(&blockchain, &bob, &alice, 4);
        let block = blockchain.mine_block(&[bob_spend]).unwrap();
        utxo_set.update(&block).unwrap();

        let entries = utxo_set.get_entries().unwrap();
        let remaining = &entries[transfer.get_id()];
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining.get(1).unwrap().get_value(), 6);

        let (accumulated, selection) = utxo_set.find_spendable_outputs(&alice_hash, 6).unwrap();
        assert!(accumulated >= 6);
        assert!(selection[&HEXLOWER.encode(transfer.get_id())].contains(&1));
    }

    #[test]
    fn test_update_matches_reindex() {
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        let (blockchain, _dir) = create_test_blockchain(&alice.get_address());
        let utxo_set = UTXOSet::new(blockchain.clone());
        utxo_set.reindex().unwrap();

        let transfer = signed_transfer(&blockchain, &alice, &bob, 3);
        let reward = Transaction::new_coinbase_tx(&bob.get_address(), "").unwrap();
        let block = blockchain.mine_block(&[transfer, reward]).unwrap();
        utxo_set.update(&block).unwrap();
        let incremental = utxo_set.get_entries().unwrap();

        utxo_set.reindex().unwrap();
        assert_eq!(utxo_set.get_entries().unwrap(), incremental);
    }

    #[test]
    fn test_update_with_unknown_input_writes_nothing() {
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        let (blockchain, _dir) = create_test_blockchain(&alice.get_address());
        let utxo_set = UTXOSet::new(blockchain.clone());

        // index left empty, so the spend has no source entry
        let transfer = signed_transfer(&blockchain, &alice, &bob, 3);
        let utxo_tree = blockchain.get_db().open_tree(UTXO_TREE).unwrap();
        utxo_tree.clear().unwrap();

        let block = blockchain.mine_block(&[transfer]).unwrap();
        assert!(utxo_set.update(&block).is_err());
        assert!(utxo_set.get_entries().unwrap().is_empty());
    }

    #[test]
    fn test_reindex_waits_for_index_lock() {
        let alice = Wallet::new().unwrap();
        let (blockchain, _dir) = create_test_blockchain(&alice.get_address());
        let utxo_set = UTXOSet::new(blockchain.clone());

        let guard = blockchain.lock_utxo_index();
        let worker = {
            let utxo_set = UTXOSet::new(blockchain.clone());
            std::thread::spawn(move || utxo_set.reindex())
        };
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert!(utxo_set.get_entries().unwrap().is_empty());

        drop(guard);
        worker.join().unwrap().unwrap();
        assert_eq!(utxo_set.get_entries().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_reindex_ends_at_tip() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let alice = Wallet::new().unwrap();
        let (blockchain, _dir) = create_test_blockchain(&alice.get_address());
        let utxo_set = UTXOSet::new(blockchain.clone());
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let utxo_set = UTXOSet::new(blockchain.clone());
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    utxo_set.reindex().unwrap();
                }
            })
        };

        for _ in 0..3 {
            let reward = Transaction::new_coinbase_tx(&alice.get_address(), "").unwrap();
            blockchain.mine_block(&[reward]).unwrap();
            utxo_set.reindex().unwrap();
        }
        stop.store(true, Ordering::SeqCst);
        worker.join().unwrap();

        let alice_hash = hash_pub_key(alice.get_public_key());
        assert_eq!(utxo_set.get_balance(&alice_hash).unwrap(), 40);
        assert_eq!(utxo_set.get_entries().unwrap().len(), 4);
    }
}
