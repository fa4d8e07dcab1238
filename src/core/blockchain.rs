// The ledger store: every block keyed by its hash in the "blocks" tree, plus a
// sentinel key naming the current tip. Appending a block and moving the tip
// happen inside one sled transaction so readers never see a tip without its block.

use crate::core::transaction::PrevTransactions;
use crate::core::{Block, TXOutputs, Transaction};
use crate::error::{BlockchainError, Result};
use data_encoding::HEXLOWER;
use log::{info, warn};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::{Db, Tree};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

const TIP_BLOCK_HASH_KEY: &str = "tip_block_hash";
const BLOCKS_TREE: &str = "blocks";

/// Data carried by the genesis coinbase input
pub const GENESIS_COINBASE_DATA: &str =
    "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

#[derive(Clone)]
pub struct Blockchain {
    // cached copy of the persisted tip, only written while a block append commits
    tip_hash: Arc<RwLock<Vec<u8>>>,
    // held across every UTXO index rebuild or update
    utxo_lock: Arc<Mutex<()>>,
    db: Db,
    db_path: PathBuf,
}

impl Blockchain {
    /// Ledger location for a node: `<data_dir>/node_<id>`, or `<data_dir>` itself
    pub fn node_db_path(data_dir: impl AsRef<Path>, node_id: Option<&str>) -> PathBuf {
        match node_id {
            Some(id) => data_dir.as_ref().join(format!("node_{id}")),
            None => data_dir.as_ref().to_path_buf(),
        }
    }

    /// Creates a fresh ledger whose genesis block pays the subsidy to `genesis_address`
    pub fn create_blockchain_with_path(
        genesis_address: &str,
        db_path: impl AsRef<Path>,
    ) -> Result<Blockchain> {
        info!("Creating genesis block for address: {genesis_address}");
        let coinbase_tx = Transaction::new_coinbase_tx(genesis_address, GENESIS_COINBASE_DATA)?;
        Blockchain::genesis(coinbase_tx, db_path)
    }

    /// Creates and appends the height-0 block. Fails if the store already holds a chain.
    pub fn genesis(coinbase_tx: Transaction, db_path: impl AsRef<Path>) -> Result<Blockchain> {
        if !coinbase_tx.is_coinbase() {
            return Err(BlockchainError::Transaction(
                "Genesis block needs a coinbase transaction".to_string(),
            ));
        }

        let path = db_path.as_ref().to_path_buf();
        let db = sled::open(&path)
            .map_err(|e| BlockchainError::Database(format!("Failed to open database: {e}")))?;
        let blocks_tree = db.open_tree(BLOCKS_TREE)?;
        if blocks_tree.get(TIP_BLOCK_HASH_KEY)?.is_some() {
            return Err(BlockchainError::Database(format!(
                "Blockchain already exists at {}",
                path.display()
            )));
        }

        let blockchain = Blockchain {
            tip_hash: Arc::new(RwLock::new(vec![])),
            utxo_lock: Arc::new(Mutex::new(())),
            db,
            db_path: path,
        };
        let block = Block::generate_genesis_block(&coinbase_tx)?;
        blockchain.add_block(&block)?;
        Ok(blockchain)
    }

    /// Opens an existing ledger
    pub fn new_blockchain_with_path(db_path: impl AsRef<Path>) -> Result<Blockchain> {
        let path = db_path.as_ref().to_path_buf();
        let db = sled::open(&path)
            .map_err(|e| BlockchainError::Database(format!("Failed to open database: {e}")))?;
        let blocks_tree = db.open_tree(BLOCKS_TREE)?;

        let tip_hash = blocks_tree.get(TIP_BLOCK_HASH_KEY)?.ok_or_else(|| {
            BlockchainError::Database(format!(
                "No existing blockchain found at {}. Create one first.",
                path.display()
            ))
        })?;

        Ok(Blockchain {
            tip_hash: Arc::new(RwLock::new(tip_hash.to_vec())),
            utxo_lock: Arc::new(Mutex::new(())),
            db,
            db_path: path,
        })
    }

    fn blocks_tree(&self) -> Result<Tree> {
        self.db
            .open_tree(BLOCKS_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open blocks tree: {e}")))
    }

    pub fn get_db(&self) -> &Db {
        &self.db
    }

    pub fn get_db_path(&self) -> &Path {
        self.db_path.as_path()
    }

    /// Exclusive access to the UTXO index for the lifetime of the guard
    pub(crate) fn lock_utxo_index(&self) -> MutexGuard<'_, ()> {
        self.utxo_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_tip_hash(&self) -> Vec<u8> {
        self.tip_hash
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Persists `block` and advances the tip if it is higher than the current one.
    ///
    /// Returns whether the tip moved. A block already in the store is a no-op.
    pub fn add_block(&self, block: &Block) -> Result<bool> {
        let blocks_tree = self.blocks_tree()?;
        let block_hash = block.get_hash().to_vec();
        let block_data = block.serialize()?;
        let height = block.get_height();

        // Writers serialize on the cached tip so it is updated with the commit
        let mut cached_tip = self.tip_hash.write().unwrap_or_else(PoisonError::into_inner);

        let outcome = blocks_tree
            .transaction(|tx_db| -> ConflictableTransactionResult<Option<bool>, BlockchainError> {
                if tx_db.get(block_hash.as_slice())?.is_some() {
                    return Ok(None);
                }
                tx_db.insert(block_hash.as_slice(), block_data.as_slice())?;

                let advance = match tx_db.get(TIP_BLOCK_HASH_KEY)? {
                    None => true,
                    Some(tip_hash) => {
                        let (_, tip_block) = read_block(tx_db, tip_hash.as_ref())?;
                        height > tip_block.get_height()
                    }
                };
                if advance {
                    tx_db.insert(TIP_BLOCK_HASH_KEY, block_hash.as_slice())?;
                }
                Ok(Some(advance))
            })
            .map_err(map_transaction_error)?;

        let hash_hex = HEXLOWER.encode(block_hash.as_slice());
        match outcome {
            None => {
                info!("Block {hash_hex} already stored");
                Ok(false)
            }
            Some(true) => {
                *cached_tip = block_hash;
                info!("Added block {hash_hex} at height {height}, tip advanced");
                Ok(true)
            }
            Some(false) => {
                info!("Added block {hash_hex} at height {height}, tip unchanged");
                Ok(false)
            }
        }
    }

    /// Reads the tip hash and the tip block in one transaction
    fn tip_snapshot(&self) -> Result<(Vec<u8>, Block)> {
        let blocks_tree = self.blocks_tree()?;
        blocks_tree
            .transaction(|tx_db| -> ConflictableTransactionResult<(Vec<u8>, Block), BlockchainError> {
                let tip_hash = tx_db.get(TIP_BLOCK_HASH_KEY)?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(BlockchainError::Database(
                        "Tip hash not found".to_string(),
                    ))
                })?;
                read_block(tx_db, tip_hash.as_ref())
            })
            .map_err(map_transaction_error)
    }

    /// Verifies `transactions`, mines them into a block on the current tip and appends it.
    ///
    /// Refuses the whole batch, leaving the tip untouched, if any transaction
    /// fails verification or spends an output twice or an already spent output.
    /// The proof-of-work search runs without holding any lock.
    pub fn mine_block(&self, transactions: &[Transaction]) -> Result<Block> {
        for transaction in transactions {
            if !self.verify_transaction(transaction)? {
                return Err(BlockchainError::Transaction(format!(
                    "Invalid transaction {}",
                    HEXLOWER.encode(transaction.get_id())
                )));
            }
        }
        self.check_for_double_spending(transactions)?;

        let (tip_hash, tip_block) = self.tip_snapshot()?;
        let block = Block::new_block(&tip_hash, transactions, tip_block.get_height() + 1)?;
        self.commit_mined_block(block)
    }

    /// Appends a freshly mined block. If a block at the same height or higher
    /// landed while mining, the block is kept off the best chain and
    /// `StaleBlock` is returned.
    fn commit_mined_block(&self, block: Block) -> Result<Block> {
        if self.add_block(&block)? {
            return Ok(block);
        }
        let hash_hex = HEXLOWER.encode(block.get_hash());
        warn!("Mined block {hash_hex} did not extend the tip; a higher block arrived while mining");
        Err(BlockchainError::StaleBlock(format!(
            "block {hash_hex} at height {} is not on the best chain",
            block.get_height()
        )))
    }

    fn check_for_double_spending(&self, transactions: &[Transaction]) -> Result<()> {
        let mut spent_outputs: HashSet<(Vec<u8>, i64)> = HashSet::new();

        for transaction in transactions.iter().filter(|tx| !tx.is_coinbase()) {
            for input in transaction.get_vin() {
                let output_reference = (input.get_txid().to_vec(), input.get_vout());
                let output_hex = format!(
                    "{}:{}",
                    HEXLOWER.encode(input.get_txid()),
                    input.get_vout()
                );

                if !spent_outputs.insert(output_reference) {
                    return Err(BlockchainError::Transaction(format!(
                        "Output {output_hex} is spent twice in one block"
                    )));
                }

                let already_spent = match input.output_index() {
                    Some(index) => self.is_output_spent(input.get_txid(), index)?,
                    None => true,
                };
                if already_spent {
                    return Err(BlockchainError::Transaction(format!(
                        "Output {output_hex} is already spent"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Blocks from tip to genesis
    pub fn iterator(&self) -> BlockchainIterator {
        BlockchainIterator::new(self.get_tip_hash(), self.db.clone())
    }

    pub fn get_best_height(&self) -> Result<usize> {
        Ok(self.tip_snapshot()?.1.get_height())
    }

    pub fn get_block(&self, block_hash: &[u8]) -> Result<Option<Block>> {
        match self.blocks_tree()?.get(block_hash)? {
            Some(bytes) => Ok(Some(Block::deserialize(bytes.as_ref())?)),
            None => Ok(None),
        }
    }

    pub fn block_exists(&self, block_hash: &[u8]) -> Result<bool> {
        Ok(self.blocks_tree()?.contains_key(block_hash)?)
    }

    /// Block hashes from tip to genesis
    pub fn get_block_hashes(&self) -> Result<Vec<Vec<u8>>> {
        self.iterator()
            .map(|block| block.map(|b| b.get_hash().to_vec()))
            .collect()
    }

    pub fn find_transaction(&self, txid: &[u8]) -> Result<Transaction> {
        for block in self.iterator() {
            let block = block?;
            if let Some(tx) = block.get_transactions().iter().find(|tx| tx.get_id() == txid) {
                return Ok(tx.clone());
            }
        }
        Err(BlockchainError::NotFound(format!(
            "transaction {}",
            HEXLOWER.encode(txid)
        )))
    }

    /// Every unspent output on the chain, keyed by hex transaction id
    pub fn find_utxo(&self) -> Result<HashMap<String, TXOutputs>> {
        let mut utxo: HashMap<String, TXOutputs> = HashMap::new();
        let mut spent_txos: HashMap<String, HashSet<usize>> = HashMap::new();

        for block in self.iterator() {
            let block = block?;
            // Later transactions in a block may spend earlier ones, so walk it backwards
            for tx in block.get_transactions().iter().rev() {
                let txid_hex = HEXLOWER.encode(tx.get_id());
                let spent = spent_txos.get(&txid_hex);
                for (idx, out) in tx.get_vout().iter().enumerate() {
                    if spent.map_or(false, |s| s.contains(&idx)) {
                        continue;
                    }
                    utxo.entry(txid_hex.clone())
                        .or_default()
                        .insert(idx, out.clone());
                }

                if tx.is_coinbase() {
                    continue;
                }
                for txin in tx.get_vin() {
                    if let Some(index) = txin.output_index() {
                        spent_txos
                            .entry(HEXLOWER.encode(txin.get_txid()))
                            .or_default()
                            .insert(index);
                    }
                }
            }
        }
        Ok(utxo)
    }

    /// Whether any transaction on the chain already spends output `vout` of `txid`
    pub fn is_output_spent(&self, txid: &[u8], vout: usize) -> Result<bool> {
        for block in self.iterator() {
            let block = block?;
            let spent = block
                .get_transactions()
                .iter()
                .filter(|tx| !tx.is_coinbase())
                .flat_map(|tx| tx.get_vin())
                .any(|input| input.get_txid() == txid && input.output_index() == Some(vout));
            if spent {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn prev_transactions(&self, tx: &Transaction) -> Result<PrevTransactions> {
        let mut prev_txs = PrevTransactions::new();
        for vin in tx.get_vin() {
            match self.find_transaction(vin.get_txid()) {
                Ok(prev_tx) => {
                    prev_txs.insert(HEXLOWER.encode(prev_tx.get_id()), prev_tx);
                }
                Err(BlockchainError::NotFound(what)) => {
                    return Err(BlockchainError::Transaction(format!(
                        "Input refers to unknown {what}"
                    )));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(prev_txs)
    }

    pub fn sign_transaction(&self, tx: &mut Transaction, pkcs8: &[u8]) -> Result<()> {
        if tx.is_coinbase() {
            return Ok(());
        }
        let prev_txs = self.prev_transactions(tx)?;
        tx.sign(pkcs8, &prev_txs)
    }

    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        let prev_txs = self.prev_transactions(tx)?;
        tx.verify(&prev_txs)
    }
}

fn read_block(
    tx_db: &TransactionalTree,
    block_hash: &[u8],
) -> ConflictableTransactionResult<(Vec<u8>, Block), BlockchainError> {
    let bytes = tx_db.get(block_hash)?.ok_or_else(|| {
        ConflictableTransactionError::Abort(BlockchainError::Database(format!(
            "Block {} missing from store",
            HEXLOWER.encode(block_hash)
        )))
    })?;
    let block = Block::deserialize(bytes.as_ref()).map_err(ConflictableTransactionError::Abort)?;
    Ok((block_hash.to_vec(), block))
}

fn map_transaction_error(err: TransactionError<BlockchainError>) -> BlockchainError {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => e.into(),
    }
}

/// Walks `prev_block_hash` links from a starting hash down to genesis
pub struct BlockchainIterator {
    db: Db,
    current_hash: Option<Vec<u8>>,
}

impl BlockchainIterator {
    fn new(tip_hash: Vec<u8>, db: Db) -> BlockchainIterator {
        BlockchainIterator {
            current_hash: if tip_hash.is_empty() {
                None
            } else {
                Some(tip_hash)
            },
            db,
        }
    }

    fn load(&self, hash: &[u8]) -> Result<Block> {
        let block_tree = self.db.open_tree(BLOCKS_TREE)?;
        let data = block_tree.get(hash)?.ok_or_else(|| {
            BlockchainError::Database(format!(
                "Block {} missing from store",
                HEXLOWER.encode(hash)
            ))
        })?;
        Block::deserialize(data.as_ref())
    }
}

impl Iterator for BlockchainIterator {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.current_hash.take()?;
        let block = self.load(&hash);
        if let Ok(block) = &block {
            if !block.is_genesis() {
                self.current_hash = Some(block.get_pre_block_hash().to_vec());
            }
        }
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TXOutput;
    use crate::testnet::test_utils::{create_test_blockchain, signed_transfer};
    use crate::wallet::{hash_pub_key, Wallet};

    #[test]
    fn test_genesis_chain() {
        let alice = Wallet::new().unwrap();
        let (blockchain, _dir) = create_test_blockchain(&alice.get_address());

        assert_eq!(blockchain.get_best_height().unwrap(), 0);
        let blocks: Vec<Block> = blockchain.iterator().map(|b| b.unwrap()).collect();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].is_genesis());
        assert_eq!(blockchain.get_tip_hash(), blocks[0].get_hash());
    }

    #[test]
    fn test_genesis_refuses_existing_chain() {
        let alice = Wallet::new().unwrap();
        let (blockchain, dir) = create_test_blockchain(&alice.get_address());
        drop(blockchain);

        let result = Blockchain::create_blockchain_with_path(&alice.get_address(), dir.path());
        assert!(matches!(result, Err(BlockchainError::Database(_))));
    }

    #[test]
    fn test_open_missing_chain_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Blockchain::new_blockchain_with_path(dir.path().join("none")).is_err());
    }

    #[test]
    fn test_reopen_keeps_tip() {
        let alice = Wallet::new().unwrap();
        let (blockchain, dir) = create_test_blockchain(&alice.get_address());
        let coinbase = Transaction::new_coinbase_tx(&alice.get_address(), "").unwrap();
        let block = blockchain.mine_block(&[coinbase]).unwrap();
        drop(blockchain);

        let reopened = Blockchain::new_blockchain_with_path(dir.path()).unwrap();
        assert_eq!(reopened.get_tip_hash(), block.get_hash());
        assert_eq!(reopened.get_best_height().unwrap(), 1);
    }

    #[test]
    fn test_add_block_is_idempotent() {
        let alice = Wallet::new().unwrap();
        let (blockchain, _dir) = create_test_blockchain(&alice.get_address());
        let coinbase = Transaction::new_coinbase_tx(&alice.get_address(), "").unwrap();
        let block = blockchain.mine_block(&[coinbase]).unwrap();

        assert!(!blockchain.add_block(&block).unwrap());
        assert_eq!(blockchain.get_block_hashes().unwrap().len(), 2);
    }

    #[test]
    fn test_lower_block_does_not_move_tip() {
        let alice = Wallet::new().unwrap();
        let (blockchain, _dir) = create_test_blockchain(&alice.get_address());
        let genesis_hash = blockchain.get_tip_hash();
        for _ in 0..2 {
            let coinbase = Transaction::new_coinbase_tx(&alice.get_address(), "").unwrap();
            blockchain.mine_block(&[coinbase]).unwrap();
        }
        let tip = blockchain.get_tip_hash();

        let coinbase = Transaction::new_coinbase_tx(&alice.get_address(), "").unwrap();
        let side_block = Block::new_block(&genesis_hash, &[coinbase], 1).unwrap();
        assert!(!blockchain.add_block(&side_block).unwrap());

        assert_eq!(blockchain.get_tip_hash(), tip);
        assert!(blockchain.block_exists(side_block.get_hash()).unwrap());
        assert_eq!(blockchain.get_best_height().unwrap(), 2);
    }

    #[test]
    fn test_mined_block_behind_tip_is_stale() {
        let alice = Wallet::new().unwrap();
        let (blockchain, _dir) = create_test_blockchain(&alice.get_address());
        let genesis_hash = blockchain.get_tip_hash();

        // mined on genesis, but a peer block at height 1 lands first
        let coinbase = Transaction::new_coinbase_tx(&alice.get_address(), "").unwrap();
        let late_block = Block::new_block(&genesis_hash, &[coinbase], 1).unwrap();
        let coinbase = Transaction::new_coinbase_tx(&alice.get_address(), "").unwrap();
        let peer_block = Block::new_block(&genesis_hash, &[coinbase], 1).unwrap();
        assert!(blockchain.add_block(&peer_block).unwrap());

        let result = blockchain.commit_mined_block(late_block.clone());
        assert!(matches!(result, Err(BlockchainError::StaleBlock(_))));
        assert_eq!(blockchain.get_tip_hash(), peer_block.get_hash());
        assert!(blockchain.block_exists(late_block.get_hash()).unwrap());
    }

    #[test]
    fn test_find_transaction_not_found() {
        let alice = Wallet::new().unwrap();
        let (blockchain, _dir) = create_test_blockchain(&alice.get_address());
        assert!(matches!(
            blockchain.find_transaction(&[0xaa; 32]),
            Err(BlockchainError::NotFound(_))
        ));
        assert!(blockchain.get_block(&[0xaa; 32]).unwrap().is_none());
    }

    #[test]
    fn test_find_utxo_excludes_spent_outputs() {
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        let (blockchain, _dir) = create_test_blockchain(&alice.get_address());

        let transfer = signed_transfer(&blockchain, &alice, &bob, 10);
        let coinbase = Transaction::new_coinbase_tx(&alice.get_address(), "").unwrap();
        blockchain.mine_block(&[transfer.clone(), coinbase]).unwrap();

        let utxo = blockchain.find_utxo().unwrap();
        let genesis_tx = blockchain
            .iterator()
            .last()
            .unwrap()
            .unwrap()
            .get_transactions()[0]
            .clone();
        assert!(!utxo.contains_key(&HEXLOWER.encode(genesis_tx.get_id())));
        let outs = &utxo[&HEXLOWER.encode(transfer.get_id())];
        assert!(outs
            .get(0)
            .unwrap()
            .is_locked_with_key(&hash_pub_key(bob.get_public_key())));
    }

    #[test]
    fn test_output_spent_on_chain() {
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        let (blockchain, _dir) = create_test_blockchain(&alice.get_address());
        let transfer = signed_transfer(&blockchain, &alice, &bob, 4);
        let spent_txid = transfer.get_vin()[0].get_txid().to_vec();

        assert!(!blockchain.is_output_spent(&spent_txid, 0).unwrap());
        blockchain.mine_block(&[transfer.clone()]).unwrap();
        assert!(blockchain.is_output_spent(&spent_txid, 0).unwrap());

        // replaying the same spend is refused
        let again = blockchain.mine_block(&[transfer]);
        assert!(matches!(again, Err(BlockchainError::Transaction(_))));
        assert_eq!(blockchain.get_best_height().unwrap(), 1);
    }

    #[test]
    fn test_unknown_input_is_an_integrity_error() {
        let alice = Wallet::new().unwrap();
        let (blockchain, _dir) = create_test_blockchain(&alice.get_address());

        let mut input = crate::core::TXInput::new(&[0x11; 32], 0);
        input.set_pub_key(alice.get_public_key());
        let output = TXOutput::new(1, &alice.get_address()).unwrap();
        let tx = Transaction::new(vec![input], vec![output]).unwrap();

        assert!(matches!(
            blockchain.verify_transaction(&tx),
            Err(BlockchainError::Transaction(_))
        ));
    }
}
