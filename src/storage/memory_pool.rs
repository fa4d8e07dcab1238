use crate::core::Transaction;
use data_encoding::HEXLOWER;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

/// Transactions received but not yet mined ( K -> txid_hex, V -> Transaction )
pub struct MemoryPool {
    inner: RwLock<HashMap<String, Transaction>>,
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPool {
    pub fn new() -> MemoryPool {
        MemoryPool {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, txid_hex: &str) -> Option<Transaction> {
        match self.inner.read() {
            Ok(pool) => pool.get(txid_hex).cloned(),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                None
            }
        }
    }

    /// Adds `tx` and returns the pool size afterwards
    pub fn add(&self, tx: Transaction) -> usize {
        match self.inner.write() {
            Ok(mut pool) => {
                pool.insert(HEXLOWER.encode(tx.get_id()), tx);
                pool.len()
            }
            Err(_) => {
                log::error!("Failed to acquire write lock on memory pool");
                0
            }
        }
    }

    pub fn contains(&self, txid_hex: &str) -> bool {
        match self.inner.read() {
            Ok(pool) => pool.contains_key(txid_hex),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                false
            }
        }
    }

    pub fn remove(&self, txid_hex: &str) -> Option<Transaction> {
        match self.inner.write() {
            Ok(mut pool) => pool.remove(txid_hex),
            Err(_) => {
                log::error!("Failed to acquire write lock on memory pool");
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(pool) => pool.len(),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                0
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every pooled transaction
    pub fn get_all(&self) -> Vec<Transaction> {
        match self.inner.read() {
            Ok(pool) => pool.values().cloned().collect(),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                Vec::new()
            }
        }
    }
}

/// Block hashes announced by a peer and not yet requested, in announcement order
pub struct BlockInTransit {
    inner: RwLock<VecDeque<Vec<u8>>>,
}

impl Default for BlockInTransit {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockInTransit {
    pub fn new() -> BlockInTransit {
        BlockInTransit {
            inner: RwLock::new(VecDeque::new()),
        }
    }

    /// Replaces the queue with `hashes` and takes the first one off it
    pub fn restart_with(&self, hashes: &[Vec<u8>]) -> Option<Vec<u8>> {
        match self.inner.write() {
            Ok(mut inner) => {
                *inner = hashes.iter().cloned().collect();
                inner.pop_front()
            }
            Err(_) => {
                log::error!("Failed to acquire write lock on block transit");
                None
            }
        }
    }

    pub fn pop_first(&self) -> Option<Vec<u8>> {
        match self.inner.write() {
            Ok(mut inner) => inner.pop_front(),
            Err(_) => {
                log::error!("Failed to acquire write lock on block transit");
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(inner) => inner.len(),
            Err(_) => {
                log::error!("Failed to acquire read lock on block transit");
                0
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
