//! Data storage and persistence
//!
//! The UTXO index lives next to the ledger in sled; the mempool and the
//! blocks-in-transit queue are in-memory state owned by a running node.

pub mod memory_pool;
pub mod utxo_set;

pub use memory_pool::{BlockInTransit, MemoryPool};
pub use utxo_set::UTXOSet;
