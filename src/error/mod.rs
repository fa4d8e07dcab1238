//! Error handling for the ledger
//!
//! One error type covers storage, validation, lookup and network failures so
//! that every layer can propagate with `?`.

use std::fmt;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, BlockchainError>;

/// Error kinds raised by ledger, index, wallet and peer operations
#[derive(Debug, Clone)]
pub enum BlockchainError {
    /// Persistent store failures (open, read, write, missing tip)
    Database(String),
    /// Key generation, signing or clock failures
    Crypto(String),
    /// Peer communication and framing errors
    Network(String),
    /// Transaction construction or validation errors
    Transaction(String),
    /// Wallet lookup and wallet file errors
    Wallet(String),
    /// Missing or malformed configuration
    Config(String),
    /// Encoding and decoding errors
    Serialization(String),
    /// File I/O errors
    Io(String),
    /// Address failed Base58Check decoding
    InvalidAddress(String),
    /// Not enough spendable outputs to cover a transfer
    InsufficientFunds { required: i64, available: i64 },
    /// Block construction or lookup errors
    InvalidBlock(String),
    /// Proof-of-work search failed
    Mining(String),
    /// A mined block was stored but a peer block already holds its height
    StaleBlock(String),
    /// A transaction or block id that is not on the chain
    NotFound(String),
}

impl fmt::Display for BlockchainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockchainError::Database(msg) => write!(f, "Database error: {msg}"),
            BlockchainError::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
            BlockchainError::Network(msg) => write!(f, "Network error: {msg}"),
            BlockchainError::Transaction(msg) => write!(f, "Transaction error: {msg}"),
            BlockchainError::Wallet(msg) => write!(f, "Wallet error: {msg}"),
            BlockchainError::Config(msg) => write!(f, "Configuration error: {msg}"),
            BlockchainError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            BlockchainError::Io(msg) => write!(f, "I/O error: {msg}"),
            BlockchainError::InvalidAddress(addr) => write!(f, "Invalid address: {addr}"),
            BlockchainError::InsufficientFunds {
                required,
                available,
            } => {
                write!(
                    f,
                    "Insufficient funds: required {required}, available {available}"
                )
            }
            BlockchainError::InvalidBlock(msg) => write!(f, "Invalid block: {msg}"),
            BlockchainError::Mining(msg) => write!(f, "Mining error: {msg}"),
            BlockchainError::StaleBlock(msg) => write!(f, "Stale block: {msg}"),
            BlockchainError::NotFound(what) => write!(f, "Not found: {what}"),
        }
    }
}

impl std::error::Error for BlockchainError {}

impl From<std::io::Error> for BlockchainError {
    fn from(err: std::io::Error) -> Self {
        BlockchainError::Io(err.to_string())
    }
}

impl From<sled::Error> for BlockchainError {
    fn from(err: sled::Error) -> Self {
        BlockchainError::Database(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for BlockchainError {
    fn from(err: bincode::error::EncodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for BlockchainError {
    fn from(err: bincode::error::DecodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BlockchainError {
    fn from(err: serde_json::Error) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}
