//! Fixtures for unit tests: temporary ledgers and signed transfers.

pub mod test_utils;

pub use test_utils::*;
