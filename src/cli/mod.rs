//! Command-line interface
//!
//! Argument parsing for the `tallychain` binary.

pub mod commands;

pub use commands::{Command, Opt};
