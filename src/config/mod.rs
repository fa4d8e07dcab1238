//! Configuration management
//!
//! Node identity, listen address, mining address, bootstrap peer and data
//! directory, read from the environment.

pub mod settings;

pub use settings::{Config, GLOBAL_CONFIG};
