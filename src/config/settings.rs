use crate::core::Blockchain;
use crate::network::{ServerConfig, CENTRAL_NODE};
use crate::wallet::wallet_file_name;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

/// Settings read from the environment once per process
pub static GLOBAL_CONFIG: Lazy<Config> = Lazy::new(Config::new);

static DEFAULT_DATA_DIR: &str = "data";
static DEFAULT_HOST: &str = "127.0.0.1";

const NODE_ID_KEY: &str = "NODE_ID";
const NODE_ADDRESS_KEY: &str = "NODE_ADDRESS";
const MINING_ADDRESS_KEY: &str = "MINING_ADDRESS";
const CENTRAL_NODE_KEY: &str = "CENTRAL_NODE";
const DATA_DIR_KEY: &str = "DATA_DIR";

const KEYS: [&str; 5] = [
    NODE_ID_KEY,
    NODE_ADDRESS_KEY,
    MINING_ADDRESS_KEY,
    CENTRAL_NODE_KEY,
    DATA_DIR_KEY,
];

pub struct Config {
    inner: RwLock<HashMap<String, String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Seeds the configuration from `NODE_ID`, `NODE_ADDRESS`, `MINING_ADDRESS`,
    /// `CENTRAL_NODE` and `DATA_DIR`
    pub fn new() -> Config {
        Config::from_vars(
            KEYS.iter()
                .filter_map(|key| env::var(key).ok().map(|value| (key.to_string(), value))),
        )
    }

    pub fn from_vars<I>(vars: I) -> Config
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let map = vars
            .into_iter()
            .filter(|(key, value)| KEYS.contains(&key.as_str()) && !value.is_empty())
            .collect();
        Config {
            inner: RwLock::new(map),
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
    }

    pub fn get_node_id(&self) -> Option<String> {
        self.get(NODE_ID_KEY)
    }

    pub fn set_node_id(&self, node_id: String) {
        self.set(NODE_ID_KEY, node_id);
    }

    /// `NODE_ADDRESS`, else `127.0.0.1:<NODE_ID>`, else the bootstrap address
    pub fn get_node_addr(&self) -> String {
        self.get(NODE_ADDRESS_KEY)
            .or_else(|| {
                self.get_node_id()
                    .map(|node_id| format!("{DEFAULT_HOST}:{node_id}"))
            })
            .unwrap_or_else(|| self.get_central_node())
    }

    pub fn get_mining_addr(&self) -> Option<String> {
        self.get(MINING_ADDRESS_KEY)
    }

    pub fn set_mining_addr(&self, addr: String) {
        self.set(MINING_ADDRESS_KEY, addr);
    }

    pub fn is_miner(&self) -> bool {
        self.get_mining_addr().is_some()
    }

    pub fn get_central_node(&self) -> String {
        self.get(CENTRAL_NODE_KEY)
            .unwrap_or_else(|| CENTRAL_NODE.to_string())
    }

    pub fn get_data_dir(&self) -> PathBuf {
        PathBuf::from(
            self.get(DATA_DIR_KEY)
                .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
        )
    }

    /// Ledger directory for the configured node
    pub fn get_db_path(&self) -> PathBuf {
        Blockchain::node_db_path(self.get_data_dir(), self.get_node_id().as_deref())
    }

    /// Wallet file for the configured node, in the working directory
    pub fn get_wallet_path(&self) -> PathBuf {
        PathBuf::from(wallet_file_name(self.get_node_id().as_deref()))
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new(&self.get_node_addr(), self.get_mining_addr().as_deref())
            .with_central_node(&self.get_central_node())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn config(vars: &[(&str, &str)]) -> Config {
        Config::from_vars(
            vars.iter()
                .map(|(key, value)| (key.to_string(), value.to_string())),
        )
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]);

        assert_eq!(config.get_node_addr(), CENTRAL_NODE);
        assert_eq!(config.get_central_node(), CENTRAL_NODE);
        assert_eq!(config.get_db_path(), Path::new("data"));
        assert_eq!(config.get_wallet_path(), Path::new("wallet.dat"));
        assert!(!config.is_miner());
    }

    #[test]
    fn test_node_id_drives_paths_and_address() {
        let config = config(&[("NODE_ID", "3001"), ("DATA_DIR", "/tmp/ledger")]);

        assert_eq!(config.get_node_addr(), "127.0.0.1:3001");
        assert_eq!(config.get_db_path(), Path::new("/tmp/ledger/node_3001"));
        assert_eq!(config.get_wallet_path(), Path::new("wallet_3001.dat"));
    }

    #[test]
    fn test_explicit_values_win() {
        let config = config(&[
            ("NODE_ID", "3001"),
            ("NODE_ADDRESS", "10.0.0.5:4000"),
            ("CENTRAL_NODE", "10.0.0.1:4000"),
            ("MINING_ADDRESS", "miner"),
            ("UNRELATED", "ignored"),
        ]);

        let server_config = config.server_config();
        assert_eq!(server_config.node_address, "10.0.0.5:4000");
        assert_eq!(server_config.central_node, "10.0.0.1:4000");
        assert_eq!(server_config.mining_address.as_deref(), Some("miner"));

        config.set_mining_addr("other".to_string());
        assert_eq!(config.get_mining_addr().as_deref(), Some("other"));
    }
}
