//! Wire framing for the peer protocol
//!
//! Every message is a 12-byte ASCII command name, zero padded, followed by the
//! command's payload encoded as JSON. Blocks and transactions ride inside their
//! payloads as bincode bytes.

use crate::error::{BlockchainError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const COMMAND_LENGTH: usize = 12;
pub const NODE_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Tx,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPayload {
    pub version: i32,
    pub best_height: usize,
    pub addr_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlocksPayload {
    pub addr_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrPayload {
    pub addr_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvPayload {
    pub addr_from: String,
    pub op_type: OpType,
    pub items: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDataPayload {
    pub addr_from: String,
    pub op_type: OpType,
    pub id: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPayload {
    pub addr_from: String,
    pub block: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPayload {
    pub addr_from: String,
    pub transaction: Vec<u8>,
}

/// One message of the sync protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Package {
    Version(VersionPayload),
    GetBlocks(GetBlocksPayload),
    Addr(AddrPayload),
    Inv(InvPayload),
    GetData(GetDataPayload),
    Block(BlockPayload),
    Tx(TxPayload),
}

impl Package {
    pub fn command(&self) -> &'static str {
        match self {
            Package::Version(_) => "version",
            Package::GetBlocks(_) => "getblocks",
            Package::Addr(_) => "addr",
            Package::Inv(_) => "inv",
            Package::GetData(_) => "getdata",
            Package::Block(_) => "block",
            Package::Tx(_) => "tx",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Package::Version(p) => serde_json::to_vec(p)?,
            Package::GetBlocks(p) => serde_json::to_vec(p)?,
            Package::Addr(p) => serde_json::to_vec(p)?,
            Package::Inv(p) => serde_json::to_vec(p)?,
            Package::GetData(p) => serde_json::to_vec(p)?,
            Package::Block(p) => serde_json::to_vec(p)?,
            Package::Tx(p) => serde_json::to_vec(p)?,
        };
        let mut bytes = command_to_bytes(self.command())?.to_vec();
        bytes.extend(payload);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Package> {
        if bytes.len() < COMMAND_LENGTH {
            return Err(BlockchainError::Network(format!(
                "Message of {} bytes is shorter than its command",
                bytes.len()
            )));
        }
        let (command, payload) = bytes.split_at(COMMAND_LENGTH);
        let command = bytes_to_command(command);

        let package = match command.as_str() {
            "version" => Package::Version(payload_from(payload)?),
            "getblocks" => Package::GetBlocks(payload_from(payload)?),
            "addr" => Package::Addr(payload_from(payload)?),
            "inv" => Package::Inv(payload_from(payload)?),
            "getdata" => Package::GetData(payload_from(payload)?),
            "block" => Package::Block(payload_from(payload)?),
            "tx" => Package::Tx(payload_from(payload)?),
            other => {
                return Err(BlockchainError::Network(format!(
                    "Unknown command: {other:?}"
                )))
            }
        };
        Ok(package)
    }
}

fn payload_from<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}

/// Pads an ASCII command name with zero bytes to [`COMMAND_LENGTH`]
pub fn command_to_bytes(command: &str) -> Result<[u8; COMMAND_LENGTH]> {
    if !command.is_ascii() || command.len() > COMMAND_LENGTH {
        return Err(BlockchainError::Network(format!(
            "Command {command:?} does not fit in {COMMAND_LENGTH} ASCII bytes"
        )));
    }
    let mut bytes = [0u8; COMMAND_LENGTH];
    bytes[..command.len()].copy_from_slice(command.as_bytes());
    Ok(bytes)
}

/// Reads a command name back, dropping the zero padding
pub fn bytes_to_command(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| **b != 0)
        .map(|b| *b as char)
        .collect()
}
