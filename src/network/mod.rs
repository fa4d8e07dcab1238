//! Peer-to-peer synchronization
//!
//! Nodes gossip block and transaction inventories over short-lived TCP
//! connections, one framed message per connection.

pub mod message;
pub mod node;
pub mod server;

pub use message::{OpType, Package, COMMAND_LENGTH};
pub use node::{Node, Nodes};
pub use server::{send_tx, Server, ServerConfig, CENTRAL_NODE, TRANSACTION_THRESHOLD};
