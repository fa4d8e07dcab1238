use crate::core::{Block, Blockchain, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::message::{
    AddrPayload, BlockPayload, GetBlocksPayload, GetDataPayload, InvPayload, OpType, Package,
    TxPayload, VersionPayload, NODE_VERSION,
};
use crate::network::Nodes;
use crate::storage::{BlockInTransit, MemoryPool, UTXOSet};
use data_encoding::HEXLOWER;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const CENTRAL_NODE: &str = "127.0.0.1:3000";
/// Pooled transactions needed before a miner starts a block
pub const TRANSACTION_THRESHOLD: usize = 2;
const TCP_WRITE_TIMEOUT: u64 = 5000;
const TCP_READ_TIMEOUT: u64 = 60;

/// Settings a node runs with
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address this node listens on and advertises to peers
    pub node_address: String,
    /// Reward address; `None` means the node never mines
    pub mining_address: Option<String>,
    /// Bootstrap peer every other node introduces itself to
    pub central_node: String,
}

impl ServerConfig {
    pub fn new(node_address: &str, mining_address: Option<&str>) -> ServerConfig {
        ServerConfig {
            node_address: node_address.to_string(),
            mining_address: mining_address.map(str::to_string),
            central_node: CENTRAL_NODE.to_string(),
        }
    }

    pub fn with_central_node(mut self, central_node: &str) -> ServerConfig {
        self.central_node = central_node.to_string();
        self
    }
}

/// The sync protocol service.
///
/// Owns the peer registry, the mempool and the blocks-in-transit queue. Clones
/// share that state, one clone per connection worker.
#[derive(Clone)]
pub struct Server {
    blockchain: Blockchain,
    config: Arc<ServerConfig>,
    known_nodes: Arc<Nodes>,
    memory_pool: Arc<MemoryPool>,
    blocks_in_transit: Arc<BlockInTransit>,
    mining: Arc<AtomicBool>,
}

impl Server {
    pub fn new(blockchain: Blockchain, config: ServerConfig) -> Server {
        let known_nodes = Nodes::new();
        known_nodes.add_node(config.central_node.clone());
        Server {
            blockchain,
            config: Arc::new(config),
            known_nodes: Arc::new(known_nodes),
            memory_pool: Arc::new(MemoryPool::new()),
            blocks_in_transit: Arc::new(BlockInTransit::new()),
            mining: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn get_blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    pub fn known_nodes(&self) -> &Nodes {
        &self.known_nodes
    }

    pub fn memory_pool(&self) -> &MemoryPool {
        &self.memory_pool
    }

    pub fn blocks_in_transit(&self) -> &BlockInTransit {
        &self.blocks_in_transit
    }

    fn is_central_node(&self) -> bool {
        self.config.node_address == self.config.central_node
    }

    /// Binds the configured address and serves until the listener fails
    pub fn run(&self) -> Result<()> {
        let addr = self.config.node_address.as_str();
        let listener = TcpListener::bind(addr)
            .map_err(|e| BlockchainError::Network(format!("Failed to bind to {addr}: {e}")))?;
        self.serve(listener)
    }

    /// Introduces this node to the bootstrap peer, then accepts connections on
    /// `listener`, one worker thread per connection.
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("Server listening on {}", self.config.node_address);

        if !self.is_central_node() {
            let central = self.config.central_node.clone();
            if let Err(e) = self.send_version(&central) {
                warn!("Could not reach bootstrap node {central}: {e}");
            }
        }

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = self.clone();
                    thread::spawn(move || {
                        if let Err(e) = server.handle_connection(stream) {
                            error!("Error handling connection: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {e}");
                }
            }
        }
        Ok(())
    }

    fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        stream
            .set_read_timeout(Some(Duration::from_secs(TCP_READ_TIMEOUT)))
            .map_err(|e| BlockchainError::Network(format!("Failed to set read timeout: {e}")))?;

        let mut request = vec![];
        stream.read_to_end(&mut request)?;
        let _ = stream.shutdown(Shutdown::Both);

        let pkg = Package::decode(&request)?;
        self.process_package(pkg)
    }

    /// Dispatches one decoded message to its handler
    pub fn process_package(&self, pkg: Package) -> Result<()> {
        info!("Received {} command", pkg.command());
        match pkg {
            Package::Version(payload) => self.handle_version(payload),
            Package::GetBlocks(payload) => self.handle_get_blocks(payload),
            Package::Addr(payload) => self.handle_addr(payload),
            Package::Inv(payload) => self.handle_inv(payload),
            Package::GetData(payload) => self.handle_get_data(payload),
            Package::Block(payload) => self.handle_block(payload),
            Package::Tx(payload) => self.handle_tx(payload),
        }
    }

    fn handle_version(&self, payload: VersionPayload) -> Result<()> {
        let my_best_height = self.blockchain.get_best_height()?;
        let foreigner_best_height = payload.best_height;
        debug!(
            "Version from {}: their height {foreigner_best_height}, ours {my_best_height}",
            payload.addr_from
        );

        let reply = if my_best_height < foreigner_best_height {
            self.send_get_blocks(&payload.addr_from)
        } else if my_best_height > foreigner_best_height {
            self.send_version(&payload.addr_from)
        } else {
            Ok(())
        };
        if let Err(e) = reply {
            warn!("Version reply to {} failed: {e}", payload.addr_from);
        }

        // the sender is registered whether or not the reply went through
        if self.known_nodes.add_node(payload.addr_from.clone()) {
            info!("Added peer {}", payload.addr_from);
        }
        Ok(())
    }

    fn handle_get_blocks(&self, payload: GetBlocksPayload) -> Result<()> {
        let blocks = self.blockchain.get_block_hashes()?;
        self.send_inv(&payload.addr_from, OpType::Block, &blocks)
    }

    fn handle_addr(&self, payload: AddrPayload) -> Result<()> {
        for addr in payload.addr_list {
            if addr != self.config.node_address {
                self.known_nodes.add_node(addr);
            }
        }
        info!("There are {} known nodes now", self.known_nodes.len());
        self.request_blocks();
        Ok(())
    }

    fn handle_inv(&self, payload: InvPayload) -> Result<()> {
        info!(
            "Received inventory with {} {:?} item(s)",
            payload.items.len(),
            payload.op_type
        );
        match payload.op_type {
            OpType::Block => {
                if let Some(block_hash) = self.blocks_in_transit.restart_with(&payload.items) {
                    self.send_get_data(&payload.addr_from, OpType::Block, &block_hash)?;
                }
            }
            OpType::Tx => {
                if let Some(txid) = payload.items.first() {
                    if !self.memory_pool.contains(&HEXLOWER.encode(txid)) {
                        self.send_get_data(&payload.addr_from, OpType::Tx, txid)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_get_data(&self, payload: GetDataPayload) -> Result<()> {
        match payload.op_type {
            OpType::Block => match self.blockchain.get_block(&payload.id)? {
                Some(block) => self.send_block(&payload.addr_from, &block)?,
                None => warn!("Requested block {} not found", HEXLOWER.encode(&payload.id)),
            },
            OpType::Tx => {
                let txid_hex = HEXLOWER.encode(&payload.id);
                match self.memory_pool.get(&txid_hex) {
                    Some(tx) => self.send_tx(&payload.addr_from, &tx)?,
                    None => warn!("Requested transaction {txid_hex} is not in the mempool"),
                }
            }
        }
        Ok(())
    }

    fn handle_block(&self, payload: BlockPayload) -> Result<()> {
        let block = Block::deserialize(&payload.block)?;
        // Peers are trusted: neither proof-of-work nor signatures are rechecked here
        self.blockchain.add_block(&block)?;
        info!(
            "Received block {} from {}",
            HEXLOWER.encode(block.get_hash()),
            payload.addr_from
        );

        match self.blocks_in_transit.pop_first() {
            Some(block_hash) => {
                self.send_get_data(&payload.addr_from, OpType::Block, &block_hash)?;
            }
            None => {
                UTXOSet::new(self.blockchain.clone()).reindex()?;
            }
        }
        Ok(())
    }

    fn handle_tx(&self, payload: TxPayload) -> Result<()> {
        let tx = Transaction::deserialize(&payload.transaction)?;
        let txid = tx.get_id().to_vec();
        let pool_size = self.memory_pool.add(tx);
        info!(
            "Transaction {} added to mempool ({pool_size} pending)",
            HEXLOWER.encode(&txid)
        );

        if self.is_central_node() {
            for node in self.known_nodes.get_nodes() {
                let addr = node.get_addr();
                if addr == self.config.node_address || addr == payload.addr_from {
                    continue;
                }
                if let Err(e) = self.send_inv(&addr, OpType::Tx, &[txid.clone()]) {
                    warn!("Failed to relay transaction to {addr}: {e}");
                }
            }
            return Ok(());
        }

        if pool_size >= TRANSACTION_THRESHOLD && self.config.mining_address.is_some() {
            self.mine_pending_transactions()?;
        }
        Ok(())
    }

    /// Drains the mempool into blocks. Only one drain loop runs per node; a
    /// transaction arriving while it runs is picked up by that loop.
    pub fn mine_pending_transactions(&self) -> Result<()> {
        let Some(mining_address) = self.config.mining_address.clone() else {
            return Ok(());
        };

        loop {
            if self
                .mining
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                debug!("Mining loop already running");
                return Ok(());
            }
            let result = self.drain_memory_pool(&mining_address);
            self.mining.store(false, Ordering::SeqCst);
            result?;

            // a transaction may have landed between the last drain and releasing the flag
            if self.memory_pool.len() < TRANSACTION_THRESHOLD {
                return Ok(());
            }
        }
    }

    fn drain_memory_pool(&self, mining_address: &str) -> Result<()> {
        while !self.memory_pool.is_empty() {
            let mut txs = self.select_transactions();
            if txs.is_empty() {
                info!("All pooled transactions are invalid, waiting for new ones");
                return Ok(());
            }

            txs.push(Transaction::new_coinbase_tx(mining_address, "")?);
            let mined = self.blockchain.mine_block(&txs);
            self.settle_mined_block(mined, &txs)?;
        }
        Ok(())
    }

    /// Clears the mined transactions from the pool and announces the block.
    /// A stale block announces nothing and leaves its transactions pooled for
    /// the next round on the new tip.
    fn settle_mined_block(&self, mined: Result<Block>, txs: &[Transaction]) -> Result<()> {
        let new_block = match mined {
            Ok(block) => block,
            Err(BlockchainError::StaleBlock(msg)) => {
                warn!("Keeping {} transaction(s) pooled: {msg}", txs.len());
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        UTXOSet::new(self.blockchain.clone()).reindex()?;

        let block_hash = new_block.get_hash().to_vec();
        info!("New block {} is mined!", HEXLOWER.encode(&block_hash));

        for tx in txs {
            self.memory_pool.remove(&HEXLOWER.encode(tx.get_id()));
        }

        for node in self.known_nodes.get_nodes() {
            let addr = node.get_addr();
            if addr == self.config.node_address {
                continue;
            }
            if let Err(e) = self.send_inv(&addr, OpType::Block, &[block_hash.clone()]) {
                warn!("Failed to announce block to {addr}: {e}");
            }
        }
        Ok(())
    }

    /// Verified, mutually compatible transactions from the mempool. Anything
    /// invalid, already spent, or conflicting with an earlier pick is dropped
    /// from the pool.
    fn select_transactions(&self) -> Vec<Transaction> {
        let mut selected = vec![];
        let mut claimed: HashSet<(Vec<u8>, i64)> = HashSet::new();

        for tx in self.memory_pool.get_all() {
            let txid_hex = HEXLOWER.encode(tx.get_id());
            match self.is_minable(&tx, &claimed) {
                Ok(true) => {
                    for input in tx.get_vin() {
                        claimed.insert((input.get_txid().to_vec(), input.get_vout()));
                    }
                    selected.push(tx);
                }
                Ok(false) => {
                    warn!("Dropping transaction {txid_hex}: invalid or conflicting");
                    self.memory_pool.remove(&txid_hex);
                }
                Err(e) => {
                    warn!("Dropping transaction {txid_hex}: {e}");
                    self.memory_pool.remove(&txid_hex);
                }
            }
        }
        selected
    }

    fn is_minable(&self, tx: &Transaction, claimed: &HashSet<(Vec<u8>, i64)>) -> Result<bool> {
        if tx.is_coinbase() || !self.blockchain.verify_transaction(tx)? {
            return Ok(false);
        }
        for input in tx.get_vin() {
            if claimed.contains(&(input.get_txid().to_vec(), input.get_vout())) {
                return Ok(false);
            }
            let spent = match input.output_index() {
                Some(index) => self.blockchain.is_output_spent(input.get_txid(), index)?,
                None => true,
            };
            if spent {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Asks every known peer for its block inventory
    fn request_blocks(&self) {
        for node in self.known_nodes.get_nodes() {
            let addr = node.get_addr();
            if let Err(e) = self.send_get_blocks(&addr) {
                warn!("Failed to request blocks from {addr}: {e}");
            }
        }
    }

    pub fn send_version(&self, addr: &str) -> Result<()> {
        let best_height = self.blockchain.get_best_height()?;
        self.send_data(
            addr,
            Package::Version(VersionPayload {
                version: NODE_VERSION,
                best_height,
                addr_from: self.config.node_address.clone(),
            }),
        )
    }

    fn send_get_blocks(&self, addr: &str) -> Result<()> {
        self.send_data(
            addr,
            Package::GetBlocks(GetBlocksPayload {
                addr_from: self.config.node_address.clone(),
            }),
        )
    }

    fn send_inv(&self, addr: &str, op_type: OpType, items: &[Vec<u8>]) -> Result<()> {
        self.send_data(
            addr,
            Package::Inv(InvPayload {
                addr_from: self.config.node_address.clone(),
                op_type,
                items: items.to_vec(),
            }),
        )
    }

    fn send_get_data(&self, addr: &str, op_type: OpType, id: &[u8]) -> Result<()> {
        self.send_data(
            addr,
            Package::GetData(GetDataPayload {
                addr_from: self.config.node_address.clone(),
                op_type,
                id: id.to_vec(),
            }),
        )
    }

    fn send_block(&self, addr: &str, block: &Block) -> Result<()> {
        self.send_data(
            addr,
            Package::Block(BlockPayload {
                addr_from: self.config.node_address.clone(),
                block: block.serialize()?,
            }),
        )
    }

    fn send_tx(&self, addr: &str, tx: &Transaction) -> Result<()> {
        self.send_data(
            addr,
            Package::Tx(TxPayload {
                addr_from: self.config.node_address.clone(),
                transaction: tx.serialize()?,
            }),
        )
    }

    /// Delivers `pkg` to `addr`; an unreachable peer is dropped from the registry
    fn send_data(&self, addr: &str, pkg: Package) -> Result<()> {
        debug!("Sending {} to {addr}", pkg.command());
        write_package(addr, &pkg).map_err(|e| {
            warn!("Peer {addr} is not available, removing it: {e}");
            self.known_nodes.evict_node(addr);
            e
        })
    }
}

/// Sends a transaction to `addr` on behalf of `addr_from`, outside any running node
pub fn send_tx(addr: &str, addr_from: &str, tx: &Transaction) -> Result<()> {
    write_package(
        addr,
        &Package::Tx(TxPayload {
            addr_from: addr_from.to_string(),
            transaction: tx.serialize()?,
        }),
    )
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|e| BlockchainError::Network(format!("Invalid address {addr}: {e}")))?
        .next()
        .ok_or_else(|| BlockchainError::Network(format!("Address {addr} did not resolve")))
}

/// One message per connection: connect, write the frame, close the write side
fn write_package(addr: &str, pkg: &Package) -> Result<()> {
    let socket_addr = resolve(addr)?;
    let mut stream =
        TcpStream::connect_timeout(&socket_addr, Duration::from_millis(TCP_WRITE_TIMEOUT))
            .map_err(|e| BlockchainError::Network(format!("Failed to connect to {addr}: {e}")))?;

    stream
        .set_write_timeout(Some(Duration::from_millis(TCP_WRITE_TIMEOUT)))
        .map_err(|e| BlockchainError::Network(format!("Failed to set write timeout: {e}")))?;

    stream
        .write_all(&pkg.encode()?)
        .and_then(|_| stream.flush())
        .map_err(|e| BlockchainError::Network(format!("Failed to send data to {addr}: {e}")))?;
    let _ = stream.shutdown(Shutdown::Write);
    Ok(())
}
