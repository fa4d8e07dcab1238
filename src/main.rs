use clap::Parser;
use data_encoding::HEXLOWER;
use log::{error, info, LevelFilter};
use std::process;
use tallychain::{
    address_to_pub_key_hash, convert_address, hash_pub_key, send_tx, validate_address,
    Blockchain, Command, Opt, ProofOfWork, Server, Transaction, UTXOSet, Wallets, GLOBAL_CONFIG,
};

fn main() {
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();

    if let Err(e) = run_command(opt.command) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn open_blockchain() -> Result<Blockchain, Box<dyn std::error::Error>> {
    let db_path = GLOBAL_CONFIG.get_db_path();
    Blockchain::new_blockchain_with_path(&db_path).map_err(|e| {
        format!(
            "No blockchain at {} ({e}). Run 'createblockchain' first.",
            db_path.display()
        )
        .into()
    })
}

fn ensure_address(address: &str) -> Result<(), Box<dyn std::error::Error>> {
    if validate_address(address) {
        Ok(())
    } else {
        Err(format!("Invalid address: {address}").into())
    }
}

fn run_command(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Createblockchain { address } => {
            ensure_address(&address)?;
            let blockchain =
                Blockchain::create_blockchain_with_path(&address, GLOBAL_CONFIG.get_db_path())?;
            let utxo_set = UTXOSet::new(blockchain);
            utxo_set.reindex()?;
            println!("Done!");
        }
        Command::Createwallet => {
            let mut wallets = Wallets::load_from(GLOBAL_CONFIG.get_wallet_path())?;
            let address = wallets.create_wallet()?;
            println!("Your new address: {address}")
        }
        Command::GetBalance { address } => {
            let pub_key_hash = address_to_pub_key_hash(&address)?;
            let utxo_set = UTXOSet::new(open_blockchain()?);
            let balance = utxo_set.get_balance(&pub_key_hash)?;
            println!("Balance of {address}: {balance}");
        }
        Command::ListAddresses => {
            let wallets = Wallets::load_from(GLOBAL_CONFIG.get_wallet_path())?;
            for address in wallets.get_addresses() {
                println!("{address}")
            }
        }
        Command::Send {
            from,
            to,
            amount,
            mine,
        } => {
            ensure_address(&from)?;
            ensure_address(&to)?;

            let wallets = Wallets::load_from(GLOBAL_CONFIG.get_wallet_path())?;
            let wallet = wallets
                .get_wallet(&from)
                .ok_or_else(|| format!("No local wallet for address {from}"))?;

            let blockchain = open_blockchain()?;
            let utxo_set = UTXOSet::new(blockchain.clone());
            let transaction = Transaction::new_utxo_transaction(wallet, &to, amount, &utxo_set)?;

            if mine {
                let coinbase_tx = Transaction::new_coinbase_tx(&from, "")?;
                let block = blockchain.mine_block(&[coinbase_tx, transaction])?;
                utxo_set.update(&block)?;
                info!("Mined block {}", HEXLOWER.encode(block.get_hash()));
            } else {
                let central = GLOBAL_CONFIG.get_central_node();
                send_tx(&central, &GLOBAL_CONFIG.get_node_addr(), &transaction)?;
                info!("Sent transaction to {central}");
            }
            println!("Success!")
        }
        Command::Printchain => {
            for block in open_blockchain()?.iterator() {
                let block = block?;
                println!("Height: {}", block.get_height());
                println!("Pre block hash: {}", HEXLOWER.encode(block.get_pre_block_hash()));
                println!("Cur block hash: {}", HEXLOWER.encode(block.get_hash()));
                println!("Timestamp: {}", block.get_timestamp());
                println!("PoW valid: {}", ProofOfWork::validate(&block));

                for tx in block.get_transactions() {
                    println!("- Transaction {}", HEXLOWER.encode(tx.get_id()));
                    if !tx.is_coinbase() {
                        for input in tx.get_vin() {
                            let pub_key_hash = hash_pub_key(input.get_pub_key());
                            println!(
                                "-- Input txid = {}, vout = {}, from = {}",
                                HEXLOWER.encode(input.get_txid()),
                                input.get_vout(),
                                convert_address(&pub_key_hash),
                            )
                        }
                    }
                    for output in tx.get_vout() {
                        println!(
                            "-- Output value = {}, to = {}",
                            output.get_value(),
                            convert_address(output.get_pub_key_hash()),
                        )
                    }
                }
                println!()
            }
        }
        Command::Reindexutxo => {
            let utxo_set = UTXOSet::new(open_blockchain()?);
            utxo_set.reindex()?;
            let count = utxo_set.count_transactions()?;
            println!("Done! There are {count} transactions in the UTXO set.");
        }
        Command::StartNode { node_id, miner } => {
            if let Some(node_id) = node_id {
                GLOBAL_CONFIG.set_node_id(node_id);
            }
            if let Some(addr) = miner {
                ensure_address(&addr)?;
                println!("Mining is on. Address to receive rewards: {addr}");
                GLOBAL_CONFIG.set_mining_addr(addr);
            }

            let blockchain = open_blockchain()?;
            let server = Server::new(blockchain, GLOBAL_CONFIG.server_config());
            server.run()?
        }
    }
    Ok(())
}
