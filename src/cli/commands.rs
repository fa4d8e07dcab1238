use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "tallychain", about = "A small UTXO ledger with proof-of-work and peer sync")]
pub struct Opt {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(name = "createblockchain", about = "Create a new blockchain")]
    Createblockchain {
        #[arg(long, help = "The address to send genesis block reward to")]
        address: String,
    },
    #[command(name = "createwallet", about = "Create a new wallet")]
    Createwallet,
    #[command(
        name = "getbalance",
        about = "Get the wallet balance of the target address"
    )]
    GetBalance {
        #[arg(long, help = "The wallet address")]
        address: String,
    },
    #[command(name = "listaddresses", about = "Print local wallet addresses")]
    ListAddresses,
    #[command(name = "send", about = "Send coins between addresses")]
    Send {
        #[arg(long, help = "Source wallet address")]
        from: String,
        #[arg(long, help = "Destination wallet address")]
        to: String,
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..), help = "Amount to send")]
        amount: i64,
        #[arg(long, help = "Mine the transaction on this node right away")]
        mine: bool,
    },
    #[command(name = "printchain", about = "Print all blocks in the blockchain")]
    Printchain,
    #[command(name = "reindexutxo", about = "Rebuild UTXO index set")]
    Reindexutxo,
    #[command(name = "startnode", about = "Start a blockchain node")]
    StartNode {
        #[arg(long = "node-id", help = "Node identifier; defaults to NODE_ID")]
        node_id: Option<String>,
        #[arg(long, help = "Enable mining mode and send reward to ADDRESS")]
        miner: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send() {
        let opt = Opt::try_parse_from([
            "tallychain", "send", "--from", "a", "--to", "b", "--amount", "5", "--mine",
        ])
        .unwrap();
        match opt.command {
            Command::Send {
                from,
                to,
                amount,
                mine,
            } => {
                assert_eq!((from.as_str(), to.as_str(), amount, mine), ("a", "b", 5, true));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_rejects_bad_invocations() {
        assert!(Opt::try_parse_from(["tallychain", "getbalance"]).is_err());
        assert!(Opt::try_parse_from(["tallychain", "frobnicate"]).is_err());
        assert!(Opt::try_parse_from([
            "tallychain", "send", "--from", "a", "--to", "b", "--amount", "0",
        ])
        .is_err());
    }

    #[test]
    fn test_parse_startnode() {
        let opt =
            Opt::try_parse_from(["tallychain", "startnode", "--node-id", "3001", "--miner", "m"])
                .unwrap();
        assert!(matches!(
            opt.command,
            Command::StartNode { node_id: Some(ref id), miner: Some(ref m) } if id == "3001" && m == "m"
        ));
    }
}
