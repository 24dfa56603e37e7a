use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use ledger_node::{transport, Node, NodeConfig, NodeContext};
use ledger_storage::SledStore;
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "ledger-node", version, about = "Ledger node synchronization core")]
struct Args {
    /// Home directory for node state
    #[arg(long, default_value = "./ledger")]
    home_dir: PathBuf,

    /// Data directory for sled
    #[arg(long, default_value = "./ledger/data")]
    data_dir: PathBuf,

    /// Peer listener address, e.g. 0.0.0.0:8333
    #[arg(long, default_value = "0.0.0.0:8333")]
    listen: SocketAddr,

    /// Status server address, e.g. 127.0.0.1:8080
    #[arg(long)]
    rpc_listen: Option<SocketAddr>,

    /// Peer to connect to (repeatable): ip:port, [ipv6]:port or hostname:port.
    /// Host names are resolved once at startup.
    #[arg(long = "connect", value_name = "ADDR")]
    connect: Vec<String>,

    /// Skip merkle root and proof-of-work checks on incoming blocks
    #[arg(long)]
    no_verify: bool,

    /// Skip script checks on incoming transactions
    #[arg(long)]
    no_verify_scripts: bool,

    /// Height below which relayed transactions are ignored
    #[arg(long, default_value_t = 0)]
    checkpoint_height: u64,

    /// Seconds between rebroadcasts of our own transactions
    #[arg(long, default_value_t = 60)]
    rebroadcast_secs: u64,
}

impl From<Args> for NodeConfig {
    fn from(args: Args) -> Self {
        Self {
            home_dir: args.home_dir,
            data_dir: args.data_dir,
            listen: Some(args.listen),
            rpc_listen: args.rpc_listen,
            peers: Vec::new(),
            verify: !args.no_verify,
            verify_scripts: !args.no_verify_scripts,
            checkpoint_height: args.checkpoint_height,
            rebroadcast_secs: args.rebroadcast_secs,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let seeds = args.connect.clone();
    let mut config = NodeConfig::from(args);
    for seed in &seeds {
        match transport::resolve_seed(seed).await {
            Ok(addrs) => config.peers.extend(addrs),
            Err(err) => warn!(seed = %seed, error = %err, "skipping seed"),
        }
    }
    let store = Arc::new(SledStore::open(&config.data_dir)?);
    let node = Node::new(NodeContext::new(config, store)).await?;

    node.start().await?;
    info!("ledger-node started, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    node.shutdown().await?;
    Ok(())
}
