use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ledger-cli")]
#[command(about = "Query the status server of a running ledger node")]
struct Cli {
    /// Node status server base URL
    #[arg(long, global = true, default_value = "http://127.0.0.1:8080")]
    node: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Liveness check
    Health,
    /// Node state, tip height and hash, peer and mempool counts
    Status,
    /// What the node knows about a block
    Block {
        /// Block hash in display (byte-reversed) hex
        hash: String,
    },
}

impl Command {
    fn path(&self) -> String {
        match self {
            Self::Health => "/health".to_string(),
            Self::Status => "/status".to_string(),
            Self::Block { hash } => format!("/block/{hash}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .pretty()
        .init();

    let cli = Cli::parse();
    if let Command::Block { hash } = &cli.cmd {
        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("expected a 64 character hex hash, got {hash:?}");
        }
    }

    let url = format!("{}{}", cli.node.trim_end_matches('/'), cli.cmd.path());
    debug!(%url, "querying node");
    let res = reqwest::Client::new().get(&url).send().await?;
    let status = res.status();
    let body = res.text().await?;
    if !status.is_success() {
        bail!("node answered {status}: {body}");
    }

    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{body}"),
    }
    Ok(())
}
