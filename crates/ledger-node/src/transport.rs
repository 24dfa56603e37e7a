//! Line-delimited JSON framing over TCP.
//!
//! Each side writes one serialized [`Message`] per line. The node sees
//! only the decoded messages; see [`Node::accept`].

use std::net::SocketAddr;
use std::sync::Arc;

use ledger_core::constants::DEFAULT_PORT;
use ledger_core::{Message, PeerAddress};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::node::Node;

pub async fn listen(node: Arc<Node>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("accepting peers on {addr}");
    loop {
        let (stream, remote) = listener.accept().await?;
        attach(&node, stream, PeerAddress::from(remote), true).await;
    }
}

pub async fn dial(node: Arc<Node>, addr: PeerAddress) -> std::io::Result<()> {
    let stream = TcpStream::connect(addr.socket_addr()).await?;
    attach(&node, stream, addr, false).await;
    Ok(())
}

/// Turn a seed into addresses. IP literals are taken as they are; host
/// names are looked up once, here. A missing port means [`DEFAULT_PORT`].
pub async fn resolve_seed(seed: &str) -> std::io::Result<Vec<PeerAddress>> {
    if let Ok(addr) = PeerAddress::parse(seed) {
        return Ok(vec![addr]);
    }
    let (host, port) = match seed.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid port in seed {seed:?}"))
            })?;
            (host, port)
        }
        None => (seed, DEFAULT_PORT),
    };
    let mut resolved: Vec<PeerAddress> = Vec::new();
    for addr in lookup_host((host, port)).await?.map(PeerAddress::from) {
        if !resolved.contains(&addr) {
            resolved.push(addr);
        }
    }
    debug!(seed, addresses = resolved.len(), "seed resolved");
    Ok(resolved)
}

async fn attach(node: &Arc<Node>, stream: TcpStream, addr: PeerAddress, inbound: bool) {
    let (conn, mut outbox) = node.peers().register(addr).await;
    let (read, mut write) = stream.into_split();
    let (messages_tx, messages_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            let mut line = match serde_json::to_vec(&message) {
                Ok(line) => line,
                Err(err) => {
                    debug!(peer = %addr, error = %err, "could not encode message");
                    continue;
                }
            };
            line.push(b'\n');
            if write.write_all(&line).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match serde_json::from_str::<Message>(&line) {
                Ok(message) => {
                    if messages_tx.send(message).is_err() {
                        break;
                    }
                }
                Err(err) => debug!(peer = %addr, error = %err, "malformed message skipped"),
            }
        }
    });

    node.accept(conn, messages_rx, inbound).await;
}
