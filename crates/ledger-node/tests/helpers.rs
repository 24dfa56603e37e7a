#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ledger_core::chain::{genesis_block, ChainStore};
use ledger_core::{Block, BlockHeader, Hash, Message, OutPoint, PeerAddress, Transaction, TxIn, TxOut};
use ledger_node::{Connection, Node, NodeConfig, NodeContext, NodeState};
use ledger_storage::SledStore;
use rand::Rng;
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc::UnboundedReceiver;

pub fn test_config(temp_dir: &TempDir) -> NodeConfig {
    NodeConfig {
        home_dir: temp_dir.path().join("home"),
        data_dir: temp_dir.path().join("home").join("data"),
        verify: false,
        ..NodeConfig::default()
    }
}

/// A started node on a fresh sled store, already in `NetConnect`.
pub async fn running_node(configure: impl FnOnce(&mut NodeConfig)) -> anyhow::Result<(TempDir, Arc<Node>)> {
    // Create a temporary directory for the sled database
    let temp_dir = tempdir()?;
    let mut config = test_config(&temp_dir);
    configure(&mut config);
    let store = Arc::new(SledStore::open(&config.data_dir)?);
    let node = Node::new(NodeContext::new(config, store)).await?;
    node.start().await?;
    wait_for_state(&node, NodeState::NetConnect).await?;
    Ok((temp_dir, node))
}

pub async fn wait_for_state(node: &Node, state: NodeState) -> anyhow::Result<()> {
    let mut rx = node.subscribe();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state)).await??;
    Ok(())
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// A registered connection that has finished its handshake.
///
/// The first one moves the node through `BlockDownload` to `Default`; the
/// initial `getblocks` that triggers is drained before returning.
pub async fn handshaked_peer(node: &Arc<Node>, last_octet: u8) -> (Arc<Connection>, UnboundedReceiver<Message>) {
    let addr = PeerAddress::parse(&format!("10.0.0.{last_octet}:8333")).unwrap();
    let (conn, mut rx) = node.peers().register(addr).await;
    node.peers().mark_handshaked(&conn);
    wait_for_state(node, NodeState::Default).await.unwrap();
    drain(&mut rx);
    (conn, rx)
}

pub fn drain(rx: &mut UnboundedReceiver<Message>) -> Vec<Message> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}

pub fn child_of(prev: &Block) -> Block {
    let mut rng = rand::thread_rng();
    let header = BlockHeader::new(prev.hash(), rng.gen(), prev.header.timestamp + 600, prev.header.bits, rng.gen());
    let mut block = Block::new(header);
    block.height = prev.height + 1;
    block.active = true;
    block.chain_work = prev.chain_work + header.work();
    block
}

/// Store an active chain of `len` blocks (genesis included) directly.
pub async fn seed_chain(store: &Arc<dyn ChainStore>, len: usize) -> anyhow::Result<Vec<Block>> {
    let mut blocks = vec![genesis_block()];
    while blocks.len() < len {
        let next = child_of(blocks.last().unwrap());
        blocks.push(next);
    }
    for block in &blocks {
        store.save_block(block).await?;
    }
    Ok(blocks)
}

pub fn p2pkh(hash: [u8; 20]) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&hash);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

pub fn spend(prev_out: OutPoint, value: u64) -> Transaction {
    Transaction::new(
        vec![TxIn {
            prev_out,
            script_sig: vec![0x51],
            sequence: u32::MAX,
        }],
        vec![TxOut {
            value,
            script_pubkey: p2pkh([7u8; 20]),
        }],
    )
}

/// A confirmed-looking transaction with `outputs` spendable outputs.
pub fn funding(outputs: usize) -> Transaction {
    let mut rng = rand::thread_rng();
    Transaction::new(
        vec![TxIn {
            prev_out: OutPoint::null(),
            script_sig: rng.gen::<[u8; 8]>().to_vec(),
            sequence: u32::MAX,
        }],
        (0..outputs)
            .map(|i| TxOut {
                value: 50 + i as u64,
                script_pubkey: p2pkh([i as u8; 20]),
            })
            .collect(),
    )
}

pub fn random_hash() -> Hash {
    rand::thread_rng().gen()
}
