mod helpers;

use std::fs;
use std::sync::Arc;

use async_trait::async_trait;
use helpers::{child_of, drain, eventually, funding, running_node, spend, test_config, wait_for_state};
use ledger_core::chain::{genesis_block, ChainStore};
use ledger_core::{
    AddressHash, Block, BlockMessage, Hash, InvItem, Message, OutPoint, PeerAddress, StorageError, Transaction,
};
use ledger_node::{MempoolGateway, Node, NodeContext, NodeError, NodeState};
use ledger_storage::SledStore;
use tempfile::tempdir;

#[tokio::test]
async fn test_startup_reaches_net_connect() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let config = test_config(&temp_dir);
    let store = Arc::new(SledStore::open(&config.data_dir)?);
    let node = Node::new(NodeContext::new(config, store)).await?;
    assert_eq!(node.state(), NodeState::Uninitialized);

    // Traffic before the node runs is refused
    let (conn, mut outbox) = node.peers().register(PeerAddress::parse("10.1.1.1")?).await;
    assert!(!node.handle_message(&conn, Message::Verack).await);

    // So are whole connections: nothing is announced and the record goes away
    let (_inbound, messages) = tokio::sync::mpsc::unbounded_channel();
    node.accept(Arc::clone(&conn), messages, true).await;
    assert!(drain(&mut outbox).is_empty());
    assert_eq!(node.peers().connection_count().await, 0);

    let mut states = node.subscribe();
    node.start().await?;
    states.wait_for(|s| *s == NodeState::NetConnect).await?;
    assert!(node.is_running());
    assert!(node.peers().is_enabled());
    assert!(temp_dir.path().join("home").join("data").exists());

    // Init can't be re-entered
    node.start().await?;
    assert!(!node.set_state(NodeState::Init).await);
    assert!(!node.set_state(NodeState::Default).await);
    assert_eq!(node.state(), NodeState::NetConnect);

    let top = node.store().get_top_block().await?.expect("genesis");
    assert_eq!(top, genesis_block());

    node.shutdown().await?;
    temp_dir.close()?;
    Ok(())
}

#[tokio::test]
async fn test_handshake_drives_block_download() -> anyhow::Result<()> {
    let (temp_dir, node) = running_node(|_| {}).await?;
    let (conn, mut rx) = node.peers().register(PeerAddress::parse("10.1.1.2:8333")?).await;

    // The peer is three blocks ahead
    node.handle_message(&conn, Message::Version { version: 70000, services: 1, height: 3 })
        .await;
    assert_eq!(drain(&mut rx), vec![Message::Verack]);
    node.handle_message(&conn, Message::Verack).await;
    wait_for_state(&node, NodeState::BlockDownload).await?;

    // The download manager asks that peer for everything past genesis
    let outbox = &rx;
    assert!(eventually(|| async move { !outbox.is_empty() }).await);
    match drain(&mut rx).as_slice() {
        [Message::GetBlocks { locator, stop }] => {
            assert_eq!(locator, &vec![genesis_block().hash()]);
            assert_eq!(*stop, [0u8; 32]);
        }
        other => panic!("expected getblocks, got {other:?}"),
    }

    // Catching up with the peer's height finishes the download phase
    let mut prev = genesis_block();
    for _ in 0..3 {
        let mut next = child_of(&prev);
        next.header.merkle_root = [0u8; 32];
        let message = BlockMessage { header: next.header, txs: vec![], size: 80 };
        node.handle_message(&conn, Message::Block(message)).await;
        prev = next;
    }
    wait_for_state(&node, NodeState::Default).await?;
    assert_eq!(node.chain().top_height(), 3);

    temp_dir.close()?;
    Ok(())
}

#[tokio::test]
async fn test_accept_answers_version_and_completes_handshake() -> anyhow::Result<()> {
    let (temp_dir, node) = running_node(|_| {}).await?;
    let (conn, mut outbox) = node.peers().register(PeerAddress::parse("10.1.1.3:8333")?).await;
    let (inbound, messages) = tokio::sync::mpsc::unbounded_channel();
    node.accept(Arc::clone(&conn), messages, true).await;

    inbound.send(Message::Version { version: 70000, services: 1, height: 0 })?;
    inbound.send(Message::Verack)?;
    let peer = &conn;
    assert!(eventually(|| async move { peer.is_handshaked() }).await);

    let sent = drain(&mut outbox);
    assert!(matches!(sent.first(), Some(Message::Version { height: 0, .. })));
    assert!(sent.contains(&Message::Verack));
    wait_for_state(&node, NodeState::Default).await?;

    // Closing the peer's side removes the connection
    drop(inbound);
    let node = &node;
    assert!(eventually(|| async move { node.peers().connection_count().await == 0 }).await);

    temp_dir.close()?;
    Ok(())
}

#[tokio::test]
async fn test_confirmed_block_evicts_mempool_entries() -> anyhow::Result<()> {
    let (temp_dir, node) = running_node(|_| {}).await?;
    let funding = funding(2);
    node.store().save_transaction(&funding).await?;

    let ours = spend(OutPoint::new(funding.hash(), 0), 10);
    let other = spend(OutPoint::new(funding.hash(), 1), 20);
    node.handler().send_transaction(ours.clone()).await?;
    node.handler().send_transaction(other.clone()).await?;
    assert_eq!(node.mempool().len().await, 2);
    assert_eq!(node.sender().pending().await.len(), 2);

    // A block confirms `ours` and a double spend of `other`'s input
    let rival = spend(OutPoint::new(funding.hash(), 1), 19);
    let block = child_of(&genesis_block());
    node.chain().add_block(block, vec![ours.clone(), rival.clone()]).await?;

    let node = &node;
    assert!(eventually(|| async move { node.mempool().is_empty().await }).await);
    assert!(!node.mempool().is_known(&other.hash()).await);
    assert!(node.mempool().is_known(&ours.hash()).await, "confirmed, so known through storage");
    let other_hash = other.hash();
    assert!(eventually(|| async move { node.sender().pending().await == vec![other_hash] }).await);

    temp_dir.close()?;
    Ok(())
}

#[tokio::test]
async fn test_rebroadcast_once_per_block() -> anyhow::Result<()> {
    let (temp_dir, node) = running_node(|_| {}).await?;
    let (_conn, mut rx) = helpers::handshaked_peer(&node, 9).await;
    let funding = funding(1);
    node.store().save_transaction(&funding).await?;
    let tx = spend(OutPoint::new(funding.hash(), 0), 1);
    node.handler().send_transaction(tx.clone()).await?;
    drain(&mut rx);

    assert_eq!(node.sender().tick().await, 1);
    assert_eq!(drain(&mut rx), vec![Message::Inv(vec![InvItem::tx(tx.hash())])]);
    // Throttled until the next block
    assert_eq!(node.sender().tick().await, 0);
    node.sender().handle_block(&[]).await;
    assert_eq!(node.sender().tick().await, 1);

    temp_dir.close()?;
    Ok(())
}

#[tokio::test]
async fn test_setup_failure_never_initializes() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    // A file where the home directory should go
    let blocker = temp_dir.path().join("home");
    fs::write(&blocker, b"not a directory")?;
    let config = test_config(&temp_dir);
    let store = Arc::new(SledStore::open_temporary()?);

    match Node::new(NodeContext::new(config, store)).await {
        Err(NodeError::Setup(_)) => {}
        Err(other) => panic!("expected a setup error, got {other}"),
        Ok(_) => panic!("node constructed on top of a file"),
    }
    temp_dir.close()?;
    Ok(())
}

/// Opens fine, then fails every read.
struct BrokenStore;

fn down<T>() -> Result<T, StorageError> {
    Err(StorageError::Unavailable("disk gone".to_string()))
}

#[async_trait]
impl ChainStore for BrokenStore {
    async fn connect(&self) -> Result<(), StorageError> {
        Ok(())
    }
    async fn save_block(&self, _: &Block) -> Result<(), StorageError> {
        down()
    }
    async fn save_transaction(&self, _: &Transaction) -> Result<bool, StorageError> {
        down()
    }
    async fn save_transactions(&self, _: &[Transaction]) -> Result<usize, StorageError> {
        down()
    }
    async fn get_block_by_hash(&self, _: &Hash) -> Result<Option<Block>, StorageError> {
        down()
    }
    async fn get_block_by_height(&self, _: u64) -> Result<Option<Block>, StorageError> {
        down()
    }
    async fn get_blocks_by_hashes(&self, _: &[Hash]) -> Result<Vec<Block>, StorageError> {
        down()
    }
    async fn get_blocks_by_heights(&self, _: &[u64]) -> Result<Vec<Block>, StorageError> {
        down()
    }
    async fn get_block_by_prev(&self, _: &Hash) -> Result<Option<Block>, StorageError> {
        down()
    }
    async fn get_block_by_locator(&self, _: &[Hash]) -> Result<Option<Block>, StorageError> {
        down()
    }
    async fn get_top_block(&self) -> Result<Option<Block>, StorageError> {
        down()
    }
    async fn get_block_slice(&self, _: i64, _: Option<usize>) -> Result<Vec<Hash>, StorageError> {
        down()
    }
    async fn knows_block(&self, _: &Hash) -> Result<bool, StorageError> {
        down()
    }
    async fn knows_transaction(&self, _: &Hash) -> Result<bool, StorageError> {
        down()
    }
    async fn block_contains_transaction(&self, _: &Hash, _: &Hash) -> Result<bool, StorageError> {
        down()
    }
    async fn get_transaction_by_hash(&self, _: &Hash) -> Result<Option<Transaction>, StorageError> {
        down()
    }
    async fn get_transactions_by_hashes(&self, _: &[Hash]) -> Result<Vec<Transaction>, StorageError> {
        down()
    }
    async fn get_conflicting_transactions(&self, _: &[OutPoint]) -> Result<Vec<Transaction>, StorageError> {
        down()
    }
    async fn count_conflicting_transactions(&self, _: &[OutPoint]) -> Result<usize, StorageError> {
        down()
    }
    async fn get_affected_transactions(&self, _: &[AddressHash]) -> Result<Vec<Hash>, StorageError> {
        down()
    }
    async fn get_containing_block(&self, _: &Hash) -> Result<Option<Hash>, StorageError> {
        down()
    }
    async fn empty_database(&self) -> Result<(), StorageError> {
        down()
    }
    async fn drop_database(&self) -> Result<(), StorageError> {
        down()
    }
    async fn flush(&self) -> Result<(), StorageError> {
        down()
    }
}

#[tokio::test]
async fn test_chain_init_failure_is_terminal() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let node = Node::new(NodeContext::new(test_config(&temp_dir), Arc::new(BrokenStore))).await?;

    let err = node.start().await.expect_err("chain init must fail");
    assert!(matches!(err, NodeError::Chain(_)));
    assert_eq!(node.state(), NodeState::Failed);
    assert!(!node.set_state(NodeState::Init).await);
    assert!(!node.set_state(NodeState::NetConnect).await);
    assert!(!node.is_running());

    temp_dir.close()?;
    Ok(())
}
