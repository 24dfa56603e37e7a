//! Per-message inventory logic: `inv`, `getdata`, `getblocks`,
//! `getheaders`, plus incoming `block`/`tx` and local announcements.
//!
//! Handlers are stateless apart from the per-connection continuation
//! marker. Errors never close a connection; the caller logs them.

use std::collections::HashSet;
use std::sync::Arc;

use ledger_core::chain::ChainStore;
use ledger_core::constants::{MAX_BLOCKS_PER_INV, MAX_HEADERS_PER_REPLY};
use ledger_core::{
    format_hash, Block, BlockMessage, Hash, InvItem, InvKind, Message, StorageError, Transaction,
};
use tracing::{debug, warn};

use crate::chain::{BlockStatus, Chain};
use crate::download::DownloadManager;
use crate::mempool::{MempoolError, MempoolGateway};
use crate::peers::{Connection, PeerManager};
use crate::sender::TxSender;

const NULL_HASH: Hash = [0u8; 32];

pub struct InventoryHandler {
    store: Arc<dyn ChainStore>,
    chain: Arc<Chain>,
    mempool: Arc<dyn MempoolGateway>,
    peers: Arc<PeerManager>,
    sender: Arc<TxSender>,
    download: Arc<DownloadManager>,
}

impl InventoryHandler {
    pub fn new(
        store: Arc<dyn ChainStore>,
        chain: Arc<Chain>,
        mempool: Arc<dyn MempoolGateway>,
        peers: Arc<PeerManager>,
        sender: Arc<TxSender>,
        download: Arc<DownloadManager>,
    ) -> Self {
        Self {
            store,
            chain,
            mempool,
            peers,
            sender,
            download,
        }
    }

    /// Request everything announced that we don't have, in one `getdata`.
    pub async fn handle_inv(&self, items: &[InvItem], conn: &Connection) -> Result<(), StorageError> {
        let accept_txs = self.chain.is_past_checkpoints();
        let mut seen = HashSet::new();
        let mut wanted = Vec::new();

        for item in items {
            if item.hash == NULL_HASH || !seen.insert(*item) {
                continue;
            }
            match item.kind {
                InvKind::Transaction => {
                    if accept_txs && !self.mempool.is_known(&item.hash).await {
                        wanted.push(*item);
                    }
                }
                InvKind::Block => match self.store.knows_block(&item.hash).await {
                    Ok(false) => wanted.push(*item),
                    Ok(true) => {
                        if self.chain.is_orphan(&item.hash).await {
                            if let Err(err) = self.download.request_blocks(conn, item.hash).await {
                                warn!(peer = %conn.addr(), error = %err, "could not request orphan ancestors");
                            }
                        }
                    }
                    Err(err) => {
                        warn!(peer = %conn.addr(), hash = %format_hash(&item.hash), error = %err, "skipping block inventory");
                    }
                },
                InvKind::Unknown(code) => debug!(code, "ignoring unknown inventory kind"),
            }
        }

        if !wanted.is_empty() {
            debug!(peer = %conn.addr(), items = wanted.len(), "requesting data");
            conn.send(Message::GetData(wanted));
        }
        Ok(())
    }

    /// Serve requested objects one at a time, in request order.
    pub async fn handle_getdata(&self, items: &[InvItem], conn: &Connection) -> Result<(), StorageError> {
        for item in items {
            match item.kind {
                InvKind::Transaction => {
                    if let Some(tx) = self.mempool.get(&item.hash).await {
                        conn.send(Message::Tx(tx));
                    }
                }
                InvKind::Block => {
                    let Some(block) = self.store.get_block_by_hash(&item.hash).await? else {
                        debug!(hash = %format_hash(&item.hash), "requested block not found");
                        continue;
                    };
                    let txs = self.store.get_transactions_by_hashes(&block.txs).await?;
                    conn.send(Message::Block(BlockMessage {
                        header: block.header,
                        txs,
                        size: block.size,
                    }));

                    // The peer reached the end of a truncated getblocks reply;
                    // point it at our tip so it asks for the rest.
                    if conn.continuation().await == Some(item.hash) {
                        conn.set_continuation(None).await;
                        if let Some(top) = self.store.get_top_block().await? {
                            conn.send(Message::Inv(vec![InvItem::block(top.hash())]));
                        }
                    }
                }
                InvKind::Unknown(_) => {}
            }
        }
        Ok(())
    }

    pub async fn handle_getblocks(&self, locator: &[Hash], stop: &Hash, conn: &Connection) -> Result<(), StorageError> {
        let Some(blocks) = self.walk(locator, stop, MAX_BLOCKS_PER_INV).await? else {
            debug!(peer = %conn.addr(), "getblocks locator matched nothing");
            return Ok(());
        };
        let hashes: Vec<Hash> = blocks.iter().map(Block::hash).collect();
        if hashes.is_empty() {
            return Ok(());
        }
        if hashes.len() == MAX_BLOCKS_PER_INV {
            conn.set_continuation(hashes.last().copied()).await;
        }
        conn.send(Message::Inv(hashes.into_iter().map(InvItem::block).collect()));
        Ok(())
    }

    pub async fn handle_getheaders(&self, locator: &[Hash], stop: &Hash, conn: &Connection) -> Result<(), StorageError> {
        let Some(blocks) = self.walk(locator, stop, MAX_HEADERS_PER_REPLY).await? else {
            debug!(peer = %conn.addr(), "getheaders locator matched nothing");
            return Ok(());
        };
        conn.send(Message::Headers(blocks.iter().map(|b| b.header).collect()));
        Ok(())
    }

    /// Active blocks following the locator match, one height at a time, up to
    /// `cap`. Ends before `stop` and at the first missing or inactive height.
    /// `None` when the locator matches nothing.
    async fn walk(&self, locator: &[Hash], stop: &Hash, cap: usize) -> Result<Option<Vec<Block>>, StorageError> {
        let Some(start) = self.store.get_block_by_locator(locator).await? else {
            return Ok(None);
        };
        let mut blocks = Vec::new();
        let mut height = start.height;
        while blocks.len() < cap {
            height += 1;
            let Some(block) = self.store.get_block_by_height(height).await? else {
                break;
            };
            if !block.active || block.hash() == *stop {
                break;
            }
            blocks.push(block);
        }
        Ok(Some(blocks))
    }

    /// Announce one item to every active connection.
    pub async fn send_inv_to_all(&self, item: InvItem) -> usize {
        let reached = self.peers.broadcast(Message::Inv(vec![item])).await;
        debug!(hash = %format_hash(&item.hash), peers = reached, "announced inventory");
        reached
    }

    /// Admit a locally created transaction, schedule it for rebroadcast and announce it.
    pub async fn send_transaction(&self, tx: Transaction) -> Result<(), MempoolError> {
        let hash = tx.hash();
        self.mempool.add(tx).await?;
        self.sender.add(hash).await;
        self.send_inv_to_all(InvItem::tx(hash)).await;
        Ok(())
    }

    pub async fn handle_tx(&self, tx: Transaction, conn: &Connection) {
        if !self.chain.is_past_checkpoints() {
            return;
        }
        let hash = tx.hash();
        if self.mempool.is_known(&hash).await {
            return;
        }
        match self.mempool.add(tx).await {
            Ok(()) => {
                self.send_inv_to_all(InvItem::tx(hash)).await;
            }
            Err(MempoolError::MissingInput { missing }) => {
                debug!(peer = %conn.addr(), hash = %format_hash(&hash), missing = %format_hash(&missing), "orphan transaction");
            }
            Err(err) => {
                warn!(peer = %conn.addr(), hash = %format_hash(&hash), error = %err, "transaction rejected");
            }
        }
    }

    pub async fn handle_block(&self, message: BlockMessage, conn: &Connection) -> Result<(), StorageError> {
        let mut block = Block::new(message.header);
        block.size = message.size;
        let hash = block.hash();
        match self.chain.add_block(block, message.txs).await {
            Ok(BlockStatus::Orphan) => {
                debug!(peer = %conn.addr(), hash = %format_hash(&hash), "orphan block, asking for its ancestors");
                self.download.request_blocks(conn, hash).await?;
            }
            Ok(status) => debug!(peer = %conn.addr(), hash = %format_hash(&hash), ?status, "block handled"),
            Err(err) => warn!(peer = %conn.addr(), hash = %format_hash(&hash), error = %err, "block rejected"),
        }
        Ok(())
    }
}
