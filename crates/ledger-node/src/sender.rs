use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ledger_core::{Hash, InvItem, Message, Transaction};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::mempool::MempoolGateway;
use crate::peers::PeerManager;

#[derive(Default)]
struct Pending {
    hashes: Vec<Hash>,
    /// Set after a rebroadcast; cleared by the next block.
    sent_this_block: bool,
}

/// Re-announces our own transactions until a block confirms them,
/// at most once per block.
pub struct TxSender {
    peers: Arc<PeerManager>,
    mempool: Arc<dyn MempoolGateway>,
    interval: Duration,
    enabled: AtomicBool,
    pending: Mutex<Pending>,
}

impl TxSender {
    pub fn new(peers: Arc<PeerManager>, mempool: Arc<dyn MempoolGateway>, interval: Duration) -> Self {
        Self {
            peers,
            mempool,
            interval,
            enabled: AtomicBool::new(false),
            pending: Mutex::new(Pending::default()),
        }
    }

    /// Start the rebroadcast ticker.
    pub fn enable(self: &Arc<Self>) -> JoinHandle<()> {
        self.enabled.store(true, Ordering::SeqCst);
        info!(interval_secs = self.interval.as_secs(), "transaction rebroadcast enabled");
        let sender = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sender.interval);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sender.tick().await;
            }
        })
    }

    pub async fn add(&self, hash: Hash) {
        let mut pending = self.pending.lock().await;
        if !pending.hashes.contains(&hash) {
            pending.hashes.push(hash);
        }
    }

    pub async fn pending(&self) -> Vec<Hash> {
        self.pending.lock().await.hashes.clone()
    }

    /// Drop what the block confirmed and open the next rebroadcast window.
    pub async fn handle_block(&self, txs: &[Transaction]) {
        let confirmed: Vec<Hash> = txs.iter().map(Transaction::hash).collect();
        let mut pending = self.pending.lock().await;
        pending.hashes.retain(|hash| !confirmed.contains(hash));
        pending.sent_this_block = false;
    }

    /// One rebroadcast round. Returns the number of transactions announced.
    pub async fn tick(&self) -> usize {
        if !self.enabled.load(Ordering::SeqCst) {
            return 0;
        }
        let mut pending = self.pending.lock().await;
        if pending.sent_this_block || pending.hashes.is_empty() {
            return 0;
        }

        let mut live = Vec::with_capacity(pending.hashes.len());
        for hash in &pending.hashes {
            if self.mempool.get(hash).await.is_some() {
                live.push(*hash);
            }
        }
        pending.hashes = live.clone();
        pending.sent_this_block = true;
        if live.is_empty() {
            return 0;
        }

        let items = live.iter().copied().map(InvItem::tx).collect();
        let reached = self.peers.broadcast(Message::Inv(items)).await;
        debug!(txs = live.len(), peers = reached, "rebroadcast pending transactions");
        live.len()
    }
}
