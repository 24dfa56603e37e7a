//! Minimal chain authority.
//!
//! Extends the active tip, keeps side branches as inactive fork candidates
//! and parks orphans until their parent shows up. There is no fork choice:
//! a side branch never becomes active on its own.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ledger_core::chain::{genesis_block, ChainStore};
use ledger_core::{format_hash, merkle_root, Block, Hash, StorageError, Transaction, Validator};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::events::{ChainEvent, EventSender};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid block: {0}")]
    Invalid(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Where an incoming block ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockStatus {
    /// Already stored, nothing changed.
    Known,
    /// Extended the active chain.
    Active,
    /// Stored inactive on a side branch.
    Fork,
    /// Parent unknown; parked until it arrives.
    Orphan,
}

#[derive(Default)]
struct Orphans {
    /// Parent hash to the orphans waiting on it.
    by_prev: HashMap<Hash, Vec<Hash>>,
    /// Transactions held back until the orphan connects.
    pending: HashMap<Hash, Vec<Transaction>>,
}

pub struct Chain {
    store: Arc<dyn ChainStore>,
    validator: Arc<dyn Validator>,
    verify: bool,
    checkpoint_height: u64,
    top_height: AtomicU64,
    // Serializes block insertion and guards the orphan pool.
    orphans: Mutex<Orphans>,
    events: EventSender,
}

impl Chain {
    pub fn new(
        store: Arc<dyn ChainStore>,
        validator: Arc<dyn Validator>,
        verify: bool,
        checkpoint_height: u64,
        events: EventSender,
    ) -> Self {
        Self {
            store,
            validator,
            verify,
            checkpoint_height,
            top_height: AtomicU64::new(0),
            orphans: Mutex::new(Orphans::default()),
            events,
        }
    }

    /// Make sure genesis is stored, load the tip and report `InitComplete`.
    pub async fn init(&self) -> Result<(), ChainError> {
        self.store.connect().await?;
        let top = match self.store.get_top_block().await? {
            Some(top) => top,
            None => {
                let genesis = genesis_block();
                self.store.save_block(&genesis).await?;
                info!(hash = %format_hash(&genesis.hash()), "stored genesis block");
                genesis
            }
        };
        self.top_height.store(top.height, Ordering::SeqCst);
        info!(height = top.height, hash = %format_hash(&top.hash()), "chain initialized");
        self.emit(ChainEvent::InitComplete);
        Ok(())
    }

    pub fn top_height(&self) -> u64 {
        self.top_height.load(Ordering::SeqCst)
    }

    pub async fn top_block(&self) -> Result<Option<Block>, ChainError> {
        Ok(self.store.get_top_block().await?)
    }

    pub fn is_past_checkpoints(&self) -> bool {
        self.top_height() >= self.checkpoint_height
    }

    pub async fn is_orphan(&self, hash: &Hash) -> bool {
        self.orphans.lock().await.pending.contains_key(hash)
    }

    pub async fn orphan_count(&self) -> usize {
        self.orphans.lock().await.pending.len()
    }

    /// Insert a block received from the network together with its transactions.
    ///
    /// The block's `txs` list is rebuilt from `txs`; height, active flag and
    /// chain work are assigned here.
    pub async fn add_block(&self, mut block: Block, txs: Vec<Transaction>) -> Result<BlockStatus, ChainError> {
        let mut orphans = self.orphans.lock().await;
        let hash = block.hash();
        if orphans.pending.contains_key(&hash) || self.store.knows_block(&hash).await? {
            return Ok(BlockStatus::Known);
        }

        block.txs = txs.iter().map(Transaction::hash).collect();
        self.check(&block)?;

        let status = self.attach(block, txs, &mut orphans).await?;
        if status == BlockStatus::Orphan {
            return Ok(status);
        }

        // Anything that was waiting on this block can connect now.
        let mut parents = VecDeque::from([hash]);
        while let Some(parent) = parents.pop_front() {
            for child in orphans.by_prev.remove(&parent).unwrap_or_default() {
                let txs = orphans.pending.remove(&child).unwrap_or_default();
                let Some(block) = self.store.get_block_by_hash(&child).await? else {
                    warn!(hash = %format_hash(&child), "parked orphan missing from storage");
                    continue;
                };
                debug!(hash = %format_hash(&child), "reconnecting orphan");
                self.attach(block, txs, &mut orphans).await?;
                parents.push_back(child);
            }
        }
        Ok(status)
    }

    fn check(&self, block: &Block) -> Result<(), ChainError> {
        if !self.verify {
            return Ok(());
        }
        if merkle_root(&block.txs) != block.header.merkle_root {
            return Err(ChainError::Invalid("merkle root mismatch".to_string()));
        }
        if !self.validator.check_proof_of_work(&block.header) {
            return Err(ChainError::Invalid("insufficient proof of work".to_string()));
        }
        Ok(())
    }

    async fn attach(&self, mut block: Block, txs: Vec<Transaction>, orphans: &mut Orphans) -> Result<BlockStatus, ChainError> {
        let hash = block.hash();
        let prev_hash = block.header.prev_hash;
        let parent = if orphans.pending.contains_key(&prev_hash) {
            None
        } else {
            self.store.get_block_by_hash(&prev_hash).await?
        };

        let Some(parent) = parent else {
            block.active = false;
            self.store.save_block(&block).await?;
            orphans.by_prev.entry(prev_hash).or_default().push(hash);
            orphans.pending.insert(hash, txs);
            debug!(hash = %format_hash(&hash), prev = %format_hash(&prev_hash), "parked orphan block");
            return Ok(BlockStatus::Orphan);
        };

        let top = self.store.get_top_block().await?;
        block.height = parent.height + 1;
        block.chain_work = parent.chain_work + block.header.work();
        block.active = parent.active && top.map_or(true, |top| top.hash() == parent.hash());

        let txs: Vec<Transaction> = txs.into_iter().map(Transaction::with_derived_affects).collect();
        self.store.save_transactions(&txs).await?;
        self.store.save_block(&block).await?;

        if !block.active {
            debug!(hash = %format_hash(&hash), height = block.height, "stored fork candidate");
            return Ok(BlockStatus::Fork);
        }
        self.top_height.store(block.height, Ordering::SeqCst);
        info!(hash = %format_hash(&hash), height = block.height, txs = txs.len(), "block connected");
        self.emit(ChainEvent::BlockConfirmed { block, txs });
        Ok(BlockStatus::Active)
    }

    fn emit(&self, event: ChainEvent) {
        if self.events.send(event.into()).is_err() {
            debug!("node event channel closed");
        }
    }
}
