use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ledger_core::chain::ChainStore;
use ledger_core::{format_hash, Block, Hash, OutPoint, StorageError, Transaction, Validator};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("transaction already known")]
    AlreadyKnown,
    /// An input refers to a transaction neither the pool nor the chain has.
    #[error("missing input transaction {}", format_hash(.missing))]
    MissingInput { missing: Hash },
    #[error("outpoint {outpoint} is already spent")]
    Conflict { outpoint: OutPoint },
    #[error("invalid transaction: {0}")]
    Invalid(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What the protocol layer needs from a transaction pool.
#[async_trait]
pub trait MempoolGateway: Send + Sync {
    async fn is_known(&self, hash: &Hash) -> bool;

    /// Validate against chain state and the pool, then admit.
    async fn add(&self, tx: Transaction) -> Result<(), MempoolError>;

    async fn get(&self, hash: &Hash) -> Option<Transaction>;

    /// Evict transactions confirmed by `block` and any that now conflict with it.
    async fn handle_block_confirmed(&self, block: &Block, txs: &[Transaction]);
}

#[derive(Default)]
struct Pool {
    txs: HashMap<Hash, Transaction>,
    spends: HashMap<OutPoint, Hash>,
}

impl Pool {
    fn remove(&mut self, hash: &Hash) -> Option<Transaction> {
        let tx = self.txs.remove(hash)?;
        for outpoint in tx.outpoints() {
            if self.spends.get(&outpoint) == Some(hash) {
                self.spends.remove(&outpoint);
            }
        }
        Some(tx)
    }

    fn first_conflict(&self, outpoints: &[OutPoint]) -> Option<OutPoint> {
        outpoints.iter().find(|op| self.spends.contains_key(op)).copied()
    }
}

/// In-memory pool of unconfirmed transactions.
pub struct TxStore {
    store: Arc<dyn ChainStore>,
    validator: Arc<dyn Validator>,
    verify_scripts: bool,
    pool: RwLock<Pool>,
}

impl TxStore {
    pub fn new(store: Arc<dyn ChainStore>, validator: Arc<dyn Validator>, verify_scripts: bool) -> Self {
        Self {
            store,
            validator,
            verify_scripts,
            pool: RwLock::new(Pool::default()),
        }
    }

    pub async fn len(&self) -> usize {
        self.pool.read().await.txs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn previous_output_count(&self, txid: &Hash) -> Result<Option<usize>, StorageError> {
        if let Some(prev) = self.pool.read().await.txs.get(txid) {
            return Ok(Some(prev.outputs.len()));
        }
        Ok(self
            .store
            .get_transaction_by_hash(txid)
            .await?
            .map(|prev| prev.outputs.len()))
    }
}

#[async_trait]
impl MempoolGateway for TxStore {
    async fn is_known(&self, hash: &Hash) -> bool {
        if self.pool.read().await.txs.contains_key(hash) {
            return true;
        }
        match self.store.knows_transaction(hash).await {
            Ok(known) => known,
            Err(err) => {
                warn!(error = %err, "transaction lookup failed");
                false
            }
        }
    }

    async fn add(&self, tx: Transaction) -> Result<(), MempoolError> {
        let hash = tx.hash();
        if self.is_known(&hash).await {
            return Err(MempoolError::AlreadyKnown);
        }
        if tx.inputs.is_empty() || tx.outputs.is_empty() {
            return Err(MempoolError::Invalid("no inputs or no outputs".to_string()));
        }
        if tx.inputs.iter().any(|input| input.prev_out.is_null()) {
            return Err(MempoolError::Invalid("coinbase input outside a block".to_string()));
        }

        for input in &tx.inputs {
            let outpoint = input.prev_out;
            match self.previous_output_count(&outpoint.txid).await? {
                None => return Err(MempoolError::MissingInput { missing: outpoint.txid }),
                Some(count) if outpoint.index as usize >= count => {
                    return Err(MempoolError::Invalid(format!("{outpoint} does not exist")));
                }
                Some(_) => {}
            }
        }

        let outpoints = tx.outpoints();
        for outpoint in &outpoints {
            let spent = self
                .store
                .count_conflicting_transactions(std::slice::from_ref(outpoint))
                .await?;
            if spent > 0 {
                return Err(MempoolError::Conflict { outpoint: *outpoint });
            }
        }

        if self.verify_scripts && !self.validator.check_scripts(&tx) {
            return Err(MempoolError::Invalid("script verification failed".to_string()));
        }

        let mut pool = self.pool.write().await;
        if pool.txs.contains_key(&hash) {
            return Err(MempoolError::AlreadyKnown);
        }
        if let Some(outpoint) = pool.first_conflict(&outpoints) {
            return Err(MempoolError::Conflict { outpoint });
        }
        for outpoint in outpoints {
            pool.spends.insert(outpoint, hash);
        }
        pool.txs.insert(hash, tx);
        debug!(hash = %format_hash(&hash), pool = pool.txs.len(), "transaction accepted");
        Ok(())
    }

    async fn get(&self, hash: &Hash) -> Option<Transaction> {
        self.pool.read().await.txs.get(hash).cloned()
    }

    async fn handle_block_confirmed(&self, block: &Block, txs: &[Transaction]) {
        let mut pool = self.pool.write().await;
        let mut evicted = 0;
        for tx in txs {
            let hash = tx.hash();
            if pool.remove(&hash).is_some() {
                evicted += 1;
            }
            for outpoint in tx.outpoints() {
                if let Some(loser) = pool.spends.get(&outpoint).copied() {
                    debug!(hash = %format_hash(&loser), "evicting double spend");
                    pool.remove(&loser);
                    evicted += 1;
                }
            }
        }
        if evicted > 0 {
            debug!(block = %format_hash(&block.hash()), evicted, "pool updated for new block");
        }
    }
}
