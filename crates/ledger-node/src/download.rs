use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ledger_core::chain::ChainStore;
use ledger_core::{format_hash, Block, Hash, Message, StorageError};
use tracing::{debug, info};

use crate::constants::LOCATOR_DENSE_STEPS;
use crate::peers::Connection;

/// Asks peers for the blocks past our tip.
pub struct DownloadManager {
    store: Arc<dyn ChainStore>,
    enabled: AtomicBool,
}

impl DownloadManager {
    pub fn new(store: Arc<dyn ChainStore>) -> Self {
        Self {
            store,
            enabled: AtomicBool::new(false),
        }
    }

    pub fn enable(&self) {
        if !self.enabled.swap(true, Ordering::SeqCst) {
            info!("block download enabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Locator for the current active chain, most recent first.
    pub async fn locator(&self) -> Result<Vec<Hash>, StorageError> {
        let Some(top) = self.store.get_top_block().await? else {
            return Ok(Vec::new());
        };
        let blocks = self.store.get_blocks_by_heights(&locator_heights(top.height)).await?;
        Ok(blocks.iter().map(Block::hash).collect())
    }

    /// Send `getblocks` from our tip towards `stop` (all zeros for "as far as you have").
    pub async fn request_blocks(&self, conn: &Connection, stop: Hash) -> Result<(), StorageError> {
        if !self.is_enabled() {
            debug!(peer = %conn.addr(), "download disabled, not requesting blocks");
            return Ok(());
        }
        let locator = self.locator().await?;
        debug!(peer = %conn.addr(), entries = locator.len(), stop = %format_hash(&stop), "requesting blocks");
        conn.send(Message::GetBlocks { locator, stop });
        Ok(())
    }
}

/// Heights sampled for a locator: dense near `top`, then doubling steps, always ending at genesis.
pub fn locator_heights(top: u64) -> Vec<u64> {
    let mut heights = Vec::new();
    let mut height = top;
    let mut step = 1u64;
    loop {
        heights.push(height);
        if height == 0 {
            break;
        }
        if heights.len() >= LOCATOR_DENSE_STEPS {
            step = step.saturating_mul(2);
        }
        height = height.saturating_sub(step);
    }
    heights
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_chain_is_fully_listed() {
        assert_eq!(locator_heights(0), vec![0]);
        assert_eq!(locator_heights(3), vec![3, 2, 1, 0]);
    }

    #[test]
    fn long_chain_steps_double() {
        let heights = locator_heights(1000);
        assert_eq!(&heights[..10], &[1000, 999, 998, 997, 996, 995, 994, 993, 992, 991]);
        assert_eq!(heights[10], 989);
        assert_eq!(heights[11], 985);
        assert_eq!(*heights.last().unwrap(), 0);
        assert!(heights.windows(2).all(|w| w[0] > w[1]));
    }
}
