use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use ledger_core::chain::ChainStore;
use ledger_core::{format_hash, AddressHash, Block, Hash, OutPoint, StorageError, Transaction};
use serde::de::DeserializeOwned;
use sled::transaction::{
  abort, ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
  TransactionalTree, UnabortableTransactionError,
};
use sled::{Db, IVec, Transactional, Tree};
use tracing::{debug, info};

use crate::{codec_error, sled_error};

// Trees:
//   blocks         hash                    -> Block
//   transactions   hash                    -> Transaction
//   block_prev     prev[32] ++ hash[32]    -> ()
//   block_height   height[8] BE ++ hash    -> active flag
//   active_height  height[8] BE            -> hash
//   tx_blocks      tx[32] ++ block[32]     -> ()
//   spends         outpoint[36] ++ tx[32]  -> ()
//   affects        address[20] ++ tx[32]   -> ()
const TREE_BLOCKS: &str = "blocks";
const TREE_TRANSACTIONS: &str = "transactions";
const TREE_BLOCK_PREV: &str = "block_prev";
const TREE_BLOCK_HEIGHT: &str = "block_height";
const TREE_ACTIVE_HEIGHT: &str = "active_height";
const TREE_TX_BLOCKS: &str = "tx_blocks";
const TREE_SPENDS: &str = "spends";
const TREE_AFFECTS: &str = "affects";

const ALL_TREES: &[&str] = &[
  TREE_BLOCKS,
  TREE_TRANSACTIONS,
  TREE_BLOCK_PREV,
  TREE_BLOCK_HEIGHT,
  TREE_ACTIVE_HEIGHT,
  TREE_TX_BLOCKS,
  TREE_SPENDS,
  TREE_AFFECTS,
];

const EMPTY: &[u8] = &[];

/// Why the one-shot batch insert gave up.
#[derive(Debug)]
enum BatchFailure {
  /// Some keys already exist; nothing was written.
  Duplicates(usize),
  Storage(StorageError),
}

#[derive(Clone)]
pub struct SledStore {
  db: Db,
}

impl SledStore {
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
    let db = sled::open(path).map_err(sled_error)?;
    info!("sled store opened");
    Ok(Self { db })
  }

  /// In-memory store removed on drop.
  pub fn open_temporary() -> Result<Self, StorageError> {
    let db = sled::Config::new()
      .temporary(true)
      .open()
      .map_err(sled_error)?;
    Ok(Self { db })
  }

  /// Remove every record from every tree.
  pub fn clear(&self) -> Result<(), StorageError> {
    for name in ALL_TREES {
      self.tree(name)?.clear().map_err(sled_error)?;
    }
    Ok(())
  }

  fn tree(&self, name: &str) -> Result<Tree, StorageError> {
    self.db.open_tree(name).map_err(sled_error)
  }

  fn read<T: DeserializeOwned>(&self, tree: &str, key: &[u8]) -> Result<Option<T>, StorageError> {
    match self.tree(tree)?.get(key).map_err(sled_error)? {
      Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(codec_error)?)),
      None => Ok(None),
    }
  }

  fn block(&self, hash: &Hash) -> Result<Option<Block>, StorageError> {
    self.read(TREE_BLOCKS, hash)
  }

  fn transaction(&self, hash: &Hash) -> Result<Option<Transaction>, StorageError> {
    self.read(TREE_TRANSACTIONS, hash)
  }

  fn active_hash_at(&self, height: u64) -> Result<Option<Hash>, StorageError> {
    match self
      .tree(TREE_ACTIVE_HEIGHT)?
      .get(height.to_be_bytes())
      .map_err(sled_error)?
    {
      Some(v) => Ok(Some(hash_at(&v, 0)?)),
      None => Ok(None),
    }
  }

  fn top_height(&self) -> Result<Option<u64>, StorageError> {
    match self.tree(TREE_ACTIVE_HEIGHT)?.last().map_err(sled_error)? {
      Some((key, _)) => Ok(Some(height_from_key(&key)?)),
      None => Ok(None),
    }
  }

  /// Distinct hashes stored in the 32 bytes after `prefix` for every key under each prefix.
  fn scan_suffixes<'a, I>(&self, tree: &str, prefixes: I) -> Result<Vec<Hash>, StorageError>
  where
    I: IntoIterator<Item = &'a [u8]>,
  {
    let tree = self.tree(tree)?;
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for prefix in prefixes {
      for entry in tree.scan_prefix(prefix) {
        let (key, _) = entry.map_err(sled_error)?;
        let hash = hash_at(&key, prefix.len())?;
        if seen.insert(hash) {
          out.push(hash);
        }
      }
    }
    Ok(out)
  }

  fn spenders(&self, outpoints: &[OutPoint]) -> Result<Vec<Hash>, StorageError> {
    let keys: Vec<[u8; 36]> = outpoints.iter().map(OutPoint::to_key).collect();
    self.scan_suffixes(TREE_SPENDS, keys.iter().map(|k| &k[..]))
  }

  /// First phase of a bulk insert: everything in one sled transaction, or nothing.
  fn insert_batch(&self, encoded: &[(Hash, &Transaction, Vec<u8>)]) -> Result<usize, BatchFailure> {
    let tree = |name: &str| self.tree(name).map_err(BatchFailure::Storage);
    let (txs, spends, affects) = (tree(TREE_TRANSACTIONS)?, tree(TREE_SPENDS)?, tree(TREE_AFFECTS)?);

    (&txs, &spends, &affects)
      .transaction(
        |(txs, spends, affects)| -> ConflictableTransactionResult<usize, BatchFailure> {
          let mut duplicates = 0;
          for (hash, _, _) in encoded {
            if txs.get(&hash[..])?.is_some() {
              duplicates += 1;
            }
          }
          if duplicates > 0 {
            return abort(BatchFailure::Duplicates(duplicates));
          }

          let mut seen = HashSet::new();
          for (hash, tx, bytes) in encoded {
            if !seen.insert(*hash) {
              continue;
            }
            txs.insert(&hash[..], &bytes[..])?;
            index_transaction(hash, tx, spends, affects)?;
          }
          Ok(seen.len())
        },
      )
      .map_err(|err| match err {
        TransactionError::Abort(failure) => failure,
        TransactionError::Storage(e) => BatchFailure::Storage(sled_error(e)),
      })
  }
}

#[async_trait]
impl ChainStore for SledStore {
  async fn connect(&self) -> Result<(), StorageError> {
    for name in ALL_TREES {
      self.tree(name)?;
    }
    debug!(trees = ALL_TREES.len(), "sled indexes ready");
    Ok(())
  }

  async fn save_block(&self, block: &Block) -> Result<(), StorageError> {
    let hash = block.hash();
    let bytes = bincode::serialize(block).map_err(codec_error)?;
    let blocks = self.tree(TREE_BLOCKS)?;
    let prev = self.tree(TREE_BLOCK_PREV)?;
    let heights = self.tree(TREE_BLOCK_HEIGHT)?;
    let active = self.tree(TREE_ACTIVE_HEIGHT)?;
    let tx_blocks = self.tree(TREE_TX_BLOCKS)?;

    (&blocks, &prev, &heights, &active, &tx_blocks)
      .transaction(
        |(blocks, prev, heights, active, tx_blocks)| -> ConflictableTransactionResult<(), StorageError> {
          // Upsert: drop whatever the previous version indexed.
          if let Some(old) = blocks.get(&hash[..])? {
            let old: Block = decode_in_txn(&old)?;
            remove_block_index(&hash, &old, prev, heights, active, tx_blocks)?;
          }

          // One active block per height: a newcomer demotes the incumbent.
          let height_key = block.height.to_be_bytes();
          if block.active {
            if let Some(current) = active.get(&height_key[..])? {
              let current = hash_at(&current, 0).map_err(ConflictableTransactionError::Abort)?;
              if current != hash {
                if let Some(bytes) = blocks.get(&current[..])? {
                  let mut demoted: Block = decode_in_txn(&bytes)?;
                  demoted.active = false;
                  let encoded = bincode::serialize(&demoted)
                    .map_err(|e| ConflictableTransactionError::Abort(codec_error(e)))?;
                  blocks.insert(&current[..], encoded)?;
                  heights.insert(join(&height_key, &current), &[0u8][..])?;
                }
              }
            }
          }

          blocks.insert(&hash[..], &bytes[..])?;
          prev.insert(join(&block.header.prev_hash, &hash), EMPTY)?;
          heights.insert(join(&height_key, &hash), &[block.active as u8][..])?;
          if block.active {
            active.insert(&height_key[..], &hash[..])?;
          }
          for tx in &block.txs {
            tx_blocks.insert(join(tx, &hash), EMPTY)?;
          }
          Ok(())
        },
      )
      .map_err(txn_error)?;

    debug!(hash = %format_hash(&hash), height = block.height, active = block.active, "block saved");
    Ok(())
  }

  async fn save_transaction(&self, tx: &Transaction) -> Result<bool, StorageError> {
    let hash = tx.hash();
    let bytes = bincode::serialize(tx).map_err(codec_error)?;
    let txs = self.tree(TREE_TRANSACTIONS)?;
    let spends = self.tree(TREE_SPENDS)?;
    let affects = self.tree(TREE_AFFECTS)?;

    (&txs, &spends, &affects)
      .transaction(
        |(txs, spends, affects)| -> ConflictableTransactionResult<bool, StorageError> {
          if txs.get(&hash[..])?.is_some() {
            return Ok(false);
          }
          txs.insert(&hash[..], &bytes[..])?;
          index_transaction(&hash, tx, spends, affects)?;
          Ok(true)
        },
      )
      .map_err(txn_error)
  }

  async fn save_transactions(&self, txs: &[Transaction]) -> Result<usize, StorageError> {
    if txs.is_empty() {
      return Ok(0);
    }
    let encoded = txs
      .iter()
      .map(|tx| Ok((tx.hash(), tx, bincode::serialize(tx).map_err(codec_error)?)))
      .collect::<Result<Vec<_>, StorageError>>()?;

    match self.insert_batch(&encoded) {
      Ok(inserted) => Ok(inserted),
      Err(BatchFailure::Duplicates(duplicates)) => {
        // Second phase: every item on its own, duplicates absorbed.
        debug!(duplicates, batch = txs.len(), "bulk insert hit existing keys, upserting individually");
        let mut inserted = 0;
        for tx in txs {
          if self.save_transaction(tx).await? {
            inserted += 1;
          }
        }
        Ok(inserted)
      }
      Err(BatchFailure::Storage(err)) => Err(err),
    }
  }

  async fn get_block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, StorageError> {
    self.block(hash)
  }

  async fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, StorageError> {
    match self.active_hash_at(height)? {
      Some(hash) => self.block(&hash),
      None => Ok(None),
    }
  }

  async fn get_blocks_by_hashes(&self, hashes: &[Hash]) -> Result<Vec<Block>, StorageError> {
    let mut out = Vec::with_capacity(hashes.len());
    for hash in hashes {
      if let Some(block) = self.block(hash)? {
        out.push(block);
      }
    }
    Ok(out)
  }

  async fn get_blocks_by_heights(&self, heights: &[u64]) -> Result<Vec<Block>, StorageError> {
    let mut out = Vec::with_capacity(heights.len());
    for height in heights {
      if let Some(block) = self.get_block_by_height(*height).await? {
        out.push(block);
      }
    }
    Ok(out)
  }

  async fn get_block_by_prev(&self, prev: &Hash) -> Result<Option<Block>, StorageError> {
    let children = self.scan_suffixes(TREE_BLOCK_PREV, [&prev[..]])?;
    match children.first() {
      Some(child) => self.block(child),
      None => Ok(None),
    }
  }

  async fn get_block_by_locator(&self, locator: &[Hash]) -> Result<Option<Block>, StorageError> {
    let mut best: Option<Block> = None;
    for hash in locator {
      let Some(block) = self.block(hash)? else {
        continue;
      };
      if !block.active || self.active_hash_at(block.height)? != Some(*hash) {
        continue;
      }
      if best.as_ref().map_or(true, |b| block.height > b.height) {
        best = Some(block);
      }
    }
    Ok(best)
  }

  async fn get_top_block(&self) -> Result<Option<Block>, StorageError> {
    match self.tree(TREE_ACTIVE_HEIGHT)?.last().map_err(sled_error)? {
      Some((_, hash)) => self.block(&hash_at(&hash, 0)?),
      None => Ok(None),
    }
  }

  async fn get_block_slice(&self, start: i64, limit: Option<usize>) -> Result<Vec<Hash>, StorageError> {
    let start = if start >= 0 {
      start as u64
    } else {
      match self.top_height()? {
        Some(top) => top.saturating_sub(start.unsigned_abs()),
        None => return Ok(Vec::new()),
      }
    };

    let tree = self.tree(TREE_ACTIVE_HEIGHT)?;
    let mut out = Vec::new();
    for entry in tree.range(start.to_be_bytes()..) {
      if limit.is_some_and(|limit| out.len() >= limit) {
        break;
      }
      let (_, hash) = entry.map_err(sled_error)?;
      out.push(hash_at(&hash, 0)?);
    }
    Ok(out)
  }

  async fn knows_block(&self, hash: &Hash) -> Result<bool, StorageError> {
    self.tree(TREE_BLOCKS)?.contains_key(hash).map_err(sled_error)
  }

  async fn knows_transaction(&self, hash: &Hash) -> Result<bool, StorageError> {
    self.tree(TREE_TRANSACTIONS)?.contains_key(hash).map_err(sled_error)
  }

  async fn block_contains_transaction(&self, block: &Hash, tx: &Hash) -> Result<bool, StorageError> {
    self
      .tree(TREE_TX_BLOCKS)?
      .contains_key(join(tx, block))
      .map_err(sled_error)
  }

  async fn get_transaction_by_hash(&self, hash: &Hash) -> Result<Option<Transaction>, StorageError> {
    self.transaction(hash)
  }

  async fn get_transactions_by_hashes(&self, hashes: &[Hash]) -> Result<Vec<Transaction>, StorageError> {
    let mut out = Vec::with_capacity(hashes.len());
    for hash in hashes {
      if let Some(tx) = self.transaction(hash)? {
        out.push(tx);
      }
    }
    Ok(out)
  }

  async fn get_conflicting_transactions(&self, outpoints: &[OutPoint]) -> Result<Vec<Transaction>, StorageError> {
    let spenders = self.spenders(outpoints)?;
    self.get_transactions_by_hashes(&spenders).await
  }

  async fn count_conflicting_transactions(&self, outpoints: &[OutPoint]) -> Result<usize, StorageError> {
    Ok(self.spenders(outpoints)?.len())
  }

  async fn get_affected_transactions(&self, addresses: &[AddressHash]) -> Result<Vec<Hash>, StorageError> {
    self.scan_suffixes(TREE_AFFECTS, addresses.iter().map(|a| &a[..]))
  }

  async fn get_containing_block(&self, tx: &Hash) -> Result<Option<Hash>, StorageError> {
    let candidates = self.scan_suffixes(TREE_TX_BLOCKS, [&tx[..]])?;
    for candidate in &candidates {
      if let Some(block) = self.block(candidate)? {
        if block.active {
          return Ok(Some(*candidate));
        }
      }
    }
    Ok(candidates.first().copied())
  }

  async fn empty_database(&self) -> Result<(), StorageError> {
    info!("resetting database");
    self.clear()
  }

  async fn drop_database(&self) -> Result<(), StorageError> {
    info!("deleting database");
    for name in ALL_TREES {
      // `false` just means the tree was never created.
      let dropped = self.db.drop_tree(name).map_err(sled_error)?;
      debug!(tree = *name, dropped, "tree dropped");
    }
    Ok(())
  }

  async fn flush(&self) -> Result<(), StorageError> {
    self.db.flush_async().await.map_err(sled_error)?;
    Ok(())
  }
}

fn join(a: &[u8], b: &[u8]) -> Vec<u8> {
  let mut key = Vec::with_capacity(a.len() + b.len());
  key.extend_from_slice(a);
  key.extend_from_slice(b);
  key
}

fn hash_at(bytes: &[u8], offset: usize) -> Result<Hash, StorageError> {
  bytes
    .get(offset..offset + 32)
    .and_then(|slice| slice.try_into().ok())
    .ok_or_else(|| StorageError::Corrupted(format!("expected a hash at offset {offset}")))
}

fn height_from_key(key: &IVec) -> Result<u64, StorageError> {
  let bytes: [u8; 8] = key[..]
    .try_into()
    .map_err(|_| StorageError::Corrupted("invalid height key length".to_string()))?;
  Ok(u64::from_be_bytes(bytes))
}

fn decode_in_txn<T: DeserializeOwned>(bytes: &[u8]) -> ConflictableTransactionResult<T, StorageError> {
  bincode::deserialize(bytes).map_err(|e| ConflictableTransactionError::Abort(codec_error(e)))
}

fn txn_error(err: TransactionError<StorageError>) -> StorageError {
  match err {
    TransactionError::Abort(e) => e,
    TransactionError::Storage(e) => sled_error(e),
  }
}

fn remove_block_index(
  hash: &Hash,
  old: &Block,
  prev: &TransactionalTree,
  heights: &TransactionalTree,
  active: &TransactionalTree,
  tx_blocks: &TransactionalTree,
) -> Result<(), UnabortableTransactionError> {
  let height_key = old.height.to_be_bytes();
  prev.remove(join(&old.header.prev_hash, hash))?;
  heights.remove(join(&height_key, hash))?;
  if old.active {
    if let Some(current) = active.get(&height_key[..])? {
      if current[..] == hash[..] {
        active.remove(&height_key[..])?;
      }
    }
  }
  for tx in &old.txs {
    tx_blocks.remove(join(tx, hash))?;
  }
  Ok(())
}

fn index_transaction(
  hash: &Hash,
  tx: &Transaction,
  spends: &TransactionalTree,
  affects: &TransactionalTree,
) -> Result<(), UnabortableTransactionError> {
  for outpoint in tx.outpoints() {
    spends.insert(join(&outpoint.to_key(), hash), EMPTY)?;
  }
  if let Some(addresses) = &tx.affects {
    for address in addresses {
      affects.insert(join(address, hash), EMPTY)?;
    }
  }
  Ok(())
}
