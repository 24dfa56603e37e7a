#![allow(dead_code)]

use std::fs;

use ledger_core::chain::genesis_block;
use ledger_core::{Block, BlockHeader, Hash, OutPoint, Transaction, TxIn, TxOut};
use ledger_storage::sled_store::SledStore;
use rand::Rng;
use tempfile::{tempdir, TempDir};

pub fn create_temp_store() -> (TempDir, SledStore) {
    // Create a temporary directory for the sled database
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let db_path = temp_dir.path().to_path_buf();
    // Initialize the SledStore
    (
        temp_dir,
        SledStore::open(db_path.to_str().unwrap()).expect("Failed to open SledStore"),
    )
}

pub fn teardown_store(temp_dir: TempDir, store: SledStore) {
    let db_path = temp_dir.path().to_path_buf();
    store.clear().expect("Failed to clear the store");
    drop(store);
    temp_dir.close().expect("Failed to delete temp dir");
    let _ = fs::remove_dir_all(&db_path);
    // Verify the directory is removed
    assert!(!db_path.exists(), "Database directory should be removed");
}

/// A block on top of `prev` with a random merkle root so hashes never collide.
pub fn child_of(prev: &Block, active: bool) -> Block {
    let mut rng = rand::thread_rng();
    let header = BlockHeader::new(
        prev.hash(),
        rng.gen(),
        prev.header.timestamp + 600,
        prev.header.bits,
        rng.gen(),
    );
    let mut block = Block::new(header);
    block.height = prev.height + 1;
    block.active = active;
    block.chain_work = prev.chain_work + header.work();
    block
}

/// Genesis plus `len - 1` active descendants.
pub fn active_chain(len: usize) -> Vec<Block> {
    let mut blocks = vec![genesis_block()];
    while blocks.len() < len {
        let next = child_of(blocks.last().unwrap(), true);
        blocks.push(next);
    }
    blocks
}

pub fn p2pkh(hash: [u8; 20]) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&hash);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

/// One input spending `prev_out`, one output paying `to`.
pub fn spend(prev_out: OutPoint, to: [u8; 20], value: u64) -> Transaction {
    Transaction::new(
        vec![TxIn {
            prev_out,
            script_sig: vec![0x51],
            sequence: u32::MAX,
        }],
        vec![TxOut {
            value,
            script_pubkey: p2pkh(to),
        }],
    )
    .with_derived_affects()
}

pub fn random_hash() -> Hash {
    rand::thread_rng().gen()
}
