pub mod address;
pub mod constants;
pub mod error;
pub mod message;
pub mod transaction;
pub mod validation;

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::{HASH_HEX_SIZE, HASH_SIZE};

pub use address::PeerAddress;
pub use error::{AddressError, StorageError};
pub use message::{BlockMessage, InvItem, InvKind, Message};
pub use transaction::{AddressHash, OutPoint, Transaction, TxIn, TxOut};
pub use validation::{AcceptAll, Validator};

pub type Hash = [u8; HASH_SIZE];

/// Double SHA-256, the digest used for header and transaction ids.
pub fn sha256d(bytes: &[u8]) -> Hash {
    let first = Sha256::digest(bytes);
    let second = Sha256::digest(first);
    let mut out = [0u8; HASH_SIZE];
    out.copy_from_slice(&second[..]);
    out
}

/// Hashes are stored little-endian and shown byte-reversed, the way peers print them.
pub fn format_hash(hash: &Hash) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Inverse of [`format_hash`].
pub fn parse_hash(s: &str) -> Option<Hash> {
    if s.len() != HASH_HEX_SIZE {
        return None;
    }
    let bytes = hex::decode(s).ok()?;
    let mut out: Hash = bytes.try_into().ok()?;
    out.reverse();
    Some(out)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn new(prev_hash: Hash, merkle_root: Hash, timestamp: u32, bits: u32, nonce: u32) -> Self {
        Self {
            version: 1,
            prev_hash,
            merkle_root,
            timestamp,
            bits,
            nonce,
        }
    }

    pub fn hash_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(constants::HEADER_SIZE);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.prev_hash);
        bytes.extend_from_slice(&self.merkle_root);
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&self.bits.to_le_bytes());
        bytes.extend_from_slice(&self.nonce.to_le_bytes());
        bytes
    }

    pub fn hash(&self) -> Hash {
        sha256d(&self.hash_bytes())
    }

    /// Expected number of hashes needed to produce this header.
    pub fn work(&self) -> U256 {
        pow::work_from_compact(self.bits)
    }
}

/// A stored block. Transactions are referenced by hash, never embedded.
///
/// `height`, `active` and `chain_work` are assigned by the chain authority;
/// storage keeps whatever it is handed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub height: u64,
    pub size: u32,
    pub active: bool,
    pub chain_work: U256,
    pub txs: Vec<Hash>,
}

impl Block {
    pub fn new(header: BlockHeader) -> Self {
        Self {
            header,
            height: 0,
            size: 0,
            active: false,
            chain_work: U256::zero(),
            txs: Vec::new(),
        }
    }

    /// Always recomputed from the header, so a block can't carry a foreign hash.
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }
}

/// Bitcoin-style merkle root over transaction hashes; an odd node is paired with itself.
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return [0u8; 32];
    }
    let mut level: Vec<Hash> = hashes.to_vec();

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let (a, b) = if pair.len() == 2 {
                (pair[0], pair[1])
            } else {
                (pair[0], pair[0])
            };
            let mut joined = [0u8; 64];
            joined[..32].copy_from_slice(&a);
            joined[32..].copy_from_slice(&b);
            next.push(sha256d(&joined));
        }
        level = next;
    }
    level[0]
}

pub mod pow {
    use primitive_types::U256;

    /// Expand a compact difficulty encoding into the full 256-bit target.
    /// Negative or overflowing encodings yield zero.
    pub fn target_from_compact(bits: u32) -> U256 {
        let exponent = bits >> 24;
        let mantissa = bits & 0x007f_ffff;
        if bits & 0x0080_0000 != 0 || mantissa == 0 {
            return U256::zero();
        }
        if exponent <= 3 {
            return U256::from(mantissa >> (8 * (3 - exponent)));
        }
        let shift = 8 * (exponent - 3);
        let significant_bits = 32 - mantissa.leading_zeros();
        if shift + significant_bits > 256 {
            return U256::zero();
        }
        U256::from(mantissa) << shift
    }

    /// `2^256 / (target + 1)`, computed without leaving 256 bits.
    pub fn work_from_compact(bits: u32) -> U256 {
        let target = target_from_compact(bits);
        if target.is_zero() {
            return U256::zero();
        }
        if target == U256::MAX {
            return U256::one();
        }
        (!target / (target + U256::one())) + U256::one()
    }
}

pub mod chain {
    use super::*;
    use async_trait::async_trait;

    /// Persistence contract for blocks and transactions.
    ///
    /// Lives in `ledger-core` so the node and the storage backends can both
    /// depend on it. Every operation completes exactly once, with a value or
    /// a [`StorageError`]. Duplicate inserts are never errors.
    #[async_trait]
    pub trait ChainStore: Send + Sync {
        /// Prepare the backend (open trees, build indexes). Idempotent.
        async fn connect(&self) -> Result<(), StorageError>;

        /// Upsert by hash. Index entries of an older version are replaced.
        async fn save_block(&self, block: &Block) -> Result<(), StorageError>;

        /// Upsert by hash. Returns `false` when the transaction was already stored.
        async fn save_transaction(&self, tx: &Transaction) -> Result<bool, StorageError>;

        /// Bulk upsert. Returns the number of newly stored transactions.
        async fn save_transactions(&self, txs: &[Transaction]) -> Result<usize, StorageError>;

        async fn get_block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, StorageError>;

        /// Only ever returns the active block at `height`.
        async fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, StorageError>;

        async fn get_blocks_by_hashes(&self, hashes: &[Hash]) -> Result<Vec<Block>, StorageError>;

        /// Active blocks at the given heights; heights without one are skipped.
        async fn get_blocks_by_heights(&self, heights: &[u64]) -> Result<Vec<Block>, StorageError>;

        /// A block whose previous-hash is `prev`.
        async fn get_block_by_prev(&self, prev: &Hash) -> Result<Option<Block>, StorageError>;

        /// Highest active block whose hash appears in `locator`.
        async fn get_block_by_locator(&self, locator: &[Hash]) -> Result<Option<Block>, StorageError>;

        async fn get_top_block(&self) -> Result<Option<Block>, StorageError>;

        /// Active-chain hashes from `start` upwards. A negative `start` counts back from the tip.
        async fn get_block_slice(&self, start: i64, limit: Option<usize>) -> Result<Vec<Hash>, StorageError>;

        async fn knows_block(&self, hash: &Hash) -> Result<bool, StorageError>;

        async fn knows_transaction(&self, hash: &Hash) -> Result<bool, StorageError>;

        async fn block_contains_transaction(&self, block: &Hash, tx: &Hash) -> Result<bool, StorageError>;

        async fn get_transaction_by_hash(&self, hash: &Hash) -> Result<Option<Transaction>, StorageError>;

        /// Found transactions, in request order.
        async fn get_transactions_by_hashes(&self, hashes: &[Hash]) -> Result<Vec<Transaction>, StorageError>;

        /// Stored transactions spending any of `outpoints`.
        async fn get_conflicting_transactions(&self, outpoints: &[OutPoint]) -> Result<Vec<Transaction>, StorageError>;

        async fn count_conflicting_transactions(&self, outpoints: &[OutPoint]) -> Result<usize, StorageError>;

        /// Hashes of transactions touching any of the address hashes.
        async fn get_affected_transactions(&self, addresses: &[AddressHash]) -> Result<Vec<Hash>, StorageError>;

        /// The block that includes `tx`, preferring the active one.
        async fn get_containing_block(&self, tx: &Hash) -> Result<Option<Hash>, StorageError>;

        /// Remove all records. An empty store is not an error.
        async fn empty_database(&self) -> Result<(), StorageError>;

        /// Remove all records and the indexes themselves.
        async fn drop_database(&self) -> Result<(), StorageError>;

        async fn flush(&self) -> Result<(), StorageError>;
    }

    /// Header every chain starts from.
    pub fn genesis_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: [0u8; 32],
            merkle_root: [0u8; 32],
            timestamp: 1_231_006_505,
            bits: 0x1d00_ffff,
            nonce: 2_083_236_893,
        }
    }

    /// The genesis block as the chain authority stores it.
    pub fn genesis_block() -> Block {
        let header = genesis_header();
        Block {
            header,
            height: 0,
            size: constants::HEADER_SIZE as u32,
            active: true,
            chain_work: header.work(),
            txs: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BlockHeader {
        BlockHeader::new([0u8; 32], [1u8; 32], 1_600_000_000, 0x1d00_ffff, 42)
    }

    #[test]
    fn header_hash_bytes_layout() {
        let header = sample_header();
        let bytes = header.hash_bytes();
        assert_eq!(bytes.len(), 80);
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..36], &[0u8; 32]);
        assert_eq!(&bytes[36..68], &[1u8; 32]);
        assert_eq!(&bytes[68..72], &1_600_000_000u32.to_le_bytes());
        assert_eq!(&bytes[72..76], &0x1d00_ffffu32.to_le_bytes());
        assert_eq!(&bytes[76..80], &42u32.to_le_bytes());
    }

    #[test]
    fn block_hash_is_pure_function_of_header() {
        let mut a = Block::new(sample_header());
        let b = Block::new(sample_header());
        a.height = 99;
        a.active = true;
        a.txs.push([7u8; 32]);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash(), sample_header().hash());
    }

    #[test]
    fn block_hash_changes_with_nonce() {
        let mut block = Block::new(sample_header());
        let before = block.hash();
        block.header.nonce += 1;
        assert_ne!(before, block.hash());
    }

    #[test]
    fn sha256d_known_vector() {
        // sha256d("hello")
        assert_eq!(
            hex::encode(sha256d(b"hello")),
            "9595c9df90075148eb06860365df33584b75bff782a510c6cd4883a419833d50"
        );
    }

    #[test]
    fn format_hash_reverses_bytes() {
        let mut hash = [0u8; 32];
        hash[0] = 0xab;
        let shown = format_hash(&hash);
        assert!(shown.ends_with("ab"));
        assert_eq!(parse_hash(&shown), Some(hash));
        assert_eq!(parse_hash("zz"), None);
        assert_eq!(parse_hash("abcd"), None);
        assert_eq!(parse_hash(&"00".repeat(33)), None);
    }

    #[test]
    fn merkle_root_empty_and_single() {
        assert_eq!(merkle_root(&[]), [0u8; 32]);
        let h = [3u8; 32];
        assert_eq!(merkle_root(&[h]), h);
    }

    #[test]
    fn merkle_root_odd_count_duplicates_last() {
        let (a, b, c) = ([1u8; 32], [2u8; 32], [3u8; 32]);
        let pair = |x: Hash, y: Hash| {
            let mut joined = [0u8; 64];
            joined[..32].copy_from_slice(&x);
            joined[32..].copy_from_slice(&y);
            sha256d(&joined)
        };
        let expected = pair(pair(a, b), pair(c, c));
        assert_eq!(merkle_root(&[a, b, c]), expected);
    }

    #[test]
    fn compact_target_expansion() {
        let target = pow::target_from_compact(0x1d00_ffff);
        assert_eq!(target, U256::from(0xffffu64) << 208u32);
        assert_eq!(pow::target_from_compact(0x0300_0001), U256::from(1u64));
        assert_eq!(pow::target_from_compact(0x0100_3456), U256::zero());
        assert_eq!(pow::target_from_compact(0x2300_0001), U256::zero());
        assert_eq!(pow::target_from_compact(0x0480_0000), U256::zero());
    }

    #[test]
    fn work_for_minimum_difficulty() {
        assert_eq!(pow::work_from_compact(0x1d00_ffff), U256::from(4_295_032_833u64));
        assert_eq!(pow::work_from_compact(0), U256::zero());
        assert_eq!(sample_header().work(), U256::from(4_295_032_833u64));
    }

    #[test]
    fn genesis_block_shape() {
        let genesis = chain::genesis_block();
        assert_eq!(genesis.height, 0);
        assert!(genesis.active);
        assert_eq!(genesis.header.prev_hash, [0u8; 32]);
        assert_eq!(genesis.chain_work, genesis.header.work());
        assert!(genesis.txs.is_empty());
    }

    #[test]
    fn block_serialization_preserves_fields() {
        let mut block = Block::new(sample_header());
        block.height = 5;
        block.active = true;
        block.chain_work = U256::from(123_456u64);
        block.txs = vec![[9u8; 32], [8u8; 32]];

        let json = serde_json::to_string(&block).unwrap();
        let from_json: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(from_json, block);

        let bytes = bincode::serialize(&block).unwrap();
        let from_bincode: Block = bincode::deserialize(&bytes).unwrap();
        assert_eq!(from_bincode.hash(), block.hash());
        assert_eq!(from_bincode.chain_work, block.chain_work);
    }
}
