pub mod sled_store;

pub use sled_store::SledStore;

use ledger_core::StorageError;

pub(crate) fn sled_error(err: sled::Error) -> StorageError {
    match err {
        sled::Error::Corruption { .. } => StorageError::Corrupted(err.to_string()),
        other => StorageError::Unavailable(other.to_string()),
    }
}

pub(crate) fn codec_error(err: bincode::Error) -> StorageError {
    StorageError::Codec(err.to_string())
}
