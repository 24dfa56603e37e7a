use thiserror::Error;

/// Failures a storage backend can report.
///
/// Duplicate keys are absent on purpose: upserts absorb them.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend unreachable or an I/O failure. The caller may retry later.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage codec error: {0}")]
    Codec(String),
    #[error("corrupted record: {0}")]
    Corrupted(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid peer address: {0}")]
    InvalidAddress(String),
}
