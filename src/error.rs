//! Error types for the storage engine.

use thiserror::Error;

use crate::types::PageId;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in the storage engine
///
/// Invariant violations (cache/lock divergence, a transposed page still
/// registered under its old id, an impossible cascade state) are not
/// represented here: they indicate bugs in the engine itself and panic
/// instead of propagating.
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error from the underlying file system, including short reads
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No record matched the key (observable, non-fatal)
    #[error("Key not found")]
    KeyNotFound,

    /// A serialized page does not fit its fixed-size block, or a block
    /// read back from disk fails validation
    #[error("Corrupt page {page_id}: {reason}")]
    CorruptPage { page_id: PageId, reason: String },

    /// The heapfile header is unreadable or describes an impossible tree
    #[error("Invalid heapfile: {0}")]
    InvalidHeapfile(String),

    /// The creation-time configuration was rejected
    #[error("Configuration rejected: {0}")]
    ConfigRejected(String),
}

impl StorageError {
    /// Create a corrupt-page error for the given block
    pub fn corrupt(page_id: PageId, reason: impl Into<String>) -> Self {
        Self::CorruptPage {
            page_id,
            reason: reason.into(),
        }
    }

    /// Create an invalid-heapfile error
    pub fn invalid_heapfile(msg: impl Into<String>) -> Self {
        Self::InvalidHeapfile(msg.into())
    }

    /// Create a configuration-rejected error
    pub fn config_rejected(msg: impl Into<String>) -> Self {
        Self::ConfigRejected(msg.into())
    }
}
