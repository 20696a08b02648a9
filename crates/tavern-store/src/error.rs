//! Storage error types.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for storage results.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors produced by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A filesystem operation failed.
    #[error("io error at {path}: {source}")]
    Io {
        /// File or directory the operation targeted.
        path: PathBuf,
        /// Underlying io error.
        source: std::io::Error,
    },

    /// Persisted content failed to serialize or deserialize.
    ///
    /// The on-disk file is left untouched; the caller decides whether a
    /// malformed record is fatal.
    #[error("serialization error at {path}: {source}")]
    Serialization {
        /// File whose content was malformed.
        path: PathBuf,
        /// Underlying serde error.
        source: serde_json::Error,
    },

    /// The provider cannot be reached right now.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// A section or ledger name is not a valid storage key.
    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    /// The store was constructed with inconsistent settings.
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),

    /// An operation was attempted on a committed or rolled-back transaction.
    #[error("transaction already closed: {0}")]
    TransactionClosed(&'static str),
}
