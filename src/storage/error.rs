//! Storage engine error types
//!
//! Absence of data is not an error here: reads report it as `None`.
//! Everything below aborts the enclosing action.

use thiserror::Error;

/// Errors that can occur in the tensorization engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// The underlying store refused an operation on a dataset
    #[error("Storage error on '{dataset}' during {op}: {reason}")]
    Storage {
        dataset: String,
        op: &'static str,
        reason: String,
    },

    /// Internal consistency broken (watermark shrink, rank reuse, ...)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Caller supplied a malformed request (rank, element count, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Action handle is stale or was never issued
    #[error("Unknown action handle")]
    UnknownAction,

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored metadata contradicts itself or is missing
    #[error("Corrupt data: {0}")]
    Corruption(String),
}

impl StorageError {
    /// Shorthand for a store-level failure on a named dataset
    pub fn storage(dataset: impl Into<String>, op: &'static str, reason: impl ToString) -> Self {
        StorageError::Storage {
            dataset: dataset.into(),
            op,
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
