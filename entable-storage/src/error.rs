//! Error types for the storage layer.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors a store adapter reports after its own retries are exhausted.
///
/// Expected outcomes (missing rows, precondition failures, oversized
/// batches) are not errors; they are variants of the operation results.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Network or throttling failure; eligible for a caller-level retry.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// Request the backend refused (bad key, bad table name).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Any other backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Returns true if retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}
