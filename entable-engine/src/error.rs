//! Error types for the engine.

use entable_model::ModelError;
use entable_storage::StorageError;
use entable_types::KeyPair;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failures that are not expected operation outcomes.
///
/// NotFound, AlreadyExists, Conflict, ConstraintViolation, PayloadTooLarge and
/// lock rejection are reported through the per-operation outcome enums.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or ambiguous registration, or a request that cannot address a row.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A modifier failed for a reason other than a constraint; its
    /// predecessors were rolled back cleanly.
    #[error("modifier `{modifier}` failed: {reason}")]
    Modifier { modifier: String, reason: String },

    /// The operation failed and at least one compensation step failed too,
    /// so state may be orphaned.
    #[error("{cause}; {count} compensation step(s) failed: {details}", count = .failures.len(), details = .failures.join("; "))]
    Compensation { cause: String, failures: Vec<String> },

    /// A mutation derived a different key pair than the row it started from.
    #[error("mutation moved entity from {from} to {to}")]
    KeyChanged { from: KeyPair, to: KeyPair },

    /// The lock was reclaimed by another holder before release.
    #[error("lock on {0} was lost before release")]
    LockLost(KeyPair),
}

impl EngineError {
    /// Returns true if the caller may retry the whole operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Storage(e) if e.is_transient())
    }

    /// Returns true for integration mistakes rather than runtime failures.
    pub fn is_configuration(&self) -> bool {
        match self {
            EngineError::Configuration(_) => true,
            EngineError::Model(e) => e.is_configuration(),
            _ => false,
        }
    }
}
