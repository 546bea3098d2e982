//! Error types for the model layer.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while deriving keys or mapping entities.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Missing, ambiguous or unusable registration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A key producer needed a property the input does not carry.
    #[error("missing key member: {0}")]
    MissingKeyMember(String),

    /// A key producer derived an empty key.
    #[error("empty key derived by {0}")]
    EmptyKey(String),

    /// The entity does not serialize to a JSON object.
    #[error("entity is not a JSON object: {0}")]
    NotAnObject(String),

    /// A member's value cannot be represented by its codec.
    #[error("unsupported value for member {member}: {reason}")]
    UnsupportedValue { member: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Value(#[from] entable_types::Error),
}

impl ModelError {
    /// Returns true for integration mistakes rather than bad data.
    pub fn is_configuration(&self) -> bool {
        matches!(self, ModelError::Configuration(_))
    }
}
