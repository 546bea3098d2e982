//! Row addressing and version tokens.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The two-part address of a row: (row key, partition key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyPair {
    pub row_key: String,
    pub partition_key: String,
}

impl KeyPair {
    pub fn new(row_key: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            row_key: row_key.into(),
            partition_key: partition_key.into(),
        }
    }
}

impl fmt::Display for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row_key, self.partition_key)
    }
}

/// Opaque version token attached to every read of a row.
///
/// Only equality is meaningful; callers must never parse or order ETags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generates a fresh, globally unique token.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0)
    }
}
