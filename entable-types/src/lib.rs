//! Core type definitions for entable.
//!
//! This crate defines the storage-agnostic types every other layer speaks:
//! - [`PropertyValue`] / [`ValueKind`]: the typed scalar values a table row holds
//! - [`PropertyBag`]: the ordered, string-keyed wire form of an entity
//! - [`KeyPair`]: the (row key, partition key) address of a stored row
//! - [`ETag`]: the opaque version token used for optimistic concurrency
//!
//! Nothing here knows about entity types, registration, or I/O.

mod bag;
mod keys;
mod value;

pub use bag::PropertyBag;
pub use keys::{ETag, KeyPair};
pub use value::{PropertyValue, ValueKind};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("property {property}: expected {expected}, found {found}")]
    TypeMismatch {
        property: String,
        expected: ValueKind,
        found: ValueKind,
    },
}
