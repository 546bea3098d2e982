//! Storage contracts for entable.
//!
//! The engine talks to a schemaless table store through [`TableStore`] and to
//! an optional blob store through [`BlobStore`]. Both ship with in-memory
//! implementations.

pub mod blob;
mod error;
pub mod memory;
pub mod table;

pub use blob::{BlobMeta, BlobStore};
pub use error::{StorageError, StorageResult};
pub use memory::{MemoryBlobStore, MemoryTableStore, StoreOp};
pub use table::{
    BatchItemOutcome, BatchOp, BatchOpKind, BatchSubmission, DeleteOutcome, StoredRow,
    TableStore, WriteCondition, WriteOutcome,
};
