//! Table store contract.
//!
//! The engine needs only single-row conditional writes plus a best-effort
//! batch call; it never assumes multi-row transactions.

use async_trait::async_trait;
use entable_model::Predicate;
use entable_types::{ETag, KeyPair, PropertyBag};

use crate::error::StorageResult;

/// A row as read from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub keys: KeyPair,
    pub bag: PropertyBag,
    pub etag: ETag,
}

/// Precondition for a single-row write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    /// Write only if no row exists at the key pair.
    Absent,
    /// Write only if the row exists with this ETag.
    IfMatch(ETag),
    /// Write unconditionally (insert or replace).
    Any,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Written; carries the new ETag.
    Written(ETag),
    /// `Absent` was requested but a row exists.
    AlreadyExists,
    /// `IfMatch` was requested and the ETag is stale.
    Conflict,
    /// `IfMatch` was requested but no row exists.
    NotFound,
}

/// Result of a conditional delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Conflict,
    NotFound,
}

/// One operation inside a batch submission.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOp {
    pub keys: KeyPair,
    pub kind: BatchOpKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOpKind {
    Insert(PropertyBag),
    Upsert(PropertyBag),
    Delete(Option<ETag>),
}

impl BatchOp {
    pub fn insert(keys: KeyPair, bag: PropertyBag) -> Self {
        Self {
            keys,
            kind: BatchOpKind::Insert(bag),
        }
    }

    pub fn upsert(keys: KeyPair, bag: PropertyBag) -> Self {
        Self {
            keys,
            kind: BatchOpKind::Upsert(bag),
        }
    }

    pub fn delete(keys: KeyPair, etag: Option<ETag>) -> Self {
        Self {
            keys,
            kind: BatchOpKind::Delete(etag),
        }
    }

    /// Serialized size of the operation body, keys included.
    pub fn payload_size(&self) -> usize {
        let keys = self.keys.row_key.len() + self.keys.partition_key.len();
        let body = match &self.kind {
            BatchOpKind::Insert(bag) | BatchOpKind::Upsert(bag) => bag.serialized_size(),
            BatchOpKind::Delete(etag) => etag.as_ref().map_or(0, |e| e.as_str().len()),
        };
        keys + body
    }
}

/// Per-operation result of an accepted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchItemOutcome {
    Write(WriteOutcome),
    Delete(DeleteOutcome),
}

impl BatchItemOutcome {
    /// True when the operation took effect.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            BatchItemOutcome::Write(WriteOutcome::Written(_))
                | BatchItemOutcome::Delete(DeleteOutcome::Deleted)
        )
    }
}

/// Result of a batch submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchSubmission {
    /// The provider accepted the batch; one outcome per operation, in order.
    Applied(Vec<BatchItemOutcome>),
    /// The provider rejected the whole batch as too large. Nothing was applied.
    PayloadTooLarge,
}

/// Abstract schemaless table store with single-row optimistic concurrency.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Reads one row.
    async fn get(&self, table: &str, keys: &KeyPair) -> StorageResult<Option<StoredRow>>;

    /// Writes one row under a precondition.
    async fn put(
        &self,
        table: &str,
        keys: &KeyPair,
        bag: PropertyBag,
        condition: WriteCondition,
    ) -> StorageResult<WriteOutcome>;

    /// Deletes one row; `expected` of `None` deletes unconditionally.
    async fn delete(
        &self,
        table: &str,
        keys: &KeyPair,
        expected: Option<&ETag>,
    ) -> StorageResult<DeleteOutcome>;

    /// Lists rows, optionally restricted to a partition and a filter over
    /// stored property names.
    async fn query(
        &self,
        table: &str,
        partition: Option<&str>,
        filter: Option<&Predicate>,
    ) -> StorageResult<Vec<StoredRow>>;

    /// Submits several operations in one provider call.
    async fn submit_batch(&self, table: &str, ops: &[BatchOp]) -> StorageResult<BatchSubmission>;
}
