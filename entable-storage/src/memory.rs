//! In-memory store backends for tests and single-process use.
//!
//! Every write mints a fresh random ETag, mirroring how a real table store
//! versions rows. Faults can be injected per operation to exercise the
//! engine's compensation paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use entable_model::Predicate;
use entable_types::{ETag, KeyPair, PropertyBag};
use tracing::debug;

use crate::blob::{BlobMeta, BlobStore};
use crate::error::{StorageError, StorageResult};
use crate::table::{
    BatchItemOutcome, BatchOp, BatchOpKind, BatchSubmission, DeleteOutcome, StoredRow,
    TableStore, WriteCondition, WriteOutcome,
};

/// Operation selector for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Put,
    Delete,
    Query,
    Batch,
}

/// Rows ordered by (partition key, row key), like a table scan.
type Rows = BTreeMap<(String, String), Row>;

#[derive(Debug, Clone)]
struct Row {
    bag: PropertyBag,
    etag: ETag,
}

#[derive(Debug, Default)]
struct TableState {
    tables: HashMap<String, Rows>,
    faults: HashMap<StoreOp, usize>,
    batch_calls: usize,
}

/// Table store held in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryTableStore {
    state: Arc<RwLock<TableState>>,
    max_batch_bytes: Option<usize>,
    max_batch_ops: Option<usize>,
}

impl MemoryTableStore {
    /// Creates an empty store with no batch ceiling.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects batches whose summed payload exceeds `bytes` as too large.
    #[must_use]
    pub fn with_max_batch_bytes(mut self, bytes: usize) -> Self {
        self.max_batch_bytes = Some(bytes);
        self
    }

    /// Rejects batches with more than `ops` operations as too large.
    #[must_use]
    pub fn with_max_batch_ops(mut self, ops: usize) -> Self {
        self.max_batch_ops = Some(ops);
        self
    }

    /// Makes the next `times` calls of `op` fail with a transient error.
    pub fn fail_next(&self, op: StoreOp, times: usize) {
        if let Ok(mut state) = self.state.write() {
            state.faults.insert(op, times);
        }
    }

    /// Number of `submit_batch` calls received, accepted or not.
    pub fn batch_calls(&self) -> usize {
        self.state.read().map(|s| s.batch_calls).unwrap_or(0)
    }

    /// Number of rows currently in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .read()
            .map(|s| s.tables.get(table).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    fn write_state(&self) -> StorageResult<std::sync::RwLockWriteGuard<'_, TableState>> {
        self.state
            .write()
            .map_err(|_| StorageError::Backend("lock poisoned".into()))
    }

    fn take_fault(state: &mut TableState, op: StoreOp) -> StorageResult<()> {
        if let Some(remaining) = state.faults.get_mut(&op)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(StorageError::Transient(format!("injected {op:?} fault")));
        }
        Ok(())
    }
}

fn validate_keys(keys: &KeyPair) -> StorageResult<()> {
    if keys.row_key.is_empty() || keys.partition_key.is_empty() {
        return Err(StorageError::InvalidRequest(format!("empty key in {keys}")));
    }
    Ok(())
}

fn slot(keys: &KeyPair) -> (String, String) {
    (keys.partition_key.clone(), keys.row_key.clone())
}

fn apply_put(rows: &mut Rows, keys: &KeyPair, bag: PropertyBag, condition: &WriteCondition) -> WriteOutcome {
    let key = slot(keys);
    match (condition, rows.get(&key)) {
        (WriteCondition::Absent, Some(_)) => return WriteOutcome::AlreadyExists,
        (WriteCondition::IfMatch(_), None) => return WriteOutcome::NotFound,
        (WriteCondition::IfMatch(expected), Some(row)) if &row.etag != expected => {
            return WriteOutcome::Conflict;
        }
        _ => {}
    }
    let etag = ETag::generate();
    rows.insert(
        key,
        Row {
            bag,
            etag: etag.clone(),
        },
    );
    WriteOutcome::Written(etag)
}

fn apply_delete(rows: &mut Rows, keys: &KeyPair, expected: Option<&ETag>) -> DeleteOutcome {
    let key = slot(keys);
    match (rows.get(&key), expected) {
        (None, _) => DeleteOutcome::NotFound,
        (Some(row), Some(expected)) if &row.etag != expected => DeleteOutcome::Conflict,
        _ => {
            rows.remove(&key);
            DeleteOutcome::Deleted
        }
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn get(&self, table: &str, keys: &KeyPair) -> StorageResult<Option<StoredRow>> {
        let mut state = self.write_state()?;
        Self::take_fault(&mut state, StoreOp::Get)?;
        Ok(state
            .tables
            .get(table)
            .and_then(|rows| rows.get(&slot(keys)))
            .map(|row| StoredRow {
                keys: keys.clone(),
                bag: row.bag.clone(),
                etag: row.etag.clone(),
            }))
    }

    async fn put(
        &self,
        table: &str,
        keys: &KeyPair,
        bag: PropertyBag,
        condition: WriteCondition,
    ) -> StorageResult<WriteOutcome> {
        validate_keys(keys)?;
        let mut state = self.write_state()?;
        Self::take_fault(&mut state, StoreOp::Put)?;
        let rows = state.tables.entry(table.to_string()).or_default();
        Ok(apply_put(rows, keys, bag, &condition))
    }

    async fn delete(
        &self,
        table: &str,
        keys: &KeyPair,
        expected: Option<&ETag>,
    ) -> StorageResult<DeleteOutcome> {
        let mut state = self.write_state()?;
        Self::take_fault(&mut state, StoreOp::Delete)?;
        Ok(match state.tables.get_mut(table) {
            Some(rows) => apply_delete(rows, keys, expected),
            None => DeleteOutcome::NotFound,
        })
    }

    async fn query(
        &self,
        table: &str,
        partition: Option<&str>,
        filter: Option<&Predicate>,
    ) -> StorageResult<Vec<StoredRow>> {
        let mut state = self.write_state()?;
        Self::take_fault(&mut state, StoreOp::Query)?;
        let Some(rows) = state.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter(|((pk, _), _)| partition.is_none_or(|p| p == pk))
            .filter(|(_, row)| filter.is_none_or(|f| f.matches(&row.bag)))
            .map(|((pk, rk), row)| StoredRow {
                keys: KeyPair::new(rk.clone(), pk.clone()),
                bag: row.bag.clone(),
                etag: row.etag.clone(),
            })
            .collect())
    }

    async fn submit_batch(&self, table: &str, ops: &[BatchOp]) -> StorageResult<BatchSubmission> {
        let mut state = self.write_state()?;
        state.batch_calls += 1;
        Self::take_fault(&mut state, StoreOp::Batch)?;

        let bytes: usize = ops.iter().map(BatchOp::payload_size).sum();
        let too_many = self.max_batch_ops.is_some_and(|max| ops.len() > max);
        let too_big = self.max_batch_bytes.is_some_and(|max| bytes > max);
        if too_many || too_big {
            debug!(table, ops = ops.len(), bytes, "rejecting oversized batch");
            return Ok(BatchSubmission::PayloadTooLarge);
        }
        for op in ops {
            validate_keys(&op.keys)?;
        }

        let rows = state.tables.entry(table.to_string()).or_default();
        let outcomes = ops
            .iter()
            .map(|op| match &op.kind {
                BatchOpKind::Insert(bag) => BatchItemOutcome::Write(apply_put(
                    rows,
                    &op.keys,
                    bag.clone(),
                    &WriteCondition::Absent,
                )),
                BatchOpKind::Upsert(bag) => BatchItemOutcome::Write(apply_put(
                    rows,
                    &op.keys,
                    bag.clone(),
                    &WriteCondition::Any,
                )),
                BatchOpKind::Delete(etag) => {
                    BatchItemOutcome::Delete(apply_delete(rows, &op.keys, etag.as_ref()))
                }
            })
            .collect();
        Ok(BatchSubmission::Applied(outcomes))
    }
}

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Vec<u8>,
    modified_at: DateTime<Utc>,
}

/// Blob store held in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    containers: Arc<RwLock<HashMap<String, BTreeMap<String, StoredBlob>>>>,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of blobs across all containers.
    pub fn blob_count(&self) -> usize {
        self.containers
            .read()
            .map(|c| c.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }
}

fn poisoned() -> StorageError {
    StorageError::Backend("lock poisoned".into())
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put_bytes(&self, container: &str, name: &str, data: Vec<u8>) -> StorageResult<()> {
        if container.is_empty() || name.is_empty() {
            return Err(StorageError::InvalidRequest(
                "blob container and name must be non-empty".into(),
            ));
        }
        let mut containers = self.containers.write().map_err(|_| poisoned())?;
        containers.entry(container.to_string()).or_default().insert(
            name.to_string(),
            StoredBlob {
                data,
                modified_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_bytes(&self, container: &str, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let containers = self.containers.read().map_err(|_| poisoned())?;
        Ok(containers
            .get(container)
            .and_then(|blobs| blobs.get(name))
            .map(|blob| blob.data.clone()))
    }

    async fn delete(&self, container: &str, name: &str) -> StorageResult<bool> {
        let mut containers = self.containers.write().map_err(|_| poisoned())?;
        Ok(containers
            .get_mut(container)
            .is_some_and(|blobs| blobs.remove(name).is_some()))
    }

    async fn list(&self, container: &str, prefix: Option<&str>) -> StorageResult<Vec<BlobMeta>> {
        let containers = self.containers.read().map_err(|_| poisoned())?;
        let Some(blobs) = containers.get(container) else {
            return Ok(Vec::new());
        };
        Ok(blobs
            .iter()
            .filter(|(name, _)| prefix.is_none_or(|p| name.starts_with(p)))
            .map(|(name, blob)| BlobMeta {
                name: name.clone(),
                size: blob.data.len() as u64,
                modified_at: blob.modified_at,
            })
            .collect())
    }
}
