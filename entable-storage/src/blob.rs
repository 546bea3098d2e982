//! Blob store contract.
//!
//! Used opportunistically for values too large to live inline in a row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageResult;

/// Metadata about a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub name: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

/// Container + name addressed byte storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put_bytes(&self, container: &str, name: &str, data: Vec<u8>) -> StorageResult<()>;

    async fn get_bytes(&self, container: &str, name: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Returns whether a blob was removed.
    async fn delete(&self, container: &str, name: &str) -> StorageResult<bool>;

    /// Lists blobs in a container, optionally by name prefix, ordered by name.
    async fn list(&self, container: &str, prefix: Option<&str>) -> StorageResult<Vec<BlobMeta>>;
}
