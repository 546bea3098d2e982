//! Large-value offload to a blob store.
//!
//! String and Binary properties above the inline limit are moved to a blob
//! and replaced by a `<name>@blob` marker whose value is `<kind>:<blob name>`.
//! Blob names are unique per write, so a failed write never clobbers the
//! blob a committed row still points at.

use std::collections::BTreeSet;
use std::sync::Arc;

use entable_model::encode_key_component;
use entable_storage::BlobStore;
use entable_types::{KeyPair, PropertyBag, PropertyValue};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::EngineResult;

const MARKER_SUFFIX: &str = "@blob";
const STRING_TAG: &str = "string";
const BINARY_TAG: &str = "binary";

#[derive(Clone)]
pub(crate) struct BlobSpill {
    blobs: Arc<dyn BlobStore>,
    inline_limit: usize,
}

/// A bag ready to be stored plus the blobs written for it.
pub(crate) struct Offloaded {
    pub bag: PropertyBag,
    pub written: Vec<String>,
}

impl BlobSpill {
    pub(crate) fn new(blobs: Arc<dyn BlobStore>, inline_limit: usize) -> Self {
        Self {
            blobs,
            inline_limit,
        }
    }

    /// Moves oversized values out of `bag`.
    pub(crate) async fn offload(
        &self,
        table: &str,
        keys: &KeyPair,
        mut bag: PropertyBag,
    ) -> EngineResult<Offloaded> {
        let oversized: Vec<String> = bag
            .iter()
            .filter(|(_, v)| {
                matches!(v, PropertyValue::String(_) | PropertyValue::Binary(_))
                    && v.payload_size() > self.inline_limit
            })
            .map(|(name, _)| name.clone())
            .collect();

        let mut written = Vec::with_capacity(oversized.len());
        for name in oversized {
            let Some(value) = bag.remove(&name) else {
                continue;
            };
            let (tag, bytes) = match value {
                PropertyValue::String(s) => (STRING_TAG, s.into_bytes()),
                PropertyValue::Binary(b) => (BINARY_TAG, b),
                other => {
                    bag.insert(name, other);
                    continue;
                }
            };
            let blob_name = format!(
                "{}/{}/{}/{}",
                encode_key_component(&keys.partition_key),
                encode_key_component(&keys.row_key),
                encode_key_component(&name),
                Uuid::now_v7().simple()
            );
            if let Err(e) = self.blobs.put_bytes(table, &blob_name, bytes).await {
                self.discard(table, written).await;
                return Err(e.into());
            }
            debug!(table, keys = %keys, property = %name, blob = %blob_name, "value spilled to blob");
            bag.insert(format!("{name}{MARKER_SUFFIX}"), format!("{tag}:{blob_name}"));
            written.push(blob_name);
        }
        Ok(Offloaded { bag, written })
    }

    /// Replaces markers with the values they point at. Markers whose blob is
    /// gone are dropped, leaving the property absent.
    pub(crate) async fn resolve(&self, table: &str, mut bag: PropertyBag) -> EngineResult<PropertyBag> {
        let markers: Vec<(String, String)> = bag
            .iter()
            .filter_map(|(name, value)| {
                let property = name.strip_suffix(MARKER_SUFFIX)?;
                Some((property.to_string(), value.as_str()?.to_string()))
            })
            .collect();

        for (property, marker) in markers {
            bag.remove(&format!("{property}{MARKER_SUFFIX}"));
            let Some((tag, blob_name)) = marker.split_once(':') else {
                warn!(table, property = %property, "malformed blob marker");
                continue;
            };
            let Some(bytes) = self.blobs.get_bytes(table, blob_name).await? else {
                warn!(table, property = %property, blob = %blob_name, "spilled blob is missing");
                continue;
            };
            let value = match tag {
                STRING_TAG => match String::from_utf8(bytes) {
                    Ok(s) => PropertyValue::String(s),
                    Err(_) => {
                        warn!(table, property = %property, "spilled string is not UTF-8");
                        continue;
                    }
                },
                _ => PropertyValue::Binary(bytes),
            };
            bag.insert(property, value);
        }
        Ok(bag)
    }

    /// Deletes blobs, logging rather than failing on errors.
    pub(crate) async fn discard(&self, table: &str, names: impl IntoIterator<Item = String>) {
        for name in names {
            if let Err(e) = self.blobs.delete(table, &name).await {
                warn!(table, blob = %name, error = %e, "failed to delete blob");
            }
        }
    }

    /// Deletes blobs `previous` references that `current` no longer does.
    pub(crate) async fn discard_superseded(
        &self,
        table: &str,
        previous: &PropertyBag,
        current: Option<&PropertyBag>,
    ) {
        let keep = current.map(references).unwrap_or_default();
        let stale: Vec<String> = references(previous)
            .into_iter()
            .filter(|name| !keep.contains(name))
            .collect();
        self.discard(table, stale).await;
    }
}

/// Blob names referenced by markers in a stored bag.
pub(crate) fn references(bag: &PropertyBag) -> BTreeSet<String> {
    bag.iter()
        .filter(|(name, _)| name.ends_with(MARKER_SUFFIX))
        .filter_map(|(_, value)| value.as_str()?.split_once(':').map(|(_, n)| n.to_string()))
        .collect()
}
