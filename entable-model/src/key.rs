//! Row and partition key derivation.
//!
//! A [`KeySpec`] pairs one [`RowKeyProducer`] with one
//! [`PartitionKeyProducer`]. Producers read identifying values from a
//! [`PropertyBag`] (stored property names), so the same spec derives keys
//! from a full entity or from the equality assignments of a predicate.
//!
//! Partition derivation receives the already computed row key and may depend
//! on it; row derivation never sees the partition.

use entable_types::{KeyPair, PropertyBag, PropertyValue};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

use crate::error::{ModelError, ModelResult};

/// Characters a table store refuses inside keys, besides control characters.
const FORBIDDEN: [char; 4] = ['/', '\\', '#', '?'];

/// Escapes a value so it is safe to use as (part of) a key.
///
/// Forbidden characters, control characters and `%` itself become `%XX`
/// per UTF-8 byte. The mapping is injective; see [`decode_key_component`].
pub fn encode_key_component(raw: &str) -> String {
    encode_with(raw, &[])
}

fn encode_with(raw: &str, extra: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch == '%' || ch.is_control() || FORBIDDEN.contains(&ch) || extra.contains(&ch) {
            let mut buf = [0u8; 4];
            for byte in ch.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{byte:02X}"));
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// Reverses [`encode_key_component`]. Returns `None` for malformed input.
pub fn decode_key_component(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn required<'a>(values: &'a PropertyBag, member: &str) -> ModelResult<&'a PropertyValue> {
    values
        .get(member)
        .ok_or_else(|| ModelError::MissingKeyMember(member.to_string()))
}

fn non_empty(key: String, producer: &str) -> ModelResult<String> {
    if key.is_empty() {
        Err(ModelError::EmptyKey(producer.to_string()))
    } else {
        Ok(key)
    }
}

/// Derives the row key from identifying values.
pub trait RowKeyProducer: Send + Sync {
    fn row_key(&self, values: &PropertyBag) -> ModelResult<String>;

    /// Short human-readable description used in diagnostics.
    fn describe(&self) -> String {
        "custom row key".to_string()
    }
}

/// Derives the partition key from identifying values and the row key.
pub trait PartitionKeyProducer: Send + Sync {
    fn partition_key(&self, values: &PropertyBag, row_key: &str) -> ModelResult<String>;

    fn describe(&self) -> String {
        "custom partition key".to_string()
    }
}

impl<F> RowKeyProducer for F
where
    F: Fn(&PropertyBag) -> ModelResult<String> + Send + Sync,
{
    fn row_key(&self, values: &PropertyBag) -> ModelResult<String> {
        self(values)
    }
}

impl<F> PartitionKeyProducer for F
where
    F: Fn(&PropertyBag, &str) -> ModelResult<String> + Send + Sync,
{
    fn partition_key(&self, values: &PropertyBag, row_key: &str) -> ModelResult<String> {
        self(values, row_key)
    }
}

// ── Row key producers ────────────────────────────────────────────

/// Row key taken from a single property.
#[derive(Debug, Clone)]
pub struct FieldKey {
    member: String,
    lowercase: bool,
}

impl FieldKey {
    pub fn new(member: impl Into<String>) -> Self {
        Self {
            member: member.into(),
            lowercase: false,
        }
    }

    /// Lowercases the value before encoding (case-insensitive identities).
    #[must_use]
    pub fn lowercase(mut self) -> Self {
        self.lowercase = true;
        self
    }
}

impl RowKeyProducer for FieldKey {
    fn row_key(&self, values: &PropertyBag) -> ModelResult<String> {
        let mut raw = required(values, &self.member)?.to_key_string();
        if self.lowercase {
            raw = raw.to_lowercase();
        }
        non_empty(encode_key_component(&raw), &self.describe())
    }

    fn describe(&self) -> String {
        format!("field `{}`", self.member)
    }
}

#[derive(Debug, Clone)]
enum CompositeMode {
    Joined(char),
    Hashed,
}

/// Row key combining several properties, either joined or hashed.
#[derive(Debug, Clone)]
pub struct CompositeKey {
    members: Vec<String>,
    mode: CompositeMode,
}

impl CompositeKey {
    /// Joins the encoded values with `separator`. The separator is escaped
    /// inside each component, so distinct inputs never collide.
    pub fn joined<I, S>(members: I, separator: char) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            members: members.into_iter().map(Into::into).collect(),
            mode: CompositeMode::Joined(separator),
        }
    }

    /// SHA-256 (hex) over the length-prefixed values. Fixed-length keys
    /// regardless of input size.
    pub fn hashed<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            members: members.into_iter().map(Into::into).collect(),
            mode: CompositeMode::Hashed,
        }
    }
}

impl RowKeyProducer for CompositeKey {
    fn row_key(&self, values: &PropertyBag) -> ModelResult<String> {
        if self.members.is_empty() {
            return Err(ModelError::Configuration(
                "composite key declares no members".to_string(),
            ));
        }
        let parts = self
            .members
            .iter()
            .map(|m| required(values, m).map(PropertyValue::to_key_string))
            .collect::<ModelResult<Vec<_>>>()?;

        let key = match self.mode {
            CompositeMode::Joined(sep) => parts
                .iter()
                .map(|p| encode_with(p, &[sep]))
                .collect::<Vec<_>>()
                .join(&sep.to_string()),
            CompositeMode::Hashed => {
                let mut hasher = Sha256::new();
                for part in &parts {
                    hasher.update((part.len() as u64).to_be_bytes());
                    hasher.update(part.as_bytes());
                }
                hex::encode(hasher.finalize())
            }
        };
        non_empty(key, &self.describe())
    }

    fn describe(&self) -> String {
        format!("composite of [{}]", self.members.join(", "))
    }
}

/// Row key of a pointer record, computed from a secondary property of a
/// *different* entity type.
///
/// Given the source entity's bag, produces `scope:value` so pointer rows of
/// several indexes can share one table.
#[derive(Debug, Clone)]
pub struct IndexKey {
    scope: String,
    source_member: String,
    lowercase: bool,
}

impl IndexKey {
    pub fn new(scope: impl Into<String>, source_member: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            source_member: source_member.into(),
            lowercase: false,
        }
    }

    #[must_use]
    pub fn lowercase(mut self) -> Self {
        self.lowercase = true;
        self
    }

    /// The source property this index reads.
    pub fn source_member(&self) -> &str {
        &self.source_member
    }

    /// Pointer row key for a raw secondary value.
    pub fn key_for_value(&self, value: &PropertyValue) -> ModelResult<String> {
        let mut raw = value.to_key_string();
        if self.lowercase {
            raw = raw.to_lowercase();
        }
        if raw.is_empty() {
            return Err(ModelError::EmptyKey(self.describe()));
        }
        Ok(format!(
            "{}:{}",
            encode_with(&self.scope, &[':']),
            encode_key_component(&raw)
        ))
    }
}

impl RowKeyProducer for IndexKey {
    fn row_key(&self, values: &PropertyBag) -> ModelResult<String> {
        self.key_for_value(required(values, &self.source_member)?)
    }

    fn describe(&self) -> String {
        format!("index `{}` on `{}`", self.scope, self.source_member)
    }
}

// ── Partition key producers ──────────────────────────────────────

/// Every row lands in one partition.
#[derive(Debug, Clone)]
pub struct FixedPartition(String);

impl FixedPartition {
    pub fn new(partition: impl Into<String>) -> Self {
        Self(partition.into())
    }
}

impl PartitionKeyProducer for FixedPartition {
    fn partition_key(&self, _values: &PropertyBag, _row_key: &str) -> ModelResult<String> {
        non_empty(encode_key_component(&self.0), &self.describe())
    }

    fn describe(&self) -> String {
        format!("fixed partition `{}`", self.0)
    }
}

/// Partition taken from a property.
#[derive(Debug, Clone)]
pub struct FieldPartition {
    member: String,
}

impl FieldPartition {
    pub fn new(member: impl Into<String>) -> Self {
        Self {
            member: member.into(),
        }
    }
}

impl PartitionKeyProducer for FieldPartition {
    fn partition_key(&self, values: &PropertyBag, _row_key: &str) -> ModelResult<String> {
        let raw = required(values, &self.member)?.to_key_string();
        non_empty(encode_key_component(&raw), &self.describe())
    }

    fn describe(&self) -> String {
        format!("partition field `{}`", self.member)
    }
}

/// Partition made of the first `len` characters of the row key.
#[derive(Debug, Clone, Copy)]
pub struct RowKeyPrefixPartition {
    len: usize,
}

impl RowKeyPrefixPartition {
    pub fn new(len: usize) -> Self {
        Self { len: len.max(1) }
    }
}

impl PartitionKeyProducer for RowKeyPrefixPartition {
    fn partition_key(&self, _values: &PropertyBag, row_key: &str) -> ModelResult<String> {
        let prefix: String = row_key.chars().take(self.len).collect();
        non_empty(prefix, &self.describe())
    }

    fn describe(&self) -> String {
        format!("row key prefix ({} chars)", self.len)
    }
}

/// Spreads rows over `buckets` partitions by hashing the row key.
#[derive(Debug, Clone, Copy)]
pub struct HashBucketPartition {
    buckets: u32,
}

impl HashBucketPartition {
    pub fn new(buckets: u32) -> Self {
        Self {
            buckets: buckets.max(1),
        }
    }
}

impl PartitionKeyProducer for HashBucketPartition {
    fn partition_key(&self, _values: &PropertyBag, row_key: &str) -> ModelResult<String> {
        let digest = Sha256::digest(row_key.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let bucket = u64::from_be_bytes(head) % u64::from(self.buckets);
        let width = (self.buckets - 1).max(1).to_string().len();
        Ok(format!("{bucket:0width$}"))
    }

    fn describe(&self) -> String {
        format!("hash bucket ({})", self.buckets)
    }
}

// ── KeySpec ──────────────────────────────────────────────────────

/// Standalone key descriptor for an entity type.
#[derive(Clone)]
pub struct KeySpec {
    row: Arc<dyn RowKeyProducer>,
    partition: Arc<dyn PartitionKeyProducer>,
}

impl KeySpec {
    pub fn new(
        row: impl RowKeyProducer + 'static,
        partition: impl PartitionKeyProducer + 'static,
    ) -> Self {
        Self {
            row: Arc::new(row),
            partition: Arc::new(partition),
        }
    }

    pub fn from_arcs(
        row: Arc<dyn RowKeyProducer>,
        partition: Arc<dyn PartitionKeyProducer>,
    ) -> Self {
        Self { row, partition }
    }

    pub fn derive_row_key(&self, values: &PropertyBag) -> ModelResult<String> {
        self.row.row_key(values)
    }

    pub fn derive_partition_key(&self, values: &PropertyBag, row_key: &str) -> ModelResult<String> {
        self.partition.partition_key(values, row_key)
    }

    /// Derives the full key pair; the partition producer sees the row key.
    pub fn derive(&self, values: &PropertyBag) -> ModelResult<KeyPair> {
        let row_key = self.derive_row_key(values)?;
        let partition_key = self.derive_partition_key(values, &row_key)?;
        Ok(KeyPair::new(row_key, partition_key))
    }

    /// Derives keys from predicate assignments.
    ///
    /// Missing members are configuration errors here: the caller asked to
    /// locate a row by a filter that cannot address it.
    pub fn derive_from_assignments(&self, assignments: &PropertyBag) -> ModelResult<KeyPair> {
        if assignments.is_empty() {
            return Err(ModelError::Configuration(format!(
                "predicate has no equality assignment usable for {} / {}",
                self.row.describe(),
                self.partition.describe()
            )));
        }
        self.derive(assignments).map_err(|e| match e {
            ModelError::MissingKeyMember(member) => ModelError::Configuration(format!(
                "predicate does not assign `{member}` required by {}",
                self.row.describe()
            )),
            other => other,
        })
    }
}

impl fmt::Debug for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySpec")
            .field("row", &self.row.describe())
            .field("partition", &self.partition.describe())
            .finish()
    }
}
