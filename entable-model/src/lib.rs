//! Entity model for entable.
//!
//! Everything here is pure and stateless:
//! - [`key`]: row/partition key producers and the [`KeySpec`] descriptor
//! - [`mapper`]: the per-member contract converting entities to and from a
//!   [`PropertyBag`](entable_types::PropertyBag)
//! - [`query`]: a small predicate builder and the translator that extracts
//!   equality assignments for key derivation or store-side filtering
//!
//! The engine composes these with a store adapter; nothing in this crate
//! performs I/O.

mod error;
pub mod key;
pub mod mapper;
pub mod query;

pub use error::{ModelError, ModelResult};
pub use key::{
    CompositeKey, FieldKey, FieldPartition, FixedPartition, HashBucketPartition, IndexKey,
    KeySpec, PartitionKeyProducer, RowKeyPrefixPartition, RowKeyProducer, decode_key_component,
    encode_key_component,
};
pub use mapper::{EntityMapper, EntityMapperBuilder, InferredCodec, JsonTextCodec, Member, ValueCodec};
pub use query::{Comparison, Predicate};
