//! Entity-to-table mapping and concurrency engine.
//!
//! Typed entities are persisted in a schemaless table store that offers only
//! single-row conditional writes. On top of that primitive this crate builds:
//!
//! - [`Table::create`], [`Table::update`], [`Table::upsert`] and
//!   [`Table::delete`], with [`Modifier`] hooks whose rollbacks run in reverse
//!   order when a later step fails
//! - [`Table::locked_update`], a sentinel-based lock with retry, timeout and
//!   stale-lock recovery
//! - [`run_batches`] and the `*_many` bulk operations, packing items into
//!   payload-bounded windows that shrink when the provider says they are
//!   still too large
//!
//! Entity types are registered once in an [`EntityRegistry`]; registration
//! is validated eagerly.

mod batch;
mod config;
mod error;
mod index;
mod lock;
mod modifier;
mod registry;
mod spill;
mod table;

pub use batch::{
    BatchReport, BatchSubmitter, ItemOutcome, SubmittedWindow, WindowPlan, WindowResult,
    plan_windows, run_batches,
};
pub use config::{
    BatchConfig, BatchLimits, BlobConfig, EngineConfig, LockConfig, LockOptions, MutationConfig,
};
pub use error::{EngineError, EngineResult};
pub use index::UniqueIndex;
pub use lock::{LockRejection, LockState, LockedOutcome};
pub use modifier::{Modifier, ModifierContext, ModifierError, Rollback, no_rollback, rollback};
pub use registry::{Entity, EntityRegistry, RegistrationBuilder, RegistryBuilder, TableRegistration};
pub use table::{
    CreateOutcome, DeleteOutcome, Modified, Stored, Table, Tables, UpdateOutcome, UpsertOutcome,
};
