//! The mutation protocol and reads.
//!
//! Every write is a single-row conditional write. Modifiers run after the
//! base write succeeds; if one fails, the rollbacks recorded so far run
//! newest-first and the base write is undone before the failure is reported.

use std::fmt;
use std::sync::Arc;

use entable_model::Predicate;
use entable_storage::{
    BlobStore, DeleteOutcome as StoreDelete, StorageError, StoredRow, TableStore, WriteCondition,
    WriteOutcome,
};
use entable_types::{ETag, KeyPair, PropertyBag, PropertyValue};
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::index::UniqueIndex;
use crate::modifier::{ModifierError, Phase, Saga, StepFailure};
use crate::registry::{Entity, EntityRegistry, TableRegistration};
use crate::spill::{BlobSpill, Offloaded};

/// An entity together with its address and the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<E> {
    pub entity: E,
    pub keys: KeyPair,
    pub etag: ETag,
}

#[derive(Debug)]
pub enum CreateOutcome<E> {
    Created(Stored<E>),
    /// The key pair is occupied; nothing was written.
    AlreadyExists,
    /// A modifier rejected the write; everything was rolled back.
    ConstraintViolation(String),
}

impl<E> CreateOutcome<E> {
    pub fn created(self) -> Option<Stored<E>> {
        match self {
            CreateOutcome::Created(stored) => Some(stored),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum UpdateOutcome<E> {
    Updated(Stored<E>),
    NotFound,
    /// The presented ETag is stale; stored state is unchanged.
    Conflict,
    ConstraintViolation(String),
}

impl<E> UpdateOutcome<E> {
    pub fn updated(self) -> Option<Stored<E>> {
        match self {
            UpdateOutcome::Updated(stored) => Some(stored),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum UpsertOutcome<E> {
    Upserted(Stored<E>),
    ConstraintViolation(String),
    /// The row kept changing under a modifier-guarded replace.
    Conflict,
}

impl<E> UpsertOutcome<E> {
    pub fn upserted(self) -> Option<Stored<E>> {
        match self {
            UpsertOutcome::Upserted(stored) => Some(stored),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum DeleteOutcome<E> {
    Deleted,
    NotFound,
    /// The row changed since the caller observed it. Carries the current
    /// state and a way to re-issue the delete against it.
    Modified(Modified<E>),
    /// The row kept changing and the re-issue budget is spent.
    Conflict,
    ConstraintViolation(String),
}

/// Fresh state of a concurrently modified row plus a re-issued delete.
pub struct Modified<E> {
    current: Stored<E>,
    table: Table<E>,
    reissues_left: u32,
}

impl<E: Entity> Modified<E> {
    pub fn current(&self) -> &Stored<E> {
        &self.current
    }

    pub fn into_current(self) -> Stored<E> {
        self.current
    }

    /// Deletes the row as of the state in [`current`](Self::current).
    pub async fn reissue(self) -> EngineResult<DeleteOutcome<E>> {
        debug!(table = self.table.name(), keys = %self.current.keys, left = self.reissues_left, "re-issuing delete");
        self.table
            .delete_observed(&self.current.keys, &self.current.etag, self.reissues_left)
            .await
    }
}

impl<E: fmt::Debug> fmt::Debug for Modified<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Modified")
            .field("current", &self.current)
            .field("reissues_left", &self.reissues_left)
            .finish()
    }
}

/// Result of a base-row write.
pub(crate) enum RowWrite {
    Written {
        etag: ETag,
        stored: PropertyBag,
        blobs: Vec<String>,
    },
    Rejected(WriteOutcome),
}

/// Entry point: a store, a registry and configuration.
#[derive(Clone)]
pub struct Tables {
    store: Arc<dyn TableStore>,
    blobs: Option<Arc<dyn BlobStore>>,
    spill: Option<BlobSpill>,
    registry: Arc<EntityRegistry>,
    config: Arc<EngineConfig>,
}

impl Tables {
    pub fn new(store: Arc<dyn TableStore>, registry: EntityRegistry) -> Self {
        Self {
            store,
            blobs: None,
            spill: None,
            registry: Arc::new(registry),
            config: Arc::new(EngineConfig::default()),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Arc::new(config);
        self.refresh_spill();
        self
    }

    /// Attaches a blob store for large-value offload.
    #[must_use]
    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self.refresh_spill();
        self
    }

    fn refresh_spill(&mut self) {
        self.spill = match &self.blobs {
            Some(blobs) if self.config.blob.enabled => Some(BlobSpill::new(
                Arc::clone(blobs),
                self.config.blob.inline_limit,
            )),
            _ => None,
        };
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TableStore> {
        &self.store
    }

    /// Handle for entity type `E`; fails if `E` is not registered or its
    /// mapper claims the lock sentinel property.
    pub fn table<E: Entity>(&self) -> EngineResult<Table<E>> {
        let registration = self.registry.registration::<E>()?;
        let sentinel = &self.config.lock.sentinel_property;
        if let Some(member) = registration.mapper().members().iter().find(|m| {
            m.store_name() == sentinel || (m.is_expanded() && sentinel.starts_with(m.store_name()))
        }) {
            return Err(EngineError::Configuration(format!(
                "member `{}` of table `{}` collides with lock property `{sentinel}`",
                member.name(),
                registration.table()
            )));
        }
        Ok(Table {
            tables: self.clone(),
            registration,
        })
    }
}

impl fmt::Debug for Tables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tables")
            .field("registry", &self.registry)
            .field("blob_spill", &self.spill.is_some())
            .finish()
    }
}

/// Typed handle on the table an entity type is registered to.
pub struct Table<E> {
    tables: Tables,
    registration: Arc<TableRegistration<E>>,
}

impl<E> Clone for Table<E> {
    fn clone(&self) -> Self {
        Self {
            tables: self.tables.clone(),
            registration: Arc::clone(&self.registration),
        }
    }
}

impl<E> fmt::Debug for Table<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Table").field(&self.registration).finish()
    }
}

impl<E: Entity> Table<E> {
    pub fn name(&self) -> &str {
        self.registration.table()
    }

    pub fn registration(&self) -> &TableRegistration<E> {
        &self.registration
    }

    /// Key pair `entity` is stored under.
    pub fn keys_for(&self, entity: &E) -> EngineResult<KeyPair> {
        let bag = self.registration.mapper().to_bag(entity)?;
        Ok(self.registration.key_spec().derive(&bag)?)
    }

    pub(crate) fn store(&self) -> &dyn TableStore {
        self.tables.store.as_ref()
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.tables.config
    }

    pub(crate) fn sentinel(&self) -> &str {
        &self.tables.config.lock.sentinel_property
    }

    // ── Reads ───────────────────────────────────────────────────

    pub async fn get(&self, keys: &KeyPair) -> EngineResult<Option<Stored<E>>> {
        match self.read_raw(keys).await? {
            Some(row) => self.materialize(row).await.map(Some),
            None => Ok(None),
        }
    }

    /// Re-reads the row `entity` maps to.
    pub async fn get_for(&self, entity: &E) -> EngineResult<Option<Stored<E>>> {
        let keys = self.keys_for(entity)?;
        self.get(&keys).await
    }

    /// Point lookup addressed by a predicate over entity members.
    ///
    /// Keys come from the predicate's equality assignments; the row is
    /// returned only if it also satisfies the rest of the predicate.
    pub async fn find(&self, predicate: &Predicate) -> EngineResult<Option<Stored<E>>> {
        let translated = self.registration.mapper().translate(predicate);
        let keys = self
            .registration
            .key_spec()
            .derive_from_assignments(&translated.assignments())?;
        let Some(row) = self.read_raw(&keys).await? else {
            return Ok(None);
        };
        let bag = self.logical(row.bag).await?;
        if !translated.matches(&bag) {
            return Ok(None);
        }
        let entity = self.registration.mapper().from_bag(&bag)?;
        Ok(Some(Stored {
            entity,
            keys: row.keys,
            etag: row.etag,
        }))
    }

    /// Scans a partition (or the whole table) with a store-side filter over
    /// entity members. Spilled values are not visible to the filter.
    pub async fn query(
        &self,
        partition: Option<&str>,
        filter: Option<&Predicate>,
    ) -> EngineResult<Vec<Stored<E>>> {
        let translated = filter.map(|p| self.registration.mapper().translate(p));
        let rows = self
            .store()
            .query(self.name(), partition, translated.as_ref())
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(self.materialize(row).await?);
        }
        Ok(out)
    }

    /// Follows a unique-index pointer to the entity it names.
    pub async fn get_by_index(
        &self,
        index: &UniqueIndex,
        value: impl Into<PropertyValue>,
    ) -> EngineResult<Option<Stored<E>>> {
        match index.lookup(&value.into()).await? {
            Some(keys) => self.get(&keys).await,
            None => Ok(None),
        }
    }

    pub(crate) async fn read_raw(&self, keys: &KeyPair) -> EngineResult<Option<StoredRow>> {
        Ok(self.store().get(self.name(), keys).await?)
    }

    /// Stored bag → bag the mapper and modifiers see.
    pub(crate) async fn logical(&self, mut raw: PropertyBag) -> EngineResult<PropertyBag> {
        raw.remove(self.sentinel());
        match &self.tables.spill {
            Some(spill) => spill.resolve(self.name(), raw).await,
            None => Ok(raw),
        }
    }

    pub(crate) async fn materialize(&self, row: StoredRow) -> EngineResult<Stored<E>> {
        let bag = self.logical(row.bag).await?;
        Ok(Stored {
            entity: self.registration.mapper().from_bag(&bag)?,
            keys: row.keys,
            etag: row.etag,
        })
    }

    // ── Writes ──────────────────────────────────────────────────

    /// Inserts `entity`; an occupied key pair is `AlreadyExists`.
    pub async fn create(&self, entity: &E) -> EngineResult<CreateOutcome<E>> {
        let bag = self.registration.mapper().to_bag(entity)?;
        let keys = self.registration.key_spec().derive(&bag)?;
        self.insert_row(keys, bag).await
    }

    /// Conditional insert followed by the create modifiers.
    async fn insert_row(&self, keys: KeyPair, bag: PropertyBag) -> EngineResult<CreateOutcome<E>> {
        let (etag, blobs) = match self.put_row(&keys, bag.clone(), WriteCondition::Absent).await? {
            RowWrite::Written { etag, blobs, .. } => (etag, blobs),
            RowWrite::Rejected(_) => {
                debug!(table = self.name(), keys = %keys, "create rejected: key pair occupied");
                return Ok(CreateOutcome::AlreadyExists);
            }
        };

        let mut saga = Saga::default();
        if let Err(failure) = saga
            .apply(
                self.registration.modifiers(),
                Phase::Create,
                self.name(),
                &keys,
                None,
                Some(&bag),
            )
            .await
        {
            let mut failures = saga.compensate().await;
            match self.store().delete(self.name(), &keys, Some(&etag)).await {
                Ok(StoreDelete::Deleted) => self.discard_blobs(blobs).await,
                Ok(other) => failures.push(format!("removing base row {keys}: {other:?}")),
                Err(e) => failures.push(format!("removing base row {keys}: {e}")),
            }
            return settle(failure, failures, CreateOutcome::ConstraintViolation);
        }

        Ok(CreateOutcome::Created(Stored {
            entity: self.registration.mapper().from_bag(&bag)?,
            keys,
            etag,
        }))
    }

    /// Saves `entity` if the stored row is still at `etag`.
    pub async fn update(&self, entity: &E, etag: &ETag) -> EngineResult<UpdateOutcome<E>> {
        let after = self.registration.mapper().to_bag(entity)?;
        let keys = self.registration.key_spec().derive(&after)?;
        let Some(current) = self.read_raw(&keys).await? else {
            return Ok(UpdateOutcome::NotFound);
        };
        if &current.etag != etag {
            return Ok(UpdateOutcome::Conflict);
        }
        let before = self.logical(current.bag.clone()).await?;
        self.commit_update(&keys, etag, &current.bag, &before, after, current.bag.clone())
            .await
    }

    /// Read, mutate, save. Lost races re-read and re-apply `mutate`, up to
    /// the configured number of attempts.
    pub async fn update_with<F>(&self, keys: &KeyPair, mut mutate: F) -> EngineResult<UpdateOutcome<E>>
    where
        F: FnMut(&mut E) + Send,
    {
        let mapper = self.registration.mapper();
        let attempts = self.config().mutation.max_update_attempts.max(1);
        for attempt in 1..=attempts {
            let Some(current) = self.read_raw(keys).await? else {
                return Ok(UpdateOutcome::NotFound);
            };
            let before = self.logical(current.bag.clone()).await?;
            let mut entity = mapper.from_bag(&before)?;
            mutate(&mut entity);
            let after = mapper.to_bag(&entity)?;
            let derived = self.registration.key_spec().derive(&after)?;
            if &derived != keys {
                return Err(EngineError::KeyChanged {
                    from: keys.clone(),
                    to: derived,
                });
            }
            match self
                .commit_update(keys, &current.etag, &current.bag, &before, after, current.bag.clone())
                .await?
            {
                UpdateOutcome::Conflict => {
                    debug!(table = self.name(), keys = %keys, attempt, "update lost race");
                }
                other => return Ok(other),
            }
        }
        Ok(UpdateOutcome::Conflict)
    }

    /// Insert-or-replace with last-writer-wins semantics; no ETag check.
    ///
    /// On a table with modifiers a new row runs the create modifiers and a
    /// replaced row the update modifiers, each with the usual rollback. The
    /// replace is guarded by the ETag just read, so a row that keeps changing
    /// ends as `Conflict` once the update attempts are spent.
    pub async fn upsert(&self, entity: &E) -> EngineResult<UpsertOutcome<E>> {
        let bag = self.registration.mapper().to_bag(entity)?;
        let keys = self.registration.key_spec().derive(&bag)?;
        if self.registration.modifiers().is_empty() {
            return self.replace_row(keys, bag).await.map(UpsertOutcome::Upserted);
        }

        let attempts = self.config().mutation.max_update_attempts.max(1);
        for attempt in 1..=attempts {
            match self.read_raw(&keys).await? {
                None => match self.insert_row(keys.clone(), bag.clone()).await? {
                    CreateOutcome::Created(stored) => return Ok(UpsertOutcome::Upserted(stored)),
                    CreateOutcome::ConstraintViolation(reason) => {
                        return Ok(UpsertOutcome::ConstraintViolation(reason));
                    }
                    CreateOutcome::AlreadyExists => {}
                },
                Some(current) => {
                    let before = self.logical(current.bag.clone()).await?;
                    match self
                        .commit_update(
                            &keys,
                            &current.etag,
                            &current.bag,
                            &before,
                            bag.clone(),
                            current.bag.clone(),
                        )
                        .await?
                    {
                        UpdateOutcome::Updated(stored) => return Ok(UpsertOutcome::Upserted(stored)),
                        UpdateOutcome::ConstraintViolation(reason) => {
                            return Ok(UpsertOutcome::ConstraintViolation(reason));
                        }
                        UpdateOutcome::NotFound | UpdateOutcome::Conflict => {}
                    }
                }
            }
            debug!(table = self.name(), keys = %keys, attempt, "upsert lost race");
        }
        Ok(UpsertOutcome::Conflict)
    }

    /// Unconditional write for tables without modifiers.
    async fn replace_row(&self, keys: KeyPair, bag: PropertyBag) -> EngineResult<Stored<E>> {
        let previous = match self.tables.spill {
            Some(_) => self.read_raw(&keys).await?.map(|row| row.bag),
            None => None,
        };
        match self.put_row(&keys, bag.clone(), WriteCondition::Any).await? {
            RowWrite::Written { etag, stored, .. } => {
                if let Some(previous) = previous {
                    self.discard_superseded(&previous, Some(&stored)).await;
                }
                Ok(Stored {
                    entity: self.registration.mapper().from_bag(&bag)?,
                    keys,
                    etag,
                })
            }
            RowWrite::Rejected(outcome) => Err(EngineError::Storage(StorageError::Backend(format!(
                "unconditional write to {keys} was rejected: {outcome:?}"
            )))),
        }
    }

    /// Deletes the row if it is still at `etag`. If it changed meanwhile the
    /// outcome is `Modified` with the fresh state.
    pub async fn delete(&self, keys: &KeyPair, etag: &ETag) -> EngineResult<DeleteOutcome<E>> {
        self.delete_observed(keys, etag, self.config().mutation.max_delete_reissues)
            .await
    }

    async fn delete_observed(
        &self,
        keys: &KeyPair,
        etag: &ETag,
        reissues_left: u32,
    ) -> EngineResult<DeleteOutcome<E>> {
        let Some(current) = self.read_raw(keys).await? else {
            return Ok(DeleteOutcome::NotFound);
        };
        if &current.etag != etag {
            return self.modified(current, reissues_left).await;
        }
        let before = self.logical(current.bag.clone()).await?;

        match self.store().delete(self.name(), keys, Some(etag)).await? {
            StoreDelete::Deleted => {}
            StoreDelete::NotFound => return Ok(DeleteOutcome::NotFound),
            StoreDelete::Conflict => {
                return match self.read_raw(keys).await? {
                    Some(row) => self.modified(row, reissues_left).await,
                    None => Ok(DeleteOutcome::NotFound),
                };
            }
        }

        let mut saga = Saga::default();
        if let Err(failure) = saga
            .apply(
                self.registration.modifiers(),
                Phase::Delete,
                self.name(),
                keys,
                Some(&before),
                None,
            )
            .await
        {
            let mut failures = saga.compensate().await;
            match self
                .store()
                .put(self.name(), keys, current.bag.clone(), WriteCondition::Absent)
                .await
            {
                Ok(WriteOutcome::Written(_)) => {}
                Ok(other) => failures.push(format!("restoring deleted row {keys}: {other:?}")),
                Err(e) => failures.push(format!("restoring deleted row {keys}: {e}")),
            }
            return settle(failure, failures, DeleteOutcome::ConstraintViolation);
        }

        self.discard_superseded(&current.bag, None).await;
        Ok(DeleteOutcome::Deleted)
    }

    async fn modified(&self, row: StoredRow, reissues_left: u32) -> EngineResult<DeleteOutcome<E>> {
        if reissues_left == 0 {
            debug!(table = self.name(), keys = %row.keys, "delete re-issue budget spent");
            return Ok(DeleteOutcome::Conflict);
        }
        let current = self.materialize(row).await?;
        Ok(DeleteOutcome::Modified(Modified {
            current,
            table: self.clone(),
            reissues_left: reissues_left - 1,
        }))
    }

    /// ETag-guarded write of `after` followed by the update modifiers.
    ///
    /// `previous` is the stored bag being replaced and `restore` the stored
    /// bag written back if a modifier fails.
    pub(crate) async fn commit_update(
        &self,
        keys: &KeyPair,
        etag: &ETag,
        previous: &PropertyBag,
        before: &PropertyBag,
        after: PropertyBag,
        restore: PropertyBag,
    ) -> EngineResult<UpdateOutcome<E>> {
        let (new_etag, stored, blobs) = match self
            .put_row(keys, after.clone(), WriteCondition::IfMatch(etag.clone()))
            .await?
        {
            RowWrite::Written {
                etag,
                stored,
                blobs,
            } => (etag, stored, blobs),
            RowWrite::Rejected(WriteOutcome::NotFound) => return Ok(UpdateOutcome::NotFound),
            RowWrite::Rejected(_) => return Ok(UpdateOutcome::Conflict),
        };

        let mut saga = Saga::default();
        if let Err(failure) = saga
            .apply(
                self.registration.modifiers(),
                Phase::Update,
                self.name(),
                keys,
                Some(before),
                Some(&after),
            )
            .await
        {
            let mut failures = saga.compensate().await;
            match self
                .store()
                .put(self.name(), keys, restore, WriteCondition::IfMatch(new_etag))
                .await
            {
                Ok(WriteOutcome::Written(_)) => self.discard_blobs(blobs).await,
                Ok(other) => failures.push(format!("restoring base row {keys}: {other:?}")),
                Err(e) => failures.push(format!("restoring base row {keys}: {e}")),
            }
            return settle(failure, failures, UpdateOutcome::ConstraintViolation);
        }

        self.discard_superseded(previous, Some(&stored)).await;
        Ok(UpdateOutcome::Updated(Stored {
            entity: self.registration.mapper().from_bag(&after)?,
            keys: keys.clone(),
            etag: new_etag,
        }))
    }

    /// Writes a logical bag, spilling large values first. Blobs written for
    /// a rejected or failed write are removed again.
    pub(crate) async fn put_row(
        &self,
        keys: &KeyPair,
        bag: PropertyBag,
        condition: WriteCondition,
    ) -> EngineResult<RowWrite> {
        let Offloaded { bag, written } = match &self.tables.spill {
            Some(spill) => spill.offload(self.name(), keys, bag).await?,
            None => Offloaded {
                bag,
                written: Vec::new(),
            },
        };
        match self.store().put(self.name(), keys, bag.clone(), condition).await {
            Ok(WriteOutcome::Written(etag)) => Ok(RowWrite::Written {
                etag,
                stored: bag,
                blobs: written,
            }),
            Ok(outcome) => {
                self.discard_blobs(written).await;
                Ok(RowWrite::Rejected(outcome))
            }
            Err(e) => {
                self.discard_blobs(written).await;
                Err(e.into())
            }
        }
    }

    async fn discard_blobs(&self, blobs: Vec<String>) {
        if let Some(spill) = &self.tables.spill
            && !blobs.is_empty()
        {
            spill.discard(self.name(), blobs).await;
        }
    }

    pub(crate) async fn discard_superseded(&self, previous: &PropertyBag, current: Option<&PropertyBag>) {
        if let Some(spill) = &self.tables.spill {
            spill.discard_superseded(self.name(), previous, current).await;
        }
    }
}

/// Turns a broken saga into the operation's result.
fn settle<T>(
    failure: StepFailure,
    failures: Vec<String>,
    violation: impl FnOnce(String) -> T,
) -> EngineResult<T> {
    if !failures.is_empty() {
        return Err(EngineError::Compensation {
            cause: failure.to_string(),
            failures,
        });
    }
    match failure.error {
        ModifierError::ConstraintViolation(reason) => Ok(violation(reason)),
        ModifierError::Storage(e) => Err(e.into()),
        ModifierError::Failed(reason) => Err(EngineError::Modifier {
            modifier: failure.modifier,
            reason,
        }),
    }
}
