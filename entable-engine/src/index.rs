//! Unique secondary index maintained as pointer rows.
//!
//! A pointer row lives in the index table under [`IndexKey`] and names the
//! key pair of the entity holding the value. Claiming an occupied pointer is
//! a constraint violation.

use std::sync::Arc;

use async_trait::async_trait;
use entable_model::{IndexKey, encode_key_component};
use entable_storage::{DeleteOutcome, TableStore, WriteCondition, WriteOutcome};
use entable_types::{KeyPair, PropertyBag, PropertyValue};
use tracing::debug;

use crate::error::EngineResult;
use crate::modifier::{Modifier, ModifierContext, ModifierError, Rollback, no_rollback, rollback, then_undo};

const TARGET_ROW: &str = "TargetRowKey";
const TARGET_PARTITION: &str = "TargetPartitionKey";

pub struct UniqueIndex {
    name: String,
    member: String,
    table: String,
    key: IndexKey,
    store: Arc<dyn TableStore>,
}

impl UniqueIndex {
    /// Index over `member`, storing pointer rows in `table`.
    pub fn new(store: Arc<dyn TableStore>, table: impl Into<String>, member: impl Into<String>) -> Self {
        let member = member.into();
        Self {
            name: format!("unique({member})"),
            key: IndexKey::new(member.clone(), member.clone()),
            member,
            table: table.into(),
            store,
        }
    }

    /// Treats values differing only in case as equal.
    #[must_use]
    pub fn case_insensitive(mut self) -> Self {
        self.key = self.key.lowercase();
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Address of the pointer row for `value`.
    pub fn pointer_keys(&self, value: &PropertyValue) -> EngineResult<KeyPair> {
        let row_key = self.key.key_for_value(value)?;
        Ok(KeyPair::new(row_key, encode_key_component(&self.member)))
    }

    /// Key pair of the entity currently holding `value`.
    pub async fn lookup(&self, value: &PropertyValue) -> EngineResult<Option<KeyPair>> {
        let pointer = self.pointer_keys(value)?;
        Ok(self
            .store
            .get(&self.table, &pointer)
            .await?
            .and_then(|row| target(&row.bag)))
    }

    fn pointer(&self, value: &PropertyValue) -> Result<KeyPair, ModifierError> {
        self.pointer_keys(value)
            .map_err(|e| ModifierError::Failed(format!("{}: {e}", self.name)))
    }

    /// Points `value` at `owner`. Re-claiming one's own pointer is a no-op.
    async fn claim(&self, value: &PropertyValue, owner: &KeyPair) -> Result<Rollback, ModifierError> {
        let pointer = self.pointer(value)?;
        let bag = PropertyBag::new()
            .with(TARGET_ROW, owner.row_key.clone())
            .with(TARGET_PARTITION, owner.partition_key.clone());

        match self
            .store
            .put(&self.table, &pointer, bag, WriteCondition::Absent)
            .await?
        {
            WriteOutcome::Written(etag) => {
                debug!(index = %self.name, pointer = %pointer, owner = %owner, "pointer claimed");
                let store = Arc::clone(&self.store);
                let table = self.table.clone();
                Ok(rollback(move || async move {
                    match store.delete(&table, &pointer, Some(&etag)).await? {
                        DeleteOutcome::Deleted | DeleteOutcome::NotFound => Ok(()),
                        DeleteOutcome::Conflict => Err(ModifierError::Failed(format!(
                            "pointer {pointer} changed before it could be released"
                        ))),
                    }
                }))
            }
            WriteOutcome::AlreadyExists => {
                let holder = self
                    .store
                    .get(&self.table, &pointer)
                    .await?
                    .and_then(|row| target(&row.bag));
                if holder.as_ref() == Some(owner) {
                    return Ok(no_rollback());
                }
                Err(ModifierError::ConstraintViolation(format!(
                    "`{}` value {value} is already taken",
                    self.member
                )))
            }
            other => Err(ModifierError::Failed(format!(
                "unexpected pointer write result {other:?}"
            ))),
        }
    }

    /// Removes the pointer for `value` if `owner` holds it.
    async fn release(&self, value: &PropertyValue, owner: &KeyPair) -> Result<Rollback, ModifierError> {
        let pointer = self.pointer(value)?;
        let Some(row) = self.store.get(&self.table, &pointer).await? else {
            return Ok(no_rollback());
        };
        if target(&row.bag).as_ref() != Some(owner) {
            return Ok(no_rollback());
        }
        match self
            .store
            .delete(&self.table, &pointer, Some(&row.etag))
            .await?
        {
            DeleteOutcome::Deleted => {
                debug!(index = %self.name, pointer = %pointer, "pointer released");
                let store = Arc::clone(&self.store);
                let table = self.table.clone();
                Ok(rollback(move || async move {
                    match store
                        .put(&table, &pointer, row.bag, WriteCondition::Absent)
                        .await?
                    {
                        WriteOutcome::Written(_) => Ok(()),
                        other => Err(ModifierError::Failed(format!(
                            "could not restore pointer {pointer}: {other:?}"
                        ))),
                    }
                }))
            }
            _ => Ok(no_rollback()),
        }
    }
}

fn target(bag: &PropertyBag) -> Option<KeyPair> {
    let row_key = bag.get(TARGET_ROW)?.as_str()?;
    let partition_key = bag.get(TARGET_PARTITION)?.as_str()?;
    Some(KeyPair::new(row_key, partition_key))
}

#[async_trait]
impl Modifier for UniqueIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn member(&self) -> &str {
        &self.member
    }

    async fn on_create(&self, ctx: &ModifierContext<'_>) -> Result<Rollback, ModifierError> {
        match ctx.after.and_then(|bag| bag.get(ctx.property)) {
            Some(value) => self.claim(value, ctx.keys).await,
            None => Ok(no_rollback()),
        }
    }

    async fn on_update(&self, ctx: &ModifierContext<'_>) -> Result<Rollback, ModifierError> {
        let old = ctx.before.and_then(|bag| bag.get(ctx.property));
        let new = ctx.after.and_then(|bag| bag.get(ctx.property));

        let moved = match (old, new) {
            (Some(old), Some(new)) => self.pointer(old)? != self.pointer(new)?,
            (Some(_), None) => true,
            _ => false,
        };
        let unclaim = match new {
            Some(value) => self.claim(value, ctx.keys).await?,
            None => no_rollback(),
        };
        let Some(old) = old.filter(|_| moved) else {
            return Ok(unclaim);
        };
        match self.release(old, ctx.keys).await {
            Ok(unrelease) => Ok(then_undo(unclaim, unrelease)),
            Err(e) => {
                if let Err(undo) = unclaim().await {
                    return Err(ModifierError::Failed(format!(
                        "{e}; undoing claim also failed: {undo}"
                    )));
                }
                Err(e)
            }
        }
    }

    async fn on_delete(&self, ctx: &ModifierContext<'_>) -> Result<Rollback, ModifierError> {
        match ctx.before.and_then(|bag| bag.get(ctx.property)) {
            Some(value) => self.release(value, ctx.keys).await,
            None => Ok(no_rollback()),
        }
    }
}
