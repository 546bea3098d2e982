//! Modifiers: side-effecting hooks attached to entity members.
//!
//! Each successful hook returns a [`Rollback`]. When a later hook (or the
//! base write) fails, the recorded rollbacks run in reverse order before the
//! operation reports failure.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use entable_storage::StorageError;
use entable_types::{KeyPair, PropertyBag};
use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Compensating action returned by a successful modifier step.
pub type Rollback = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), ModifierError>> + Send>;

/// Wraps an async closure as a [`Rollback`].
pub fn rollback<F, Fut>(undo: F) -> Rollback
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ModifierError>> + Send + 'static,
{
    Box::new(move || undo().boxed())
}

/// A rollback with nothing to undo.
pub fn no_rollback() -> Rollback {
    Box::new(|| async { Ok(()) }.boxed())
}

/// Chains two rollbacks; `second` runs first.
pub(crate) fn then_undo(first: Rollback, second: Rollback) -> Rollback {
    rollback(move || async move {
        second().await?;
        first().await
    })
}

#[derive(Debug, Error)]
pub enum ModifierError {
    /// A uniqueness or business constraint rejected the write.
    #[error("constraint violated: {0}")]
    ConstraintViolation(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What a modifier sees of the mutation.
#[derive(Debug, Clone, Copy)]
pub struct ModifierContext<'a> {
    /// Table of the entity being mutated.
    pub table: &'a str,
    pub keys: &'a KeyPair,
    /// Stored property name of the member the modifier is attached to.
    pub property: &'a str,
    /// Stored state before the mutation (absent on create).
    pub before: Option<&'a PropertyBag>,
    /// Stored state after the mutation (absent on delete).
    pub after: Option<&'a PropertyBag>,
}

/// A hook attached to one member of an entity type.
#[async_trait]
pub trait Modifier: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Entity member this modifier is attached to.
    fn member(&self) -> &str;

    async fn on_create(&self, _ctx: &ModifierContext<'_>) -> Result<Rollback, ModifierError> {
        Ok(no_rollback())
    }

    async fn on_update(&self, _ctx: &ModifierContext<'_>) -> Result<Rollback, ModifierError> {
        Ok(no_rollback())
    }

    async fn on_delete(&self, _ctx: &ModifierContext<'_>) -> Result<Rollback, ModifierError> {
        Ok(no_rollback())
    }
}

/// A modifier with its member already resolved to a stored property name.
#[derive(Clone)]
pub(crate) struct BoundModifier {
    pub modifier: Arc<dyn Modifier>,
    pub property: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Create,
    Update,
    Delete,
}

/// The modifier step that broke a saga.
#[derive(Debug)]
pub(crate) struct StepFailure {
    pub modifier: String,
    pub error: ModifierError,
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "modifier `{}` failed: {}", self.modifier, self.error)
    }
}

/// Recorded rollbacks of the modifier steps applied so far.
#[derive(Default)]
pub(crate) struct Saga {
    steps: Vec<(String, Rollback)>,
}

impl Saga {
    /// Runs `modifiers` in declaration order, stopping at the first failure.
    pub(crate) async fn apply(
        &mut self,
        modifiers: &[BoundModifier],
        phase: Phase,
        table: &str,
        keys: &KeyPair,
        before: Option<&PropertyBag>,
        after: Option<&PropertyBag>,
    ) -> Result<(), StepFailure> {
        for bound in modifiers {
            let ctx = ModifierContext {
                table,
                keys,
                property: &bound.property,
                before,
                after,
            };
            let step = match phase {
                Phase::Create => bound.modifier.on_create(&ctx).await,
                Phase::Update => bound.modifier.on_update(&ctx).await,
                Phase::Delete => bound.modifier.on_delete(&ctx).await,
            };
            let name = bound.modifier.name().to_string();
            match step {
                Ok(undo) => {
                    debug!(table, keys = %keys, modifier = %name, ?phase, "modifier applied");
                    self.steps.push((name, undo));
                }
                Err(error) => {
                    debug!(table, keys = %keys, modifier = %name, ?phase, %error, "modifier failed");
                    return Err(StepFailure {
                        modifier: name,
                        error,
                    });
                }
            }
        }
        Ok(())
    }

    /// Runs every recorded rollback exactly once, newest first, and returns
    /// descriptions of those that failed.
    pub(crate) async fn compensate(self) -> Vec<String> {
        let mut failures = Vec::new();
        if !self.steps.is_empty() {
            info!(steps = self.steps.len(), "compensating applied modifier steps");
        }
        for (name, undo) in self.steps.into_iter().rev() {
            if let Err(e) = undo().await {
                warn!(modifier = %name, error = %e, "rollback failed");
                failures.push(format!("rollback of `{name}`: {e}"));
            } else {
                debug!(modifier = %name, "rolled back");
            }
        }
        failures
    }
}
