//! Pessimistic locking emulated over ETag-guarded writes.
//!
//! The lock is a timestamp sentinel property on the row itself. Acquiring
//! writes a fresh sentinel under the read ETag; releasing clears it under the
//! ETag the acquisition produced. A sentinel older than the staleness
//! threshold may be reclaimed, so a crashed holder cannot lock a row forever.

use std::future::Future;

use chrono::Utc;
use entable_storage::{WriteCondition, WriteOutcome};
use entable_types::{ETag, KeyPair, PropertyBag, PropertyValue};
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, info, warn};

use crate::config::LockOptions;
use crate::error::{EngineError, EngineResult};
use crate::registry::Entity;
use crate::table::{Stored, Table, UpdateOutcome};

/// States of one locked-update call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Attempting,
    Locked,
    Executing,
    Releasing,
    Rejected,
}

/// Why a lock was not taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRejection {
    /// The row stayed locked past the timeout.
    Timeout,
    /// The caller's `should_lock` predicate declined.
    Declined,
}

#[derive(Debug)]
pub enum LockedOutcome<E, T> {
    /// The critical section ran and its changes were saved with the lock
    /// released.
    Completed { stored: Stored<E>, value: T },
    NotFound,
    Rejected(LockRejection),
    /// An update modifier rejected the critical section's changes; the lock
    /// was released with the row unchanged.
    ConstraintViolation(String),
}

impl<E, T> LockedOutcome<E, T> {
    pub fn completed(self) -> Option<(Stored<E>, T)> {
        match self {
            LockedOutcome::Completed { stored, value } => Some((stored, value)),
            _ => None,
        }
    }
}

/// A held lock: the stored bag carrying our sentinel and its ETag.
struct Held {
    locked: PropertyBag,
    etag: ETag,
    before: PropertyBag,
}

impl<E: Entity> Table<E> {
    /// Runs `critical` with the row at `keys` locked, using configured
    /// lock defaults and no predicate.
    pub async fn with_lock<T, F, Fut>(&self, keys: &KeyPair, critical: F) -> EngineResult<LockedOutcome<E, T>>
    where
        T: Send,
        F: FnOnce(E) -> Fut + Send,
        Fut: Future<Output = EngineResult<(E, T)>> + Send,
    {
        let options = self.config().lock.options();
        self.locked_update(keys, &options, |_: &E| true, critical).await
    }

    /// Locks the row, runs `critical` on the current entity, then saves the
    /// returned entity and releases the lock in one ETag-guarded write.
    ///
    /// `should_lock` is consulted on every acquisition attempt with the
    /// freshest state; returning false rejects without waiting.
    pub async fn locked_update<T, P, F, Fut>(
        &self,
        keys: &KeyPair,
        options: &LockOptions,
        should_lock: P,
        critical: F,
    ) -> EngineResult<LockedOutcome<E, T>>
    where
        T: Send,
        P: Fn(&E) -> bool + Send,
        F: FnOnce(E) -> Fut + Send,
        Fut: Future<Output = EngineResult<(E, T)>> + Send,
    {
        let deadline = Instant::now() + options.timeout;
        let mut delay = options.retry_delay;
        self.transition(keys, LockState::Unlocked, LockState::Attempting);

        let (held, entity) = loop {
            let Some(row) = self.read_raw(keys).await? else {
                return Ok(LockedOutcome::NotFound);
            };
            let before = self.logical(row.bag.clone()).await?;
            let entity = self.registration().mapper().from_bag(&before)?;
            if !should_lock(&entity) {
                self.transition(keys, LockState::Attempting, LockState::Rejected);
                return Ok(LockedOutcome::Rejected(LockRejection::Declined));
            }

            if self.lock_available(&row.bag, options.stale_after) {
                let mut locked = row.bag;
                locked.insert(self.sentinel(), Utc::now());
                match self
                    .store()
                    .put(self.name(), keys, locked.clone(), WriteCondition::IfMatch(row.etag))
                    .await?
                {
                    WriteOutcome::Written(etag) => {
                        break (
                            Held {
                                locked,
                                etag,
                                before,
                            },
                            entity,
                        );
                    }
                    WriteOutcome::NotFound => return Ok(LockedOutcome::NotFound),
                    _ => debug!(table = self.name(), keys = %keys, "lost lock race"),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                self.transition(keys, LockState::Attempting, LockState::Rejected);
                return Ok(LockedOutcome::Rejected(LockRejection::Timeout));
            }
            sleep(delay.min(deadline - now)).await;
            delay = options.next_delay(delay);
        };

        self.transition(keys, LockState::Attempting, LockState::Locked);
        self.transition(keys, LockState::Locked, LockState::Executing);
        let result = critical(entity).await;
        self.transition(keys, LockState::Executing, LockState::Releasing);

        let mut unlocked = held.locked.clone();
        unlocked.remove(self.sentinel());

        let prepared = result.and_then(|(entity, value)| {
            let after = self.registration().mapper().to_bag(&entity)?;
            let derived = self.registration().key_spec().derive(&after)?;
            if &derived != keys {
                return Err(EngineError::KeyChanged {
                    from: keys.clone(),
                    to: derived,
                });
            }
            Ok((after, value))
        });
        let (after, value) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.release_unchanged(keys, unlocked, &held.etag).await;
                self.transition(keys, LockState::Releasing, LockState::Unlocked);
                return Err(e);
            }
        };

        let committed = self
            .commit_update(keys, &held.etag, &held.locked, &held.before, after, unlocked.clone())
            .await;
        self.transition(keys, LockState::Releasing, LockState::Unlocked);
        match committed {
            Ok(UpdateOutcome::Updated(stored)) => Ok(LockedOutcome::Completed { stored, value }),
            Ok(UpdateOutcome::ConstraintViolation(reason)) => {
                Ok(LockedOutcome::ConstraintViolation(reason))
            }
            Ok(UpdateOutcome::Conflict | UpdateOutcome::NotFound) => {
                warn!(table = self.name(), keys = %keys, "lock lost before release");
                Err(EngineError::LockLost(keys.clone()))
            }
            Err(e) => {
                // The base write may not have happened; make sure the lock goes.
                self.release_unchanged(keys, unlocked, &held.etag).await;
                Err(e)
            }
        }
    }

    fn lock_available(&self, stored: &PropertyBag, stale_after: Duration) -> bool {
        let Some(locked_at) = stored.get(self.sentinel()).and_then(PropertyValue::as_datetime) else {
            return true;
        };
        let stale = (Utc::now() - locked_at)
            .to_std()
            .is_ok_and(|age| age >= stale_after);
        if stale {
            info!(table = self.name(), %locked_at, "reclaiming stale lock");
        }
        stale
    }

    /// Clears our sentinel without applying changes. Best-effort.
    async fn release_unchanged(&self, keys: &KeyPair, unlocked: PropertyBag, etag: &ETag) {
        match self
            .store()
            .put(self.name(), keys, unlocked, WriteCondition::IfMatch(etag.clone()))
            .await
        {
            Ok(WriteOutcome::Written(_)) => {}
            Ok(outcome) => {
                debug!(table = self.name(), keys = %keys, ?outcome, "lock already released or taken over");
            }
            Err(e) => warn!(table = self.name(), keys = %keys, error = %e, "failed to release lock"),
        }
    }

    fn transition(&self, keys: &KeyPair, from: LockState, to: LockState) {
        debug!(table = self.name(), keys = %keys, ?from, ?to, "lock transition");
    }
}
