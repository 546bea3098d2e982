//! Engine configuration.
//!
//! Every section has a `Default` matching the values the engine was tuned
//! with; a JSON document only needs to name what it overrides.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Top-level configuration for [`Tables`](crate::Tables).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub mutation: MutationConfig,
    pub lock: LockConfig,
    pub batch: BatchConfig,
    pub blob: BlobConfig,
}

impl EngineConfig {
    /// Parses a (possibly partial) JSON configuration document.
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| EngineError::Configuration(format!("invalid engine config: {e}")))
    }
}

/// Retry bounds for the mutation protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    /// Read-mutate-save attempts in `update_with` before reporting Conflict.
    pub max_update_attempts: u32,
    /// How many times a "Modified" delete may be re-issued.
    pub max_delete_reissues: u32,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            max_update_attempts: 3,
            max_delete_reissues: 3,
        }
    }
}

/// Locked-update defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Overall acquisition timeout (ms).
    pub timeout_ms: u64,
    /// Delay between acquisition attempts (ms).
    pub retry_delay_ms: u64,
    /// Upper bound for the delay when backoff is on (ms).
    pub max_retry_delay_ms: u64,
    /// Double the delay after every lost attempt.
    pub backoff: bool,
    /// Age after which a sentinel may be reclaimed (ms).
    pub stale_after_ms: u64,
    /// Stored property holding the lock timestamp.
    pub sentinel_property: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retry_delay_ms: 250,
            max_retry_delay_ms: 2_000,
            backoff: false,
            stale_after_ms: 60_000,
            sentinel_property: "LockedAt".to_string(),
        }
    }
}

impl LockConfig {
    pub fn options(&self) -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_retry_delay: Duration::from_millis(self.max_retry_delay_ms),
            backoff: self.backoff,
            stale_after: Duration::from_millis(self.stale_after_ms),
        }
    }
}

/// Per-call locked-update settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub timeout: Duration,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub backoff: bool,
    pub stale_after: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        LockConfig::default().options()
    }
}

impl LockOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Enables exponential backoff capped at `max`.
    #[must_use]
    pub fn with_backoff(mut self, max: Duration) -> Self {
        self.backoff = true;
        self.max_retry_delay = max;
        self
    }

    #[must_use]
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub(crate) fn next_delay(&self, current: Duration) -> Duration {
        if self.backoff {
            (current * 2).min(self.max_retry_delay.max(self.retry_delay))
        } else {
            self.retry_delay
        }
    }
}

/// Bulk write ceilings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Provider payload ceiling per window (bytes).
    pub max_bytes: Option<usize>,
    /// Provider operation ceiling per window.
    pub max_count: Option<usize>,
    /// Fixed envelope cost added to every item's size.
    pub per_item_overhead: usize,
    /// Maximum windows in flight at once.
    pub parallelism: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_bytes: Some(4 * 1024 * 1024),
            max_count: Some(100),
            per_item_overhead: 64,
            parallelism: 1,
        }
    }
}

impl BatchConfig {
    pub fn limits(&self) -> BatchLimits {
        BatchLimits {
            max_bytes: self.max_bytes,
            max_count: self.max_count,
            per_item_overhead: self.per_item_overhead,
            parallelism: self.parallelism,
        }
    }
}

/// Per-call batch ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_bytes: Option<usize>,
    pub max_count: Option<usize>,
    pub per_item_overhead: usize,
    pub parallelism: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        BatchConfig::default().limits()
    }
}

impl BatchLimits {
    /// No ceilings at all; one window for the whole input.
    pub fn unbounded() -> Self {
        Self {
            max_bytes: None,
            max_count: None,
            per_item_overhead: 0,
            parallelism: 1,
        }
    }

    #[must_use]
    pub fn with_max_bytes(mut self, bytes: usize) -> Self {
        self.max_bytes = Some(bytes);
        self
    }

    #[must_use]
    pub fn with_max_count(mut self, count: usize) -> Self {
        self.max_count = Some(count);
        self
    }

    #[must_use]
    pub fn with_overhead(mut self, overhead: usize) -> Self {
        self.per_item_overhead = overhead;
        self
    }

    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub(crate) fn validate(&self) -> EngineResult<()> {
        if self.max_bytes == Some(0) || self.max_count == Some(0) {
            return Err(EngineError::Configuration(
                "batch ceilings must be greater than zero".into(),
            ));
        }
        if self.parallelism == 0 {
            return Err(EngineError::Configuration(
                "batch parallelism must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Large-value offload settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    /// Spill oversized values when a blob store is attached.
    pub enabled: bool,
    /// Largest String/Binary value kept inline (bytes).
    pub inline_limit: usize,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            inline_limit: 32 * 1024,
        }
    }
}
