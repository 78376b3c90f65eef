//! Reconciliation policy knobs, read from `EDGEHUB_*` env vars.

use std::num::NonZeroU32;
use std::time::Duration;

const DEFAULT_MAX_UPDATE_ATTEMPTS: u32 = 16;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 30_000;

/// Knobs for the reconciliation policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Ceiling on `Update` calls per resource while conflicts persist.
    /// `None` retries for as long as the store keeps reporting conflicts.
    pub max_update_attempts: Option<NonZeroU32>,
    /// Deadline for a single store call. A timed-out call is a failure and is
    /// not retried.
    pub store_timeout: Option<Duration>,
    /// Pause between a conflict and the re-fetch that follows it.
    pub conflict_backoff: Duration,
    /// Entries of one set in flight at once. 1 means sequential.
    pub concurrency: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_update_attempts: NonZeroU32::new(DEFAULT_MAX_UPDATE_ATTEMPTS),
            store_timeout: Some(Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS)),
            conflict_backoff: Duration::ZERO,
            concurrency: 1,
        }
    }
}

impl ProcessorConfig {
    /// Defaults overridden by `EDGEHUB_*` environment variables.
    ///
    /// - `EDGEHUB_MAX_UPDATE_ATTEMPTS` (0 = unbounded)
    /// - `EDGEHUB_STORE_TIMEOUT_MS` (0 = no deadline)
    /// - `EDGEHUB_CONFLICT_BACKOFF_MS`
    /// - `EDGEHUB_CONCURRENCY`
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let num = |k: &str| get(k).and_then(|s| s.trim().parse::<u64>().ok());
        Self {
            max_update_attempts: match num("EDGEHUB_MAX_UPDATE_ATTEMPTS") {
                Some(n) => NonZeroU32::new(n.min(u32::MAX as u64) as u32),
                None => d.max_update_attempts,
            },
            store_timeout: match num("EDGEHUB_STORE_TIMEOUT_MS") {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => d.store_timeout,
            },
            conflict_backoff: num("EDGEHUB_CONFLICT_BACKOFF_MS").map(Duration::from_millis).unwrap_or(d.conflict_backoff),
            concurrency: num("EDGEHUB_CONCURRENCY").map(|n| (n as usize).max(1)).unwrap_or(d.concurrency),
        }
    }

    pub fn with_max_update_attempts(mut self, max: Option<u32>) -> Self {
        self.max_update_attempts = max.and_then(NonZeroU32::new);
        self
    }

    pub fn with_store_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_conflict_backoff(mut self, backoff: Duration) -> Self {
        self.conflict_backoff = backoff;
        self
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }
}
