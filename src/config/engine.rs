//! Engine tuning configuration

use std::time::Duration;

use serde::Deserialize;

use super::error::ValidationError;
use crate::application::retry::Backoff;

/// Cache sizes, worker pools and retry timings.
///
/// Every field has a default, so the whole section may be omitted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Org identity cache entries
    pub cache_capacity: usize,

    /// Concurrent price creations against a test-mode ledger
    pub push_workers_test: usize,

    /// Concurrent price creations against a live ledger
    pub push_workers_live: usize,

    /// Overall budget for one usage report, retries included
    pub usage_deadline_ms: u64,

    /// First retry delay
    pub backoff_base_ms: u64,

    /// Retry delay cap
    pub backoff_max_ms: u64,

    /// First poll delay while a simulated clock advances
    pub clock_poll_base_ms: u64,

    /// Poll delay cap while a simulated clock advances
    pub clock_poll_max_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 100,
            push_workers_test: 5,
            push_workers_live: 20,
            usage_deadline_ms: 3_000,
            backoff_base_ms: 50,
            backoff_max_ms: 1_000,
            clock_poll_base_ms: 250,
            clock_poll_max_ms: 2_000,
        }
    }
}

impl EngineConfig {
    /// Worker pool size for catalog pushes.
    pub fn push_workers(&self, live: bool) -> usize {
        if live {
            self.push_workers_live
        } else {
            self.push_workers_test
        }
    }

    pub fn usage_deadline(&self) -> Duration {
        Duration::from_millis(self.usage_deadline_ms)
    }

    pub fn usage_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn clock_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.clock_poll_base_ms),
            Duration::from_millis(self.clock_poll_max_ms),
        )
    }

    /// Validate engine configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.cache_capacity == 0 {
            return Err(ValidationError::MustBePositive("ENGINE__CACHE_CAPACITY"));
        }
        if self.push_workers_test == 0 {
            return Err(ValidationError::MustBePositive("ENGINE__PUSH_WORKERS_TEST"));
        }
        if self.push_workers_live == 0 {
            return Err(ValidationError::MustBePositive("ENGINE__PUSH_WORKERS_LIVE"));
        }
        if self.usage_deadline_ms == 0 {
            return Err(ValidationError::MustBePositive("ENGINE__USAGE_DEADLINE_MS"));
        }
        if self.backoff_base_ms > self.backoff_max_ms
            || self.clock_poll_base_ms > self.clock_poll_max_ms
        {
            return Err(ValidationError::InvalidBackoff);
        }
        Ok(())
    }
}
