use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueSettings {
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// An event fails once its attempt count reaches this.
    pub max_attempts: u32,
    pub poll_interval_secs: u64,
    /// Entries classified in parallel per tick.
    pub concurrency: usize,
    pub normalize_interval_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backoff_base_secs: 30,
            backoff_max_secs: 3600,
            max_attempts: 5,
            poll_interval_secs: 2,
            concurrency: 2,
            normalize_interval_secs: 600,
        }
    }
}

impl QueueSettings {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(self.backoff_base_secs),
            max: Duration::from_secs(self.backoff_max_secs.max(self.backoff_base_secs)),
            max_attempts: self.max_attempts.max(1),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn normalize_interval(&self) -> Duration {
        Duration::from_secs(self.normalize_interval_secs.max(1))
    }
}

/// Exponential backoff: `base * 2^attempts`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn delay(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
        now + delay
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
