use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy for a single task. Retries happen entirely inside the
/// executor; the scheduler and write applier only ever see the final
/// outcome of a task id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_interval_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,
    /// Upper bound on the delay between attempts.
    pub max_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_ms: 500,
            backoff_factor: 2.0,
            max_interval_ms: 128_000,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Backoff delay before the retry following `attempt` (1-based).
    pub fn interval_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let ms = (self.initial_interval_ms as f64 * factor) as u64;
        Duration::from_millis(ms.min(self.max_interval_ms))
    }
}

/// Cache policy for a node's task results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Time-to-live for cached results, in seconds. `None` means no expiry.
    pub ttl_secs: Option<u64>,
}

/// A stable cache key derived by the scheduler from a task's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    /// Namespace segments (cache kind, node name).
    pub ns: Vec<String>,
    /// Stable hash of the task input.
    pub key: String,
    pub ttl_secs: Option<u64>,
}
