use std::time::Duration;

use audience_core::config::SchedulerConfig;

/// Backoff between attempts of a transiently failing job.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total submissions allowed per job, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            backoff_multiplier: config.backoff_multiplier,
            jitter: true,
        }
    }

    /// Delay before retry number `retry` (0-indexed).
    pub fn backoff_for_attempt(&self, retry: u32) -> Duration {
        let exponent = retry.min(i32::MAX as u32) as i32;
        let base_ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_backoff_ms as f64);

        let final_ms = if self.jitter {
            // deterministic spread in [0.75, 1.25)
            capped_ms * (0.75 + (retry as f64 * 0.1 % 0.5))
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms.max(0.0) as u64)
    }
}
