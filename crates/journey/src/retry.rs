//! Retry budget and exponential backoff for retryable step failures.

use std::time::Duration;

use rand::Rng;
use salesflow_core::config::RetryConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed for one step, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Spread each delay uniformly over ±25%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff_ms: cfg.initial_backoff_ms,
            max_backoff_ms: cfg.max_backoff_ms,
            backoff_multiplier: cfg.backoff_multiplier,
            jitter: cfg.jitter,
        }
    }
}

impl RetryPolicy {
    /// Same policy with a per-journey attempt budget.
    pub fn with_max_attempts(&self, max_attempts: Option<u32>) -> Self {
        let mut policy = self.clone();
        if let Some(max) = max_attempts {
            policy.max_attempts = max.max(1);
        }
        policy
    }

    /// Whether another attempt is allowed after `failures` consecutive
    /// retryable failures of the same step.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }

    /// Delay before the retry that follows failure number `failures` (1-based).
    pub fn backoff_for_attempt(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let base_ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_backoff_ms as f64);

        let final_ms = if self.jitter {
            capped_ms * rand::thread_rng().gen_range(0.75..=1.25)
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms as u64)
    }
}
