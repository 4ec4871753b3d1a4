//! Retry policy: error classification plus backoff math, consolidated in one
//! place so call sites never inline their own delay computation.

use std::time::Duration;

use rand::Rng;

use crate::config::UploadConfig;
use crate::error::ClientError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl From<&UploadConfig> for RetryPolicy {
    fn from(config: &UploadConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        }
    }
}

impl RetryPolicy {
    /// Whether `err` should be retried after `attempt` completed attempts.
    pub fn should_retry(&self, err: &ClientError, attempt: u32) -> bool {
        attempt < self.max_retries && err.is_retryable()
    }

    /// Delay before retry number `attempt` (0-based): exponential backoff
    /// from the base delay with up to 25% added jitter, capped at max_delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(16));
        let capped = exp.min(self.max_delay.as_millis() as u64);
        let jitter = rand::rng().random_range(0..=capped / 4);
        Duration::from_millis(capped.saturating_add(jitter).min(self.max_delay.as_millis() as u64))
    }
}
