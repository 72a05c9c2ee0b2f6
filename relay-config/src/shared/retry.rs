use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for calls made against the key-value store.
///
/// The delay before retry `n` (zero based) is `initial_delay_ms * backoff_factor^n`, capped at
/// `max_delay_ms`. The defaults give the 1s, 2s, 4s progression used for queue operations.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay, in milliseconds, before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound for a single delay.
    pub max_delay_ms: u64,
    /// Exponential backoff multiplier applied after each attempt.
    pub backoff_factor: f32,
}

impl RetryConfig {
    /// Returns the delay to wait after the failed attempt `attempt` (zero based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = f64::from(self.backoff_factor).powi(attempt as i32);
        let delay_ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);

        Duration::from_millis(delay_ms as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_delays_double_each_attempt() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn delay_is_capped() {
        let retry = RetryConfig {
            max_delay_ms: 3_000,
            ..RetryConfig::default()
        };
        assert_eq!(retry.delay_for_attempt(5), Duration::from_secs(3));
    }
}
