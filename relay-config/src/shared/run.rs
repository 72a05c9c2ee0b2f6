use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::shared::ValidationError;

/// Options of a single supervisor invocation.
///
/// Every field has a default so a partial configuration (or none at all) is valid. Field names
/// accept both snake_case and the camelCase spelling used by schedulers that pass the options
/// as a JSON payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Number of records handed to the sink in one delivery batch. A window with more matches
    /// is delivered in several batches.
    #[serde(alias = "batchSize")]
    pub batch_size: usize,
    /// Longest time window, in minutes, a single cycle may scan for a table.
    #[serde(alias = "queryInterval")]
    pub query_interval_minutes: u64,
    /// Attempts per delivery call when the failure is retryable.
    #[serde(alias = "maxRetries")]
    pub max_retries: u32,
    /// Number of cycles between two connectivity checks inside a run. Zero disables them.
    #[serde(alias = "healthCheckInterval")]
    pub health_check_interval: u64,
    /// Whether the run keeps going after a table fails.
    #[serde(alias = "restartOnError")]
    pub restart_on_error: bool,
    /// Pause, in milliseconds, after a claim that returned no table.
    #[serde(alias = "queuePollInterval")]
    pub queue_poll_interval_ms: u64,
    /// Maximum number of cycles in one run.
    #[serde(alias = "maxCycles")]
    pub max_cycles: u64,
    /// Wall-clock budget of one run.
    #[serde(alias = "maxExecutionMinutes")]
    pub max_execution_minutes: u64,
    /// Trailing margin kept free at the end of the run for the final queue write.
    #[serde(alias = "safetyBufferSecs")]
    pub safety_buffer_secs: u64,
    /// Number of consecutive empty claims after which the run stops.
    #[serde(alias = "maxConsecutiveEmptyCycles")]
    pub max_consecutive_empty_cycles: u32,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_cycles == 0 {
            return Err(ValidationError::MaxCyclesZero);
        }

        if self.max_execution_minutes == 0 {
            return Err(ValidationError::MaxExecutionMinutesZero);
        }

        if self.query_interval_minutes == 0 {
            return Err(ValidationError::QueryIntervalZero);
        }

        let window_secs = self.max_execution_minutes * 60;
        if self.safety_buffer_secs >= window_secs {
            return Err(ValidationError::SafetyBufferTooLarge {
                buffer_secs: self.safety_buffer_secs,
                window_secs,
            });
        }

        Ok(())
    }

    pub fn max_execution(&self) -> Duration {
        Duration::from_secs(self.max_execution_minutes * 60)
    }

    pub fn safety_buffer(&self) -> Duration {
        Duration::from_secs(self.safety_buffer_secs)
    }

    pub fn query_interval(&self) -> Duration {
        Duration::from_secs(self.query_interval_minutes * 60)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            query_interval_minutes: 60,
            max_retries: 3,
            health_check_interval: 25,
            restart_on_error: true,
            queue_poll_interval_ms: 0,
            max_cycles: 1_000,
            max_execution_minutes: 10,
            safety_buffer_secs: 60,
            max_consecutive_empty_cycles: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omitted_options_take_defaults() {
        let config: RunConfig = serde_json::from_str(r#"{"maxCycles": 5}"#).unwrap();
        assert_eq!(config.max_cycles, 5);
        assert_eq!(config.max_execution_minutes, 10);
        assert!(config.restart_on_error);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn buffer_larger_than_window_is_rejected() {
        let config = RunConfig {
            max_execution_minutes: 1,
            safety_buffer_secs: 60,
            ..RunConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ValidationError::SafetyBufferTooLarge {
                buffer_secs: 60,
                window_secs: 60
            })
        );
    }

    #[test]
    fn zero_cycles_is_rejected() {
        let config = RunConfig {
            max_cycles: 0,
            ..RunConfig::default()
        };
        assert_eq!(config.validate(), Err(ValidationError::MaxCyclesZero));
    }
}
