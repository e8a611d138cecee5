//! Tracker configuration.

use crate::error::{TrackerError, TrackerResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Construction-time configuration for a [`crate::DeliveryTracker`].
///
/// Durations are stored as milliseconds so the struct maps directly onto the
/// JSON config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Confirmation timeout for events that don't override it.
    pub default_timeout_ms: u64,
    /// Event table size above which eviction kicks in.
    pub max_tracked_events: usize,
    /// Sweep loop period.
    pub cleanup_interval_ms: u64,
    /// Retry budget for events that don't override it.
    pub default_max_retries: u32,
    /// First retry delay; doubles per attempt.
    pub retry_base_delay_ms: u64,
    /// Cap on the retry delay.
    pub retry_max_delay_ms: u64,
    /// Extra events evicted beyond the cap so eviction doesn't run on every insert.
    pub eviction_buffer: usize,
    /// Delay before the sweep loop resumes after a failed pass.
    pub sweep_error_backoff_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_tracked_events: 10_000,
            cleanup_interval_ms: 60_000,
            default_max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            eviction_buffer: 100,
            sweep_error_backoff_ms: 5_000,
        }
    }
}

impl TrackerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn sweep_error_backoff(&self) -> Duration {
        Duration::from_millis(self.sweep_error_backoff_ms)
    }

    /// Reject settings the tracker cannot run with.
    pub fn validate(&self) -> TrackerResult<()> {
        if self.max_tracked_events == 0 {
            return Err(TrackerError::InvalidConfig(
                "max_tracked_events must be greater than zero".to_string(),
            ));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(TrackerError::InvalidConfig(
                "cleanup_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(TrackerError::InvalidConfig(format!(
                "retry_base_delay_ms ({}) exceeds retry_max_delay_ms ({})",
                self.retry_base_delay_ms, self.retry_max_delay_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrackerConfig::default();
        assert_eq!(config.default_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_tracked_events, 10_000);
        assert_eq!(config.cleanup_interval(), Duration::from_secs(60));
        assert_eq!(config.default_max_retries, 3);
        assert_eq!(config.retry_base_delay(), Duration::from_secs(1));
        assert_eq!(config.retry_max_delay(), Duration::from_secs(30));
        assert_eq!(config.eviction_buffer, 100);
        assert_eq!(config.sweep_error_backoff(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: TrackerConfig =
            serde_json::from_str(r#"{ "max_tracked_events": 500 }"#).unwrap();
        assert_eq!(config.max_tracked_events, 500);
        assert_eq!(config.default_timeout_ms, 30_000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_cap = TrackerConfig {
            max_tracked_events: 0,
            ..Default::default()
        };
        assert!(matches!(
            zero_cap.validate(),
            Err(TrackerError::InvalidConfig(_))
        ));

        let zero_interval = TrackerConfig {
            cleanup_interval_ms: 0,
            ..Default::default()
        };
        assert!(zero_interval.validate().is_err());

        let inverted = TrackerConfig {
            retry_base_delay_ms: 60_000,
            retry_max_delay_ms: 1_000,
            ..Default::default()
        };
        let err = inverted.validate().unwrap_err();
        assert!(err.to_string().contains("retry_base_delay_ms"));
    }
}
