//! Orchestration settings.
//!
//! Durations are stored as whole seconds so the struct deserializes directly
//! from the server's flat configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Retry budgets, poll cadence and retention for the job layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Retention of results and idempotency records.
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,

    /// Retries granted to an extraction task on transient errors.
    #[serde(default = "default_task_max_retries")]
    pub task_max_retries: u32,

    #[serde(default = "default_task_retry_delay_secs")]
    pub task_retry_delay_secs: u64,

    /// Delay between batch completion checks.
    #[serde(default = "default_batch_poll_interval_secs")]
    pub batch_poll_interval_secs: u64,

    /// Checks before a batch is finalized with partial results.
    #[serde(default = "default_batch_poll_budget")]
    pub batch_poll_budget: u32,

    /// Delay before the first batch check, so children can register.
    #[serde(default = "default_batch_initial_delay_secs")]
    pub batch_initial_delay_secs: u64,
}

fn default_result_ttl_secs() -> u64 {
    86_400
}

fn default_task_max_retries() -> u32 {
    3
}

fn default_task_retry_delay_secs() -> u64 {
    60
}

fn default_batch_poll_interval_secs() -> u64 {
    5
}

fn default_batch_poll_budget() -> u32 {
    720
}

fn default_batch_initial_delay_secs() -> u64 {
    2
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            result_ttl_secs: default_result_ttl_secs(),
            task_max_retries: default_task_max_retries(),
            task_retry_delay_secs: default_task_retry_delay_secs(),
            batch_poll_interval_secs: default_batch_poll_interval_secs(),
            batch_poll_budget: default_batch_poll_budget(),
            batch_initial_delay_secs: default_batch_initial_delay_secs(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.result_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "result_ttl_secs must be greater than 0".into(),
            ));
        }
        if self.batch_poll_budget == 0 {
            return Err(ConfigError::Invalid(
                "batch_poll_budget must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    pub fn task_retry_delay(&self) -> Duration {
        Duration::from_secs(self.task_retry_delay_secs)
    }

    pub fn batch_poll_interval(&self) -> Duration {
        Duration::from_secs(self.batch_poll_interval_secs)
    }

    pub fn batch_initial_delay(&self) -> Duration {
        Duration::from_secs(self.batch_initial_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.result_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.task_max_retries, 3);
        assert_eq!(config.batch_poll_interval(), Duration::from_secs(5));
        assert_eq!(config.batch_poll_budget, 720);
        assert_eq!(config.batch_initial_delay(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"batch_poll_budget": 10}"#).unwrap();
        assert_eq!(config.batch_poll_budget, 10);
        assert_eq!(config.task_retry_delay_secs, 60);
    }

    #[test]
    fn zero_budget_is_rejected() {
        let config = OrchestratorConfig {
            batch_poll_budget: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
