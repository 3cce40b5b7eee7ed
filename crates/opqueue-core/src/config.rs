//! Queue and session configuration.

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::domain::ConfigError;

/// What happens to an operation whose dependency failed or was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyFailurePolicy {
    /// Finish the dependent as failed without running it. A request that
    /// waited on a failed refresh would otherwise go out with a stale token.
    #[default]
    FailDependents,

    /// Run the dependent anyway.
    RunAnyway,
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Upper bound on operations executing at the same time (>= 1).
    pub max_concurrent_operations: usize,

    pub dependency_failure_policy: DependencyFailurePolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: 4,
            dependency_failure_policy: DependencyFailurePolicy::default(),
        }
    }
}

impl QueueConfig {
    /// One operation at a time.
    pub fn serial() -> Self {
        Self {
            max_concurrent_operations: 1,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_operations == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_operations must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_operations > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid(format!(
                "max_concurrent_operations must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(())
    }
}

/// Largest accepted expiry buffer (one day).
pub const MAX_EXPIRY_BUFFER_SECS: i64 = 24 * 60 * 60;

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Treat the access token as expired this many seconds early, so it does
    /// not expire mid-request.
    pub expiry_buffer_secs: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry_buffer_secs: 30,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0..=MAX_EXPIRY_BUFFER_SECS).contains(&self.expiry_buffer_secs) {
            return Err(ConfigError::Invalid(format!(
                "expiry_buffer_secs must be between 0 and {MAX_EXPIRY_BUFFER_SECS}"
            )));
        }
        Ok(())
    }

    /// The buffer as a duration, clamped to the accepted range.
    pub fn expiry_buffer(&self) -> chrono::Duration {
        let secs = self.expiry_buffer_secs.clamp(0, MAX_EXPIRY_BUFFER_SECS);
        chrono::Duration::try_seconds(secs).unwrap_or_else(chrono::Duration::zero)
    }
}
