//! Error types.
//!
//! Enqueue and dependency errors are expected, recoverable conditions: the
//! boolean entry points on `QueueManager` map them to `false`.

use thiserror::Error;

use super::ids::OperationId;
use super::state::OperationState;

/// Why an operation was not accepted by a queue manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("session is no longer available")]
    SessionUnavailable,

    #[error("operation {id} is {state}, only pending operations can be enqueued")]
    NotPending {
        id: OperationId,
        state: OperationState,
    },

    #[error("operation {0} was already enqueued")]
    AlreadyEnqueued(OperationId),
}

/// Why a dependency edge was not added.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    #[error("operation {id} is {state}, dependencies can only be added while pending")]
    TargetNotPending {
        id: OperationId,
        state: OperationState,
    },

    #[error("operation {0} cannot depend on itself")]
    SelfDependency(OperationId),

    #[error("adding {dependency} to {operation} would create a cycle")]
    Cycle {
        dependency: OperationId,
        operation: OperationId,
    },
}

/// Failure of a credential refresh exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    #[error("session is no longer available")]
    SessionUnavailable,

    #[error("session has no refresh token")]
    MissingRefreshToken,

    #[error("token exchange failed: {0}")]
    Exchange(String),
}

/// Error returned by an operation body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error(transparent)]
    Refresh(#[from] RefreshError),

    #[error("dependency {0} did not succeed")]
    DependencyFailed(OperationId),

    #[error("{0}")]
    Failed(String),
}

/// Scheduler construction failure.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("a tokio runtime is required: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
