//! Operation lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution state of an operation.
///
/// State transitions (forward-only):
/// - Pending -> Executing -> Finished
/// - Pending -> Executing -> Cancelled (cancel requested while running)
/// - Pending -> Finished (dependency failed, body never ran)
/// - Pending -> Cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Accepted or not yet submitted; dependencies may still be added.
    Pending,

    /// Body is running on a worker.
    Executing,

    /// Body returned (or was skipped); see the operation's `Outcome`.
    Finished,

    /// Cancelled before or during execution.
    Cancelled,
}

impl OperationState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationState::Finished | OperationState::Cancelled)
    }

    /// Can dependencies still be added to an operation in this state?
    pub fn accepts_dependencies(self) -> bool {
        matches!(self, OperationState::Pending)
    }

    /// Is `next` a legal successor of `self`?
    pub fn can_transition_to(self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Pending, Executing) | (Pending, Finished) | (Pending, Cancelled)
                | (Executing, Finished) | (Executing, Cancelled)
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationState::Pending => "pending",
            OperationState::Executing => "executing",
            OperationState::Finished => "finished",
            OperationState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What an operation does. Refresh operations get dedicated bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Regular,
    Refresh,
}

/// Result of a finished operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Succeeded,
    Failed(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

/// Phase of a tracked refresh operation, as observed by a queue manager.
///
/// queued -> running -> completed | failed | cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPhase {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RefreshPhase {
    pub fn from_state(state: OperationState, outcome: Option<&Outcome>) -> Self {
        match state {
            OperationState::Pending => RefreshPhase::Queued,
            OperationState::Executing => RefreshPhase::Running,
            OperationState::Cancelled => RefreshPhase::Cancelled,
            OperationState::Finished => match outcome {
                Some(Outcome::Failed(_)) => RefreshPhase::Failed,
                _ => RefreshPhase::Completed,
            },
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RefreshPhase::Completed | RefreshPhase::Failed | RefreshPhase::Cancelled
        )
    }
}
