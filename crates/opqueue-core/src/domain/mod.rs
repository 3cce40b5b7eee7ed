//! Domain model (IDs, states, outcomes, errors).

pub mod errors;
pub mod ids;
pub mod state;

pub use self::errors::{
    ConfigError, DependencyError, EnqueueError, OperationError, RefreshError,
    SchedulerError,
};
pub use self::ids::{ManagerId, OperationId};
pub use self::state::{OperationKind, OperationState, Outcome, RefreshPhase};
