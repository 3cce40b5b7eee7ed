//! opqueue-core
//!
//! Operation queue that keeps OAuth2 credential refreshes serialized and
//! makes API operations wait for in-flight refreshes.
//!
//! # Modules
//! - **domain**: ids, operation states, outcomes, errors
//! - **ports**: Clock, TokenExchange (the HTTP exchange lives outside this crate)
//! - **operation**: `Operation` handle, `OperationBody`, process-wide lock
//! - **session**: `OAuth2Session`, credentials, refresh operations
//! - **manager**: `QueueManager` trait and shared bookkeeping (`QueueManagerCore`)
//! - **scheduler**: `WorkerQueueManager`, the tokio worker-pool implementation
//! - **config**: `QueueConfig`, `SessionConfig`

pub mod config;
pub mod domain;
pub mod manager;
pub mod operation;
pub mod ports;
pub mod scheduler;
pub mod session;

pub use config::{DependencyFailurePolicy, QueueConfig, SessionConfig};
pub use domain::{OperationKind, OperationState, Outcome, RefreshPhase};
pub use manager::{QueueManager, QueueManagerCore, TrackedRefresh};
pub use operation::{Operation, OperationBody, OperationContext};
pub use scheduler::WorkerQueueManager;
pub use session::{Credential, OAuth2Session, SessionEvent};
