//! Queue manager contract.
//!
//! A queue manager accepts operations, wires refresh operations in as
//! dependencies of regular ones, and places accepted operations on an
//! execution facility. The shared bookkeeping lives in [`QueueManagerCore`];
//! implementations embed it and call `admit` explicitly.

mod base;

pub use self::base::{QueueManagerCore, TrackedRefresh};

use tracing::{debug, warn};

use crate::domain::{DependencyError, EnqueueError};
use crate::operation::Operation;

/// Queue manager port (interface).
///
/// Implementations must schedule every operation they accept; returning
/// `Ok(())` from `try_enqueue` is a promise that the operation will run (or be
/// cancelled).
pub trait QueueManager: Send + Sync {
    fn core(&self) -> &QueueManagerCore;

    /// Accept and schedule `operation`.
    fn try_enqueue(&self, operation: Operation) -> Result<(), EnqueueError>;

    /// Cancel every operation this manager has scheduled and not yet finished.
    fn cancel_all_operations(&self);

    /// Boolean form of [`QueueManager::try_enqueue`].
    fn enqueue(&self, operation: Operation) -> bool {
        let id = operation.id();
        match self.try_enqueue(operation) {
            Ok(()) => true,
            Err(err) => {
                warn!(manager_id = %self.core().id(), operation_id = %id, error = %err, "enqueue rejected");
                false
            }
        }
    }

    fn try_add_dependency(
        &self,
        dependency: &Operation,
        operation: &Operation,
    ) -> Result<(), DependencyError> {
        self.core().add_dependency(dependency, operation)
    }

    /// Boolean form of [`QueueManager::try_add_dependency`].
    fn add_dependency(&self, dependency: &Operation, operation: &Operation) -> bool {
        match self.try_add_dependency(dependency, operation) {
            Ok(()) => true,
            Err(err) => {
                debug!(
                    operation_id = %operation.id(),
                    dependency_id = %dependency.id(),
                    error = %err,
                    "dependency not added"
                );
                false
            }
        }
    }

    fn tracked_refresh_operations(&self) -> Vec<TrackedRefresh> {
        self.core().tracked_refresh_operations()
    }
}
