//! Bookkeeping shared by every queue manager: the refresh-tracking set and
//! dependency wiring under the process-wide lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{
    DependencyError, EnqueueError, ManagerId, OperationId, OperationKind, OperationState,
    RefreshPhase,
};
use crate::operation::{Operation, OperationLockGuard, lock};
use crate::session::OAuth2Session;

/// Diagnostic view of one tracked refresh operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedRefresh {
    pub id: OperationId,
    pub name: String,
    pub phase: RefreshPhase,
}

/// Refresh operations this manager has accepted and that have not reached a
/// terminal state yet. Only mutated under the process-wide lock.
struct TrackingSet {
    manager: ManagerId,
    entries: Mutex<HashMap<OperationId, Operation>>,
}

impl TrackingSet {
    fn entries(&self) -> MutexGuard<'_, HashMap<OperationId, Operation>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove a terminal refresh operation. Exactly-once by membership:
    /// repeated calls for the same operation return false.
    fn release(&self, operation: &Operation) -> bool {
        let guard = lock::lock();
        if !operation.state().is_terminal() {
            debug!(
                manager_id = %self.manager,
                operation_id = %operation.id(),
                "ignoring release of a refresh that is still running"
            );
            return false;
        }
        operation.unsubscribe_terminal_locked(&guard, self.manager);
        let removed = self.entries().remove(&operation.id()).is_some();
        if removed {
            info!(
                manager_id = %self.manager,
                operation_id = %operation.id(),
                state = %operation.state(),
                "refresh operation no longer tracked"
            );
        } else {
            debug!(
                manager_id = %self.manager,
                operation_id = %operation.id(),
                "duplicate terminal notification ignored"
            );
        }
        removed
    }
}

/// Shared state and logic for queue managers.
///
/// Concrete schedulers embed one of these and call [`QueueManagerCore::admit`]
/// before placing an operation on their execution facility.
pub struct QueueManagerCore {
    id: ManagerId,
    session: Weak<OAuth2Session>,
    tracking: Arc<TrackingSet>,
}

impl QueueManagerCore {
    pub fn new(session: &Arc<OAuth2Session>) -> Self {
        let id = ManagerId::generate();
        Self {
            id,
            session: Arc::downgrade(session),
            tracking: Arc::new(TrackingSet {
                manager: id,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> ManagerId {
        self.id
    }

    /// The session, if it is still alive.
    pub fn session(&self) -> Option<Arc<OAuth2Session>> {
        self.session.upgrade()
    }

    /// Accept `operation` for scheduling.
    ///
    /// - Refresh operations are added to the tracking set and a terminal hook
    ///   is registered that removes them again.
    /// - Regular operations get every tracked, unfinished refresh operation
    ///   as a dependency.
    ///
    /// Nothing is mutated when this returns an error.
    pub fn admit(&self, operation: &Operation) -> Result<(), EnqueueError> {
        self.admit_with(operation, |_| {})
    }

    /// Like [`QueueManagerCore::admit`], and runs `on_accept` inside the same
    /// critical section, so a scheduler can record the operation before any
    /// other thread can observe it as accepted.
    pub fn admit_with(
        &self,
        operation: &Operation,
        on_accept: impl FnOnce(&Operation),
    ) -> Result<(), EnqueueError> {
        if self.session.upgrade().is_none() {
            return Err(EnqueueError::SessionUnavailable);
        }

        let guard = lock::lock();
        let state = operation.state();
        if state != OperationState::Pending {
            return Err(EnqueueError::NotPending {
                id: operation.id(),
                state,
            });
        }
        if !operation.mark_submitted_locked(&guard) {
            return Err(EnqueueError::AlreadyEnqueued(operation.id()));
        }

        match operation.kind() {
            OperationKind::Refresh => {
                self.track_locked(&guard, operation);
                info!(
                    manager_id = %self.id,
                    operation_id = %operation.id(),
                    "refresh operation accepted"
                );
            }
            OperationKind::Regular => {
                let added = self.attach_refreshes_locked(&guard, operation);
                debug!(
                    manager_id = %self.id,
                    operation_id = %operation.id(),
                    refresh_dependencies = added,
                    "operation accepted"
                );
            }
        }
        on_accept(operation);
        Ok(())
    }

    /// Add `dependency` to `operation` under the process-wide lock.
    pub fn add_dependency(
        &self,
        dependency: &Operation,
        operation: &Operation,
    ) -> Result<(), DependencyError> {
        let guard = lock::lock();
        operation.add_dependency_locked(&guard, dependency)
    }

    /// Handle a terminal notification for `operation`.
    ///
    /// Terminal hooks call this; calling it again for the same operation is
    /// harmless and returns false.
    pub fn refresh_terminated(&self, operation: &Operation) -> bool {
        self.tracking.release(operation)
    }

    pub fn is_tracking(&self, operation: &Operation) -> bool {
        self.tracking.entries().contains_key(&operation.id())
    }

    /// Snapshot of the tracking set, oldest first.
    pub fn tracked_refresh_operations(&self) -> Vec<TrackedRefresh> {
        let mut tracked: Vec<TrackedRefresh> = self
            .tracking
            .entries()
            .values()
            .map(|op| TrackedRefresh {
                id: op.id(),
                name: op.name().to_string(),
                phase: RefreshPhase::from_state(op.state(), op.outcome().as_ref()),
            })
            .collect();
        tracked.sort_by_key(|t| t.id);
        tracked
    }

    fn track_locked(&self, guard: &OperationLockGuard, operation: &Operation) {
        let mut entries = self.tracking.entries();
        if entries.contains_key(&operation.id()) {
            return;
        }
        let tracking: Weak<TrackingSet> = Arc::downgrade(&self.tracking);
        let subscribed = operation.subscribe_terminal_locked(
            guard,
            self.id,
            Box::new(move |op| {
                if let Some(tracking) = tracking.upgrade() {
                    tracking.release(op);
                }
            }),
        );
        if subscribed {
            entries.insert(operation.id(), operation.clone());
        }
    }

    fn attach_refreshes_locked(&self, guard: &OperationLockGuard, operation: &Operation) -> usize {
        let refreshes: Vec<Operation> = self
            .tracking
            .entries()
            .values()
            .filter(|r| !r.state().is_terminal())
            .cloned()
            .collect();

        let mut added = 0;
        for refresh in &refreshes {
            match operation.add_dependency_locked(guard, refresh) {
                Ok(()) => added += 1,
                Err(err) => warn!(
                    manager_id = %self.id,
                    operation_id = %operation.id(),
                    refresh_id = %refresh.id(),
                    error = %err,
                    "could not wait on in-flight refresh"
                ),
            }
        }
        added
    }
}
