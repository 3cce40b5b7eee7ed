//! Worker-pool scheduler.
//!
//! Every accepted operation gets its own tokio task which
//! 1. waits until all dependencies are terminal (or the operation is cancelled),
//! 2. applies the dependency failure policy,
//! 3. takes a worker permit (refresh operations also take the single refresh
//!    permit, so refreshes never overlap),
//! 4. moves `Pending -> Executing` under the process-wide lock, re-checking
//!    for dependencies that were added meanwhile,
//! 5. runs the body and records the outcome.
//!
//! Waiting is done on watch channels, never by polling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore, SemaphorePermit};
use tracing::{debug, info};

use crate::config::{DependencyFailurePolicy, QueueConfig};
use crate::domain::{EnqueueError, OperationId, Outcome, SchedulerError};
use crate::manager::{QueueManager, QueueManagerCore};
use crate::operation::{Operation, StartDecision, lock};
use crate::session::OAuth2Session;

struct SchedulerShared {
    workers: Semaphore,
    refresh_lane: Semaphore,
    policy: DependencyFailurePolicy,
    operations: Mutex<HashMap<OperationId, Operation>>,
    idle: Notify,
}

impl SchedulerShared {
    fn operations(&self) -> MutexGuard<'_, HashMap<OperationId, Operation>> {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn drive(&self, operation: Operation) {
        self.run_to_completion(&operation).await;
        let now_idle = {
            let mut ops = self.operations();
            ops.remove(&operation.id());
            ops.is_empty()
        };
        if now_idle {
            self.idle.notify_waiters();
        }
    }

    async fn run_to_completion(&self, operation: &Operation) {
        loop {
            let unfinished: Vec<Operation> = operation
                .dependencies()
                .into_iter()
                .filter(|d| !d.state().is_terminal())
                .collect();
            if !unfinished.is_empty() {
                tokio::select! {
                    _ = wait_all(&unfinished) => {}
                    _ = operation.wait_until_terminal() => {}
                }
                continue;
            }
            if operation.state().is_terminal() {
                return;
            }

            if self.policy == DependencyFailurePolicy::FailDependents
                && let Some(err) = operation.failed_dependency()
            {
                info!(operation_id = %operation.id(), error = %err, "skipping operation");
                operation.finish(Outcome::Failed(err.to_string()));
                return;
            }

            let _refresh_permit = if operation.is_refresh_operation() {
                match acquire(&self.refresh_lane, operation).await {
                    Some(permit) => Some(permit),
                    None => return,
                }
            } else {
                None
            };
            let Some(_worker_permit) = acquire(&self.workers, operation).await else {
                return;
            };

            match operation.try_start() {
                StartDecision::Started => {
                    debug!(operation_id = %operation.id(), name = %operation.name(), "executing");
                    let outcome = operation.run_body().await;
                    let state = operation.finish(outcome);
                    debug!(operation_id = %operation.id(), %state, "done");
                    return;
                }
                // a dependency slipped in while we waited for a permit
                StartDecision::WaitFor(_) => continue,
                StartDecision::NotPending(_) => return,
            }
        }
    }
}

async fn wait_all(operations: &[Operation]) {
    for op in operations {
        op.wait_until_terminal().await;
    }
}

/// Take a permit, or give up if the operation becomes terminal first.
async fn acquire<'a>(semaphore: &'a Semaphore, operation: &Operation) -> Option<SemaphorePermit<'a>> {
    tokio::select! {
        permit = semaphore.acquire() => match permit {
            Ok(permit) => Some(permit),
            Err(_) => {
                operation.finish(Outcome::Failed("scheduler closed".to_string()));
                None
            }
        },
        _ = operation.wait_until_terminal() => None,
    }
}

/// Queue manager backed by a bounded pool of tokio tasks.
pub struct WorkerQueueManager {
    core: QueueManagerCore,
    config: QueueConfig,
    runtime: Handle,
    shared: Arc<SchedulerShared>,
}

impl WorkerQueueManager {
    /// Build a manager on the current tokio runtime.
    pub fn new(session: &Arc<OAuth2Session>, config: QueueConfig) -> Result<Self, SchedulerError> {
        Self::with_runtime(session, config, Handle::try_current()?)
    }

    /// Single worker: operations run one at a time in dependency order.
    pub fn serial(session: &Arc<OAuth2Session>) -> Result<Self, SchedulerError> {
        Self::new(session, QueueConfig::serial())
    }

    pub fn with_runtime(
        session: &Arc<OAuth2Session>,
        config: QueueConfig,
        runtime: Handle,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let shared = Arc::new(SchedulerShared {
            workers: Semaphore::new(config.max_concurrent_operations),
            refresh_lane: Semaphore::new(1),
            policy: config.dependency_failure_policy,
            operations: Mutex::new(HashMap::new()),
            idle: Notify::new(),
        });
        Ok(Self {
            core: QueueManagerCore::new(session),
            config,
            runtime,
            shared,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Number of scheduled operations that have not finished yet.
    pub fn operation_count(&self) -> usize {
        self.shared.operations().len()
    }

    /// Wait until every scheduled operation has finished or been cancelled.
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.operations().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl QueueManager for WorkerQueueManager {
    fn core(&self) -> &QueueManagerCore {
        &self.core
    }

    fn try_enqueue(&self, operation: Operation) -> Result<(), EnqueueError> {
        self.core.admit_with(&operation, |op| {
            self.shared.operations().insert(op.id(), op.clone());
        })?;

        let shared = Arc::clone(&self.shared);
        self.runtime.spawn(async move {
            shared.drive(operation).await;
        });
        Ok(())
    }

    fn cancel_all_operations(&self) {
        // same critical section as admission: nothing accepted is missed
        let operations: Vec<Operation> = {
            let _guard = lock::lock();
            self.shared.operations().values().cloned().collect()
        };
        let cancelled = operations.iter().filter(|op| op.cancel()).count();
        info!(
            manager_id = %self.core.id(),
            cancelled,
            known = operations.len(),
            "cancelled all operations"
        );
    }
}
