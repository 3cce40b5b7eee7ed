//! The unit of work an operation runs.

use async_trait::async_trait;
use tokio::sync::watch;

use super::Operation;
use crate::domain::{OperationError, OperationId};

/// Work performed by an operation once all of its dependencies are done.
///
/// Cancellation is cooperative: long-running bodies should check
/// `ctx.is_cancelled()` (or race `ctx.cancelled()`) and return early.
#[async_trait]
pub trait OperationBody: Send + Sync {
    async fn run(&self, ctx: &OperationContext) -> Result<(), OperationError>;
}

/// Handle passed to a running body.
pub struct OperationContext {
    operation: Operation,
    cancel_rx: watch::Receiver<bool>,
}

impl OperationContext {
    pub(crate) fn new(operation: Operation, cancel_rx: watch::Receiver<bool>) -> Self {
        Self {
            operation,
            cancel_rx,
        }
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation.id()
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        // sender lives as long as the operation, which `self` keeps alive
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}
