//! Process-wide operation lock.
//!
//! Every dependency mutation, every operation state transition and every
//! refresh-tracking-set mutation happens while this lock is held. It is shared
//! by all queue managers because dependency edges can cross managers.
//!
//! Lock order: this lock first, then an operation's own state. The lock is
//! never held across an `.await`.

use std::sync::{Mutex, MutexGuard, PoisonError};

static OPERATION_LOCK: Mutex<()> = Mutex::new(());

/// Proof that the process-wide lock is held.
///
/// Functions that must only run inside the critical section take
/// `&OperationLockGuard`, so forgetting the lock does not compile.
pub struct OperationLockGuard {
    _guard: MutexGuard<'static, ()>,
}

/// Acquire the process-wide lock.
///
/// The lock guards `()`, so a poisoned lock carries no broken data and is
/// recovered.
pub fn lock() -> OperationLockGuard {
    let guard = OPERATION_LOCK
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    OperationLockGuard { _guard: guard }
}
