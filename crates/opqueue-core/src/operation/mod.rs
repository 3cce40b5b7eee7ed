//! Operations: cancellable units of asynchronous work with dependencies.
//!
//! Design:
//! - `Operation` is a cheap, cloneable handle (`Arc` inside). Equality is
//!   reference identity.
//! - The dependency list and the state live behind a per-operation mutex, but
//!   are only *mutated* while the process-wide lock (`lock::lock()`) is held.
//!   Checking "still pending?" and appending a dependency is therefore atomic
//!   with respect to every state transition in the process.
//! - Terminal hooks are keyed by subscriber and drained exactly once at the
//!   terminal transition. They run after every lock has been released.

mod body;
pub mod lock;

pub use body::{OperationBody, OperationContext};
pub use lock::OperationLockGuard;

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::domain::{
    DependencyError, ManagerId, OperationError, OperationId, OperationKind, OperationState,
    Outcome,
};

type TerminalCallback = Box<dyn FnOnce(&Operation) + Send>;

struct TerminalHook {
    subscriber: ManagerId,
    callback: TerminalCallback,
}

struct OperationCore {
    state: OperationState,
    dependencies: Vec<Operation>,
    outcome: Option<Outcome>,
    cancel_requested: bool,
    submitted: bool,
    hooks: Vec<TerminalHook>,
}

struct OperationInner {
    id: OperationId,
    kind: OperationKind,
    name: String,
    body: Arc<dyn OperationBody>,
    core: Mutex<OperationCore>,
    state_tx: watch::Sender<OperationState>,
    cancel_tx: watch::Sender<bool>,
}

/// Shared handle to one operation.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<OperationInner>,
}

/// Result of trying to move an operation from `Pending` to `Executing`.
pub(crate) enum StartDecision {
    Started,
    /// Dependencies were added after the caller last looked; wait for these.
    WaitFor(Vec<Operation>),
    /// Already cancelled or finished.
    NotPending(OperationState),
}

impl Operation {
    pub fn new(name: impl Into<String>, kind: OperationKind, body: Arc<dyn OperationBody>) -> Self {
        let (state_tx, _) = watch::channel(OperationState::Pending);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(OperationInner {
                id: OperationId::generate(),
                kind,
                name: name.into(),
                body,
                core: Mutex::new(OperationCore {
                    state: OperationState::Pending,
                    dependencies: Vec::new(),
                    outcome: None,
                    cancel_requested: false,
                    submitted: false,
                    hooks: Vec::new(),
                }),
                state_tx,
                cancel_tx,
            }),
        }
    }

    pub fn regular(name: impl Into<String>, body: Arc<dyn OperationBody>) -> Self {
        Self::new(name, OperationKind::Regular, body)
    }

    pub fn refresh(name: impl Into<String>, body: Arc<dyn OperationBody>) -> Self {
        Self::new(name, OperationKind::Refresh, body)
    }

    pub fn id(&self) -> OperationId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> OperationKind {
        self.inner.kind
    }

    pub fn is_refresh_operation(&self) -> bool {
        self.inner.kind == OperationKind::Refresh
    }

    pub fn state(&self) -> OperationState {
        self.core().state
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.core().outcome.clone()
    }

    /// Snapshot of the dependency list, in insertion order.
    pub fn dependencies(&self) -> Vec<Operation> {
        self.core().dependencies.clone()
    }

    pub fn depends_on(&self, other: &Operation) -> bool {
        self.core().dependencies.iter().any(|d| d == other)
    }

    /// True once cancellation was requested, whether or not the operation
    /// has reached a terminal state yet.
    pub fn is_cancelled(&self) -> bool {
        let core = self.core();
        core.cancel_requested || core.state == OperationState::Cancelled
    }

    /// Receiver that sees every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<OperationState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the operation is finished or cancelled.
    pub async fn wait_until_terminal(&self) -> OperationState {
        let mut rx = self.subscribe_state();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            // sender is owned by `self`, so this is unreachable in practice
            Err(_) => self.state(),
        }
    }

    /// Add `dependency` to this operation under the process-wide lock.
    pub fn add_dependency(&self, dependency: &Operation) -> Result<(), DependencyError> {
        let guard = lock::lock();
        self.add_dependency_locked(&guard, dependency)
    }

    /// Add `dependency` while the caller holds the process-wide lock.
    ///
    /// Adding an existing dependency again succeeds without duplicating it.
    pub fn add_dependency_locked(
        &self,
        _lock: &OperationLockGuard,
        dependency: &Operation,
    ) -> Result<(), DependencyError> {
        if self == dependency {
            return Err(DependencyError::SelfDependency(self.id()));
        }

        {
            let core = self.core();
            if !core.state.accepts_dependencies() {
                return Err(DependencyError::TargetNotPending {
                    id: self.id(),
                    state: core.state,
                });
            }
            if core.dependencies.iter().any(|d| d == dependency) {
                return Ok(());
            }
        }

        if dependency.reaches(self) {
            return Err(DependencyError::Cycle {
                dependency: dependency.id(),
                operation: self.id(),
            });
        }

        // State cannot have changed: transitions also need the process-wide lock.
        self.core().dependencies.push(dependency.clone());
        Ok(())
    }

    /// Does `target` appear anywhere in this operation's transitive dependencies?
    fn reaches(&self, target: &Operation) -> bool {
        let mut visited: HashSet<OperationId> = HashSet::new();
        let mut stack = vec![self.clone()];
        while let Some(node) = stack.pop() {
            if &node == target {
                return true;
            }
            if !visited.insert(node.id()) {
                continue;
            }
            stack.extend(node.dependencies());
        }
        false
    }

    /// Register a hook that runs once when this operation becomes terminal.
    ///
    /// Returns false (and drops `callback`) if `subscriber` is already
    /// registered or the operation is already terminal.
    pub(crate) fn subscribe_terminal_locked(
        &self,
        _lock: &OperationLockGuard,
        subscriber: ManagerId,
        callback: TerminalCallback,
    ) -> bool {
        let mut core = self.core();
        if core.state.is_terminal() || core.hooks.iter().any(|h| h.subscriber == subscriber) {
            return false;
        }
        core.hooks.push(TerminalHook {
            subscriber,
            callback,
        });
        true
    }

    /// Remove a previously registered hook. Returns whether one was removed.
    pub(crate) fn unsubscribe_terminal_locked(
        &self,
        _lock: &OperationLockGuard,
        subscriber: ManagerId,
    ) -> bool {
        let mut core = self.core();
        let before = core.hooks.len();
        core.hooks.retain(|h| h.subscriber != subscriber);
        core.hooks.len() != before
    }

    /// Mark the operation as handed to a queue manager. An operation is
    /// submitted at most once; returns false on the second attempt.
    pub(crate) fn mark_submitted_locked(&self, _lock: &OperationLockGuard) -> bool {
        let mut core = self.core();
        !std::mem::replace(&mut core.submitted, true)
    }

    pub(crate) fn is_subscribed(&self, subscriber: ManagerId) -> bool {
        self.core().hooks.iter().any(|h| h.subscriber == subscriber)
    }

    /// Request cancellation.
    ///
    /// A pending operation becomes `Cancelled` immediately and its terminal
    /// hooks run before this returns. An executing operation is only flagged;
    /// it becomes `Cancelled` when its body returns. Returns false if the
    /// operation was already terminal or already flagged.
    pub fn cancel(&self) -> bool {
        let hooks = {
            let _guard = lock::lock();
            let mut core = self.core();
            let state = core.state;
            match state {
                OperationState::Pending => {
                    core.cancel_requested = true;
                    self.transition(&mut core, OperationState::Cancelled)
                }
                OperationState::Executing if !core.cancel_requested => {
                    core.cancel_requested = true;
                    self.inner.cancel_tx.send_replace(true);
                    debug!(operation_id = %self.id(), "cancellation requested while executing");
                    return true;
                }
                _ => return false,
            }
        };
        self.run_hooks(hooks);
        true
    }

    /// Try to move `Pending -> Executing`.
    ///
    /// Succeeds only if every dependency is terminal. Runs under the
    /// process-wide lock so no dependency can slip in between the check and
    /// the transition.
    pub(crate) fn try_start(&self) -> StartDecision {
        let _guard = lock::lock();
        let unfinished: Vec<Operation> = self
            .dependencies()
            .into_iter()
            .filter(|d| !d.state().is_terminal())
            .collect();

        let mut core = self.core();
        if core.state != OperationState::Pending {
            return StartDecision::NotPending(core.state);
        }
        if !unfinished.is_empty() {
            return StartDecision::WaitFor(unfinished);
        }
        // hooks only fire on terminal transitions
        let hooks = self.transition(&mut core, OperationState::Executing);
        debug_assert!(hooks.is_empty());
        StartDecision::Started
    }

    /// Record the result of execution (or of skipping execution).
    ///
    /// An executing operation with a pending cancel request ends `Cancelled`.
    /// Does nothing if the operation is already terminal.
    pub(crate) fn finish(&self, outcome: Outcome) -> OperationState {
        let (state, hooks) = {
            let _guard = lock::lock();
            let mut core = self.core();
            if core.state.is_terminal() {
                return core.state;
            }
            let next = if core.state == OperationState::Executing && core.cancel_requested {
                OperationState::Cancelled
            } else {
                core.outcome = Some(outcome);
                OperationState::Finished
            };
            (next, self.transition(&mut core, next))
        };
        self.run_hooks(hooks);
        state
    }

    /// Run the body. Must only be called after a successful `try_start`.
    ///
    /// The body runs on its own task, so a panic in it is reported as a
    /// failed outcome and the caller can still `finish` the operation.
    pub(crate) async fn run_body(&self) -> Outcome {
        let ctx = OperationContext::new(self.clone(), self.inner.cancel_tx.subscribe());
        let body = Arc::clone(&self.inner.body);
        let joined = tokio::spawn(async move { body.run(&ctx).await }).await;
        match joined {
            Ok(Ok(())) => Outcome::Succeeded,
            Ok(Err(err)) => {
                warn!(operation_id = %self.id(), name = %self.name(), error = %err, "operation failed");
                Outcome::Failed(err.to_string())
            }
            Err(join_err) => {
                let reason = if join_err.is_panic() {
                    "operation panicked"
                } else {
                    "operation aborted"
                };
                error!(operation_id = %self.id(), name = %self.name(), reason, "operation body did not complete");
                Outcome::Failed(reason.to_string())
            }
        }
    }

    /// First dependency that did not succeed, if any. Only meaningful once all
    /// dependencies are terminal.
    pub(crate) fn failed_dependency(&self) -> Option<OperationError> {
        self.dependencies().into_iter().find_map(|d| {
            let succeeded = d.state() == OperationState::Finished
                && d.outcome().is_some_and(|o| o.is_success());
            (!succeeded).then(|| OperationError::DependencyFailed(d.id()))
        })
    }

    fn transition(&self, core: &mut OperationCore, next: OperationState) -> Vec<TerminalHook> {
        if !core.state.can_transition_to(next) {
            warn!(
                operation_id = %self.id(),
                from = %core.state,
                to = %next,
                "ignoring illegal state transition"
            );
            return Vec::new();
        }
        core.state = next;
        self.inner.state_tx.send_replace(next);
        if next.is_terminal() {
            std::mem::take(&mut core.hooks)
        } else {
            Vec::new()
        }
    }

    fn run_hooks(&self, hooks: Vec<TerminalHook>) {
        for hook in hooks {
            (hook.callback)(self);
        }
    }

    fn core(&self) -> MutexGuard<'_, OperationCore> {
        self.inner
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Operation {}

impl Hash for Operation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct Noop;

    #[async_trait]
    impl OperationBody for Noop {
        async fn run(&self, _ctx: &OperationContext) -> Result<(), OperationError> {
            Ok(())
        }
    }

    pub(crate) fn regular(name: &str) -> Operation {
        Operation::regular(name, Arc::new(Noop))
    }

    fn started(name: &str) -> Operation {
        let op = regular(name);
        assert!(matches!(op.try_start(), StartDecision::Started));
        op
    }

    #[test]
    fn new_operation_is_pending_without_dependencies() {
        let op = regular("list-folder");
        assert_eq!(op.state(), OperationState::Pending);
        assert!(op.dependencies().is_empty());
        assert!(!op.is_refresh_operation());
    }

    #[test]
    fn add_dependency_to_pending_operation() {
        let a = regular("a");
        let b = regular("b");

        b.add_dependency(&a).unwrap();

        assert_eq!(b.dependencies(), vec![a.clone()]);
        assert!(b.depends_on(&a));
        assert!(!a.depends_on(&b));
    }

    #[test]
    fn duplicate_dependency_is_recorded_once() {
        let a = regular("a");
        let b = regular("b");

        b.add_dependency(&a).unwrap();
        b.add_dependency(&a).unwrap();

        assert_eq!(b.dependencies().len(), 1);
    }

    #[test]
    fn dependencies_keep_insertion_order() {
        let a = regular("a");
        let b = regular("b");
        let c = regular("c");

        c.add_dependency(&b).unwrap();
        c.add_dependency(&a).unwrap();

        assert_eq!(c.dependencies(), vec![b, a]);
    }

    #[test]
    fn self_dependency_is_rejected() {
        let a = regular("a");
        assert!(matches!(
            a.add_dependency(&a),
            Err(DependencyError::SelfDependency(_))
        ));
        assert!(a.dependencies().is_empty());
    }

    #[test]
    fn cycle_is_rejected() {
        let a = regular("a");
        let b = regular("b");
        let c = regular("c");

        // c -> b -> a
        b.add_dependency(&a).unwrap();
        c.add_dependency(&b).unwrap();

        let err = a.add_dependency(&c).unwrap_err();
        assert!(matches!(err, DependencyError::Cycle { .. }));
        assert!(a.dependencies().is_empty());
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let a = regular("a");
        let b = regular("b");
        let c = regular("c");
        let d = regular("d");

        b.add_dependency(&a).unwrap();
        c.add_dependency(&a).unwrap();
        d.add_dependency(&b).unwrap();
        d.add_dependency(&c).unwrap();

        assert_eq!(d.dependencies().len(), 2);
    }

    #[rstest]
    #[case::executing(false)]
    #[case::finished(true)]
    fn add_dependency_after_start_fails(#[case] finish: bool) {
        let target = started("target");
        if finish {
            target.finish(Outcome::Succeeded);
        }
        let dep = regular("dep");

        let err = target.add_dependency(&dep).unwrap_err();

        assert!(matches!(err, DependencyError::TargetNotPending { .. }));
        assert!(target.dependencies().is_empty());
    }

    #[test]
    fn add_dependency_to_cancelled_operation_fails() {
        let target = regular("target");
        target.cancel();
        assert!(target.add_dependency(&regular("dep")).is_err());
        assert!(target.dependencies().is_empty());
    }

    #[test]
    fn try_start_waits_for_unfinished_dependencies() {
        let a = regular("a");
        let b = regular("b");
        b.add_dependency(&a).unwrap();

        match b.try_start() {
            StartDecision::WaitFor(deps) => assert_eq!(deps, vec![a.clone()]),
            _ => panic!("expected WaitFor"),
        }
        assert_eq!(b.state(), OperationState::Pending);

        a.cancel();
        assert!(matches!(b.try_start(), StartDecision::Started));
        assert_eq!(b.state(), OperationState::Executing);
    }

    #[test]
    fn cancel_pending_is_immediate() {
        let op = regular("op");
        assert!(op.cancel());
        assert_eq!(op.state(), OperationState::Cancelled);
        assert!(op.is_cancelled());
        // second cancel is a no-op
        assert!(!op.cancel());
    }

    #[test]
    fn cancel_executing_is_cooperative() {
        let op = started("op");

        assert!(op.cancel());
        assert_eq!(op.state(), OperationState::Executing);
        assert!(op.is_cancelled());
        assert!(!op.cancel());

        assert_eq!(op.finish(Outcome::Succeeded), OperationState::Cancelled);
        assert_eq!(op.outcome(), None);
    }

    #[test]
    fn finish_is_idempotent() {
        let op = started("op");
        assert_eq!(op.finish(Outcome::Succeeded), OperationState::Finished);
        assert_eq!(
            op.finish(Outcome::Failed("late".into())),
            OperationState::Finished
        );
        assert_eq!(op.outcome(), Some(Outcome::Succeeded));
    }

    #[test]
    fn terminal_hook_fires_exactly_once() {
        let op = regular("op");
        let fired = Arc::new(AtomicUsize::new(0));
        let subscriber = ManagerId::generate();

        {
            let guard = lock::lock();
            let fired = Arc::clone(&fired);
            assert!(op.subscribe_terminal_locked(
                &guard,
                subscriber,
                Box::new(move |_| {
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            ));
        }

        op.cancel();
        op.cancel();
        op.finish(Outcome::Succeeded);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!op.is_subscribed(subscriber));
    }

    #[test]
    fn subscribing_twice_with_same_key_is_a_noop() {
        let op = regular("op");
        let subscriber = ManagerId::generate();
        let guard = lock::lock();

        assert!(op.subscribe_terminal_locked(&guard, subscriber, Box::new(|_| {})));
        assert!(!op.subscribe_terminal_locked(&guard, subscriber, Box::new(|_| {})));
        assert!(op.unsubscribe_terminal_locked(&guard, subscriber));
        assert!(!op.unsubscribe_terminal_locked(&guard, subscriber));
    }

    #[test]
    fn failed_dependency_is_reported() {
        let ok = started("ok");
        ok.finish(Outcome::Succeeded);
        let bad = started("bad");
        bad.finish(Outcome::Failed("boom".into()));

        let op = regular("op");
        op.add_dependency(&ok).unwrap();
        assert_eq!(op.failed_dependency(), None);

        op.add_dependency(&bad).unwrap();
        assert_eq!(
            op.failed_dependency(),
            Some(OperationError::DependencyFailed(bad.id()))
        );
    }

    struct Panics;

    #[async_trait]
    impl OperationBody for Panics {
        async fn run(&self, _ctx: &OperationContext) -> Result<(), OperationError> {
            panic!("body blew up");
        }
    }

    #[tokio::test]
    async fn panicking_body_becomes_failed_outcome() {
        let op = Operation::regular("panics", Arc::new(Panics));
        assert!(matches!(op.try_start(), StartDecision::Started));

        let outcome = op.run_body().await;

        assert_eq!(outcome, Outcome::Failed("operation panicked".to_string()));
        assert_eq!(op.finish(outcome), OperationState::Finished);
    }

    #[tokio::test]
    async fn wait_until_terminal_resolves_on_cancel() {
        let op = regular("op");
        let waiter = tokio::spawn({
            let op = op.clone();
            async move { op.wait_until_terminal().await }
        });

        tokio::task::yield_now().await;
        op.cancel();

        assert_eq!(waiter.await.unwrap(), OperationState::Cancelled);
    }

    #[tokio::test]
    async fn concurrent_add_dependency_on_distinct_targets_all_succeed() {
        let targets: Vec<Operation> = (0..16).map(|i| regular(&format!("t{i}"))).collect();
        let deps: Vec<Operation> = (0..16).map(|i| regular(&format!("d{i}"))).collect();

        let handles: Vec<_> = targets
            .iter()
            .cloned()
            .zip(deps.iter().cloned())
            .map(|(t, d)| tokio::task::spawn_blocking(move || t.add_dependency(&d).is_ok()))
            .collect();

        for h in handles {
            assert!(h.await.unwrap());
        }
        for (t, d) in targets.iter().zip(&deps) {
            assert_eq!(t.dependencies(), vec![d.clone()]);
        }
    }

    #[test]
    fn add_dependency_racing_with_start_is_consistent() {
        for _ in 0..200 {
            let target = regular("target");
            let dep = regular("dep");

            let adder = {
                let target = target.clone();
                let dep = dep.clone();
                std::thread::spawn(move || target.add_dependency(&dep).is_ok())
            };
            let starter = {
                let target = target.clone();
                std::thread::spawn(move || matches!(target.try_start(), StartDecision::Started))
            };

            let added = adder.join().unwrap();
            let started = starter.join().unwrap();

            // Either the edge landed first (start must wait) or the start won
            // (the edge must have been refused). Never both.
            assert!(added != started);
            assert_eq!(target.dependencies().len(), usize::from(added));
        }
    }
}
