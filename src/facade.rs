//! The speculative facade: dispatch, reconciliation, commit, retry.
//!
//! [`SpecFacade`] is the application's entry point. `invoke` registers a root
//! call, hands the request to the transport, and immediately runs the bound
//! continuation against a guessed reply; `invoke_child` (or
//! [`SpecContext::call`] from inside a run) does the same one level down the
//! call tree. When the transport resolves, the real reply is reconciled
//! against the guess: a match feeds the commit cascade, a mismatch aborts the
//! discredited subtree and hands the chain to the retry coordinator.
//!
//! # Locking
//!
//! Each call tree has one `parking_lot::Mutex`; independent trees share
//! nothing but the facade-wide registry and counters. The tree lock is held
//! only for ledger/entry mutation, never across a continuation's `run` or a
//! transport `send`. Reply delivery may happen on any thread; a reply that
//! beats the speculative run to the record is parked and reconciled when the
//! run finishes.

use crate::config::EngineConfig;
use crate::continuation::Continuation;
use crate::error::{Error, ErrorKind, Result, TransportError};
use crate::ledger::{LedgerStats, SpecLedger};
use crate::record::{AbortReason, CallRecord, CallState, SideEffect};
use crate::retry::{RetryCoordinator, RetryVerdict};
use crate::stats::{SpecStats, StatsSnapshot};
use crate::transport::{ReplySink, Transport};
use crate::types::{CallId, Endpoint, FacadeId, SystemClock, TimeSource};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Per-call engine-side state that is not ledger bookkeeping.
struct CallEntry<Q, V> {
    /// The logical call this entry descends from; stable across retries.
    original: CallId,
    /// The continuation. `None` while a run is in flight on some thread.
    continuation: Option<Box<dyn Continuation<Q, V>>>,
}

/// One call tree: a ledger plus its engine-side entries and result cell.
struct Tree<Q, V> {
    inner: Mutex<TreeInner<Q, V>>,
    /// Signalled when the final result lands in the cell.
    settled: Condvar,
}

struct TreeInner<Q, V> {
    ledger: SpecLedger<V>,
    entries: BTreeMap<CallId, CallEntry<Q, V>>,
    /// The currently active root call; replaced on a root retry.
    root: Option<CallId>,
    /// True once the final result (or failure) has been delivered.
    delivered: bool,
    result: Option<Result<V>>,
}

impl<Q, V> Tree<Q, V> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(TreeInner {
                ledger: SpecLedger::new(),
                entries: BTreeMap::new(),
                root: None,
                delivered: false,
                result: None,
            }),
            settled: Condvar::new(),
        }
    }
}

/// Shared engine state behind every handle and reply sink.
struct Core<Q, V> {
    facade: FacadeId,
    transport: Arc<dyn Transport<Q, V>>,
    config: EngineConfig<V>,
    clock: Arc<dyn TimeSource>,
    stats: SpecStats,
    retry: RetryCoordinator,
    /// Maps every live call to its tree, for parent lookup and timeouts.
    registry: Mutex<HashMap<CallId, Arc<Tree<Q, V>>>>,
}

/// What to do after a reply has been recorded under the tree lock.
enum AfterReply<V> {
    Stale,
    Parked,
    Commit,
    Retry(V),
    TreeFail(TransportError),
}

/// What to do after a run's outcome has been recorded under the tree lock.
enum AfterRun<V> {
    Nothing,
    Reply(core::result::Result<V, TransportError>),
    Commit,
    Retry(V),
    Fail(Error),
}

impl<Q, V> Core<Q, V>
where
    Q: Send + 'static,
    V: Clone + PartialEq + Send + 'static,
{
    /// Registers a call, dispatches it, and runs its continuation against
    /// the guess. The tree lock is released before both the send and the run.
    fn start_call(
        core: &Arc<Self>,
        tree: &Arc<Tree<Q, V>>,
        parent: Option<CallId>,
        target: Endpoint,
        request: Q,
        mut continuation: Box<dyn Continuation<Q, V>>,
        guess: V,
    ) -> Result<CallId> {
        continuation.bind(core.facade)?;
        let call = CallId::allocate();
        let now = core.clock.now();
        let deadline = core
            .config
            .call_timeout
            .map(|nanos| now.saturating_add_nanos(nanos));
        {
            let mut inner = tree.inner.lock();
            if let Some(p) = parent {
                inner.ledger.record_child(p, call)?;
            }
            inner.ledger.create(CallRecord::speculative(
                call,
                target.clone(),
                parent,
                guess.clone(),
                now,
                deadline,
            ));
            inner.entries.insert(
                call,
                CallEntry {
                    original: call,
                    continuation: Some(continuation),
                },
            );
            if parent.is_none() {
                inner.root = Some(call);
            }
        }
        core.registry.lock().insert(call, tree.clone());
        core.stats.record_prediction();
        tracing::debug!(call = %call, target = %target, parent = ?parent, "speculative dispatch");

        let sink = {
            let core = core.clone();
            let tree = tree.clone();
            ReplySink::new(call, move |reply| Self::on_reply(&core, &tree, call, reply))
        };
        core.transport.send(&target, request, sink);

        Self::run_attempt(core, tree, call, guess);
        Ok(call)
    }

    /// Runs the call's continuation against `value` outside the tree lock.
    fn run_attempt(core: &Arc<Self>, tree: &Arc<Tree<Q, V>>, call: CallId, value: V) {
        let continuation = tree
            .inner
            .lock()
            .entries
            .get_mut(&call)
            .and_then(|entry| entry.continuation.take());
        let Some(mut continuation) = continuation else {
            // Entry already cleaned up; the call died before its run started.
            return;
        };
        let span = tracing::debug_span!("speculative_run", call = %call);
        let outcome = {
            let _guard = span.enter();
            let mut cx = SpecContext { core, tree, call };
            continuation.run(&mut cx, value)
        };
        Self::finish_run(core, tree, call, continuation, outcome);
    }

    /// Records a run's outcome and follows up on anything that was waiting
    /// for the run to finish (a parked reply, or a replacement's settlement).
    fn finish_run(
        core: &Arc<Self>,
        tree: &Arc<Tree<Q, V>>,
        call: CallId,
        continuation: Box<dyn Continuation<Q, V>>,
        outcome: Result<V>,
    ) {
        let after = {
            let mut inner = tree.inner.lock();
            if let Some(entry) = inner.entries.get_mut(&call) {
                entry.continuation = Some(continuation);
            }
            match inner.ledger.get_mut(call) {
                Some(record) if record.is_pending() => {
                    let mut fatal = None;
                    match outcome {
                        Ok(value) => {
                            record.provisional = Some(value);
                            record.effects.push(SideEffect::ProvisionalResult);
                        }
                        Err(err) if err.is_speculation_failure() => {
                            record.run_failed = true;
                        }
                        Err(err) => {
                            record.run_failed = true;
                            fatal = Some(err.with_call(call));
                        }
                    }
                    record.run_complete = true;
                    if let Some(err) = fatal {
                        AfterRun::Fail(err)
                    } else if let Some(parked) = record.parked_reply.take() {
                        AfterRun::Reply(parked)
                    } else if record.matched && record.run_failed {
                        let real = record
                            .real
                            .clone()
                            .expect("replacement call has a real value");
                        AfterRun::Retry(real)
                    } else if record.matched {
                        AfterRun::Commit
                    } else {
                        AfterRun::Nothing
                    }
                }
                // The call went terminal while its run was executing (an
                // ancestor aborted it); the outcome is discarded with it.
                _ => AfterRun::Nothing,
            }
        };
        match after {
            AfterRun::Nothing => {}
            AfterRun::Reply(reply) => Self::on_reply(core, tree, call, reply),
            AfterRun::Commit => Self::try_commit(core, tree),
            AfterRun::Retry(real) => Self::abort_and_retry(core, tree, call, real),
            AfterRun::Fail(err) => {
                Self::fail_tree(core, tree, err, AbortReason::Cascade);
            }
        }
    }

    /// Reconciles a transport resolution against the recorded guess.
    fn on_reply(
        core: &Arc<Self>,
        tree: &Arc<Tree<Q, V>>,
        call: CallId,
        reply: core::result::Result<V, TransportError>,
    ) {
        let after = {
            let mut inner = tree.inner.lock();
            match inner.ledger.get_mut(call) {
                None => AfterReply::Stale,
                Some(record) if !record.is_pending() => AfterReply::Stale,
                Some(record) if !record.run_complete => {
                    record.parked_reply = Some(reply);
                    AfterReply::Parked
                }
                Some(record) => match reply {
                    Err(err) => AfterReply::TreeFail(err),
                    Ok(real) => {
                        let confirmed = match record.guess.as_ref() {
                            Some(guess) => core.config.matcher.matches(guess, &real),
                            None => true,
                        };
                        record.real = Some(real.clone());
                        if confirmed && !record.run_failed {
                            record.matched = true;
                            AfterReply::Commit
                        } else {
                            AfterReply::Retry(real)
                        }
                    }
                },
            }
        };
        match after {
            AfterReply::Stale => {
                core.stats.record_stale_reply();
                tracing::trace!(call = %call, "stale reply discarded");
            }
            AfterReply::Parked => {
                tracing::trace!(call = %call, "reply parked until run completes");
            }
            AfterReply::Commit => {
                core.stats.record_correct();
                tracing::debug!(call = %call, "guess confirmed");
                Self::try_commit(core, tree);
            }
            AfterReply::Retry(real) => {
                core.stats.record_incorrect();
                tracing::debug!(call = %call, "guess discredited");
                Self::abort_and_retry(core, tree, call, real);
            }
            AfterReply::TreeFail(err) => {
                core.stats.record_transport_failure();
                tracing::warn!(call = %call, error = %err, "transport failure");
                Self::fail_tree(core, tree, Error::transport(call, err), AbortReason::Transport);
            }
        }
    }

    /// Aborts the discredited subtree and re-executes the chain with the
    /// authoritative value as a fresh replacement call.
    fn abort_and_retry(core: &Arc<Self>, tree: &Arc<Tree<Q, V>>, call: CallId, real: V) {
        let replacement;
        {
            let mut inner = tree.inner.lock();
            let Some(record) = inner.ledger.get(call) else {
                return;
            };
            if !record.is_pending() {
                return;
            }
            let reason = if record.run_failed {
                AbortReason::RunFailed
            } else {
                AbortReason::Mismatch
            };
            let parent = record.parent;
            let target = record.target.clone();
            let attempt = record.attempt + 1;
            let now = core.clock.now();

            let aborted = inner.ledger.mark_aborted(call, now, reason);
            tracing::debug!(
                call = %call,
                reason = %reason,
                aborted = aborted.len(),
                attempt,
                "subtree aborted"
            );
            {
                let mut registry = core.registry.lock();
                for id in &aborted {
                    registry.remove(id);
                    if *id != call {
                        inner.entries.remove(id);
                    }
                }
            }

            let original = inner.entries.get(&call).map_or(call, |e| e.original);
            if core.retry.admit(attempt) == RetryVerdict::Exhausted {
                inner.entries.remove(&call);
                drop(inner);
                tracing::warn!(call = %call, attempt, "retry bound exceeded");
                Self::fail_tree(
                    core,
                    tree,
                    Error::retry_exhausted(original),
                    AbortReason::Cascade,
                );
                return;
            }
            if !core.retry.begin(original) {
                // A retry for this logical call is already in flight.
                return;
            }
            core.stats.record_retry();

            let new_id = CallId::allocate();
            if let Some(p) = parent {
                if let Err(err) = inner.ledger.record_child(p, new_id) {
                    core.retry.finish(original);
                    drop(inner);
                    Self::fail_tree(core, tree, err, AbortReason::Cascade);
                    return;
                }
            }
            inner
                .ledger
                .create(CallRecord::replacement(new_id, target, parent, real.clone(), attempt, now));
            let entry = inner
                .entries
                .remove(&call)
                .expect("aborted call has no continuation entry");
            inner.entries.insert(new_id, entry);
            if inner.root == Some(call) {
                inner.root = Some(new_id);
            }
            core.registry.lock().insert(new_id, tree.clone());
            core.retry.finish(original);
            tracing::debug!(call = %call, replacement = %new_id, attempt, "re-executing with real value");
            replacement = new_id;
        }
        Self::run_attempt(core, tree, replacement, real);
    }

    /// Runs the commit cascade and delivers the root result when it settles.
    fn try_commit(core: &Arc<Self>, tree: &Arc<Tree<Q, V>>) {
        let mut inner = tree.inner.lock();
        let now = core.clock.now();
        let committed = inner.ledger.run_commit_pass(now);
        if committed.is_empty() {
            return;
        }
        {
            let mut registry = core.registry.lock();
            for id in &committed {
                registry.remove(id);
            }
        }
        for id in &committed {
            tracing::debug!(call = %id, "call committed");
        }
        let Some(root) = inner.root else {
            return;
        };
        if committed.contains(&root) && !inner.delivered {
            let value = inner
                .ledger
                .get(root)
                .and_then(|record| record.provisional.clone())
                .expect("committed root has a provisional result");
            inner.delivered = true;
            inner.result = Some(Ok(value));
            let ids: Vec<CallId> = inner.ledger.iter().map(|(id, _)| *id).collect();
            {
                let mut registry = core.registry.lock();
                for id in ids {
                    registry.remove(&id);
                }
            }
            tracing::info!(root = %root, "final result delivered");
            tree.settled.notify_all();
        }
    }

    /// Fails the whole tree: aborts everything pending and delivers `error`
    /// through the result cell, exactly once.
    fn fail_tree(core: &Arc<Self>, tree: &Arc<Tree<Q, V>>, error: Error, reason: AbortReason) {
        let mut inner = tree.inner.lock();
        if inner.delivered {
            return;
        }
        let now = core.clock.now();
        let aborted = inner.ledger.abort_all_pending(now, reason);
        inner.entries.clear();
        let ids: Vec<CallId> = inner.ledger.iter().map(|(id, _)| *id).collect();
        {
            let mut registry = core.registry.lock();
            for id in &ids {
                registry.remove(id);
            }
        }
        inner.delivered = true;
        tracing::warn!(error = %error, aborted = aborted.len(), "call tree failed");
        inner.result = Some(Err(error));
        tree.settled.notify_all();
    }
}

/// The capability context handed to a continuation's `run`.
///
/// Child calls issued through [`call`](Self::call) return control
/// immediately with a [`CallId`] only; a parent never observes a child's
/// speculative value, so a discredited child cannot silently poison work
/// above it.
pub struct SpecContext<'a, Q, V> {
    core: &'a Arc<Core<Q, V>>,
    tree: &'a Arc<Tree<Q, V>>,
    call: CallId,
}

impl<Q, V> SpecContext<'_, Q, V>
where
    Q: Send + 'static,
    V: Clone + PartialEq + Send + 'static,
{
    /// Returns the ID of the call this run belongs to.
    #[must_use]
    pub const fn call_id(&self) -> CallId {
        self.call
    }

    /// Issues a speculative child call from inside a run.
    ///
    /// The child's continuation runs synchronously against
    /// `guess_fn(&request)` before this returns; the child's real reply is
    /// reconciled whenever the transport resolves it.
    pub fn call(
        &mut self,
        target: impl Into<Endpoint>,
        request: Q,
        continuation: Box<dyn Continuation<Q, V>>,
        guess_fn: impl FnOnce(&Q) -> V,
    ) -> Result<CallId> {
        let guess = guess_fn(&request);
        Core::start_call(
            self.core,
            self.tree,
            Some(self.call),
            target.into(),
            request,
            continuation,
            guess,
        )
    }
}

/// The application's entry point for speculative calls.
///
/// Cloning is cheap and shares the underlying engine.
pub struct SpecFacade<Q, V> {
    core: Arc<Core<Q, V>>,
}

impl<Q, V> Clone for SpecFacade<Q, V> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<Q, V> core::fmt::Debug for SpecFacade<Q, V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpecFacade")
            .field("id", &self.core.facade)
            .finish_non_exhaustive()
    }
}

impl<Q, V> SpecFacade<Q, V>
where
    Q: Send + 'static,
    V: Clone + PartialEq + Send + 'static,
{
    /// Creates a facade over `transport` with a monotonic system clock.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport<Q, V>>, config: EngineConfig<V>) -> Self {
        Self::with_clock(transport, config, Arc::new(SystemClock::new()))
    }

    /// Creates a facade with an explicit time source (lab determinism).
    #[must_use]
    pub fn with_clock(
        transport: Arc<dyn Transport<Q, V>>,
        config: EngineConfig<V>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        let retry = RetryCoordinator::new(config.max_retry_depth);
        Self {
            core: Arc::new(Core {
                facade: FacadeId::allocate(),
                transport,
                config,
                clock,
                stats: SpecStats::new(),
                retry,
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns this facade's identifier.
    #[must_use]
    pub fn id(&self) -> FacadeId {
        self.core.facade
    }

    /// Returns a snapshot of the prediction statistics.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Issues a top-level speculative call.
    ///
    /// Registers the call, dispatches the request, and synchronously runs
    /// `continuation` against `guess_fn(&request)`. The returned handle is
    /// the registration point for the final result: it observes the root's
    /// committed value or the tree's failure, exactly once, and never a
    /// guess.
    pub fn invoke(
        &self,
        target: impl Into<Endpoint>,
        request: Q,
        continuation: Box<dyn Continuation<Q, V>>,
        guess_fn: impl FnOnce(&Q) -> V,
    ) -> Result<RootHandle<Q, V>> {
        let guess = guess_fn(&request);
        let tree = Arc::new(Tree::new());
        let call = Core::start_call(
            &self.core,
            &tree,
            None,
            target.into(),
            request,
            continuation,
            guess,
        )?;
        Ok(RootHandle { call, tree })
    }

    /// Issues a speculative call as a child of `parent`.
    ///
    /// Fails with [`ErrorKind::UnknownParent`] if the parent is not a live
    /// pending call on this facade.
    pub fn invoke_child(
        &self,
        parent: CallId,
        target: impl Into<Endpoint>,
        request: Q,
        continuation: Box<dyn Continuation<Q, V>>,
        guess_fn: impl FnOnce(&Q) -> V,
    ) -> Result<CallId> {
        let tree = self
            .core
            .registry
            .lock()
            .get(&parent)
            .cloned()
            .ok_or_else(|| {
                Error::usage(ErrorKind::UnknownParent, format!("{parent} not registered"))
            })?;
        let guess = guess_fn(&request);
        Core::start_call(
            &self.core,
            &tree,
            Some(parent),
            target.into(),
            request,
            continuation,
            guess,
        )
    }

    /// Treats every call whose deadline has passed as a transport timeout.
    ///
    /// Returns the number of calls expired. Only meaningful when the config
    /// sets a `call_timeout`; pair with a [`ManualClock`](crate::types::ManualClock)
    /// in tests.
    pub fn expire_overdue(&self) -> usize {
        let now = self.core.clock.now();
        let trees: Vec<Arc<Tree<Q, V>>> = {
            let registry = self.core.registry.lock();
            let mut unique: Vec<Arc<Tree<Q, V>>> = Vec::new();
            for tree in registry.values() {
                if !unique.iter().any(|t| Arc::ptr_eq(t, tree)) {
                    unique.push(tree.clone());
                }
            }
            unique
        };
        let mut expired = 0;
        for tree in trees {
            let overdue = tree.inner.lock().ledger.overdue(now);
            for call in overdue {
                let still_pending = tree
                    .inner
                    .lock()
                    .ledger
                    .get(call)
                    .is_some_and(CallRecord::is_pending);
                if still_pending {
                    expired += 1;
                    Core::on_reply(&self.core, &tree, call, Err(TransportError::Timeout));
                }
            }
        }
        expired
    }
}

/// A handle to a top-level speculative call.
///
/// The final-result cell: observes the committed root value or the tree's
/// failure, never a speculative guess.
pub struct RootHandle<Q, V> {
    call: CallId,
    tree: Arc<Tree<Q, V>>,
}

impl<Q, V> RootHandle<Q, V> {
    /// Returns the original root call ID.
    #[must_use]
    pub const fn call_id(&self) -> CallId {
        self.call
    }

    /// Returns the active root call ID, which changes across root retries.
    #[must_use]
    pub fn current_root(&self) -> CallId {
        self.tree.inner.lock().root.unwrap_or(self.call)
    }

    /// Returns true once the final result (or failure) has been delivered.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.tree.inner.lock().delivered
    }

    /// Returns the ledger statistics for this call tree.
    #[must_use]
    pub fn ledger_stats(&self) -> LedgerStats {
        self.tree.inner.lock().ledger.stats()
    }

    /// Returns the state of a call in this tree, if it exists.
    #[must_use]
    pub fn call_state(&self, id: CallId) -> Option<CallState> {
        self.tree.inner.lock().ledger.get(id).map(|r| r.state)
    }
}

impl<Q, V: Clone> RootHandle<Q, V> {
    /// Returns the final result if it has been delivered.
    #[must_use]
    pub fn try_result(&self) -> Option<Result<V>> {
        self.tree.inner.lock().result.clone()
    }

    /// Blocks until the final result is delivered.
    ///
    /// This is the one place the engine suspends on the network: everything
    /// up to here ran speculatively.
    pub fn wait(&self) -> Result<V> {
        let mut inner = self.tree.inner.lock();
        loop {
            if let Some(result) = inner.result.clone() {
                return result;
            }
            self.tree.settled.wait(&mut inner);
        }
    }

    /// Returns the committed result of any call in this tree.
    ///
    /// `None` while the call is pending or if it aborted.
    #[must_use]
    pub fn committed_result(&self, id: CallId) -> Option<V> {
        let inner = self.tree.inner.lock();
        inner
            .ledger
            .get(id)
            .filter(|r| r.state == CallState::Committed)
            .and_then(|r| r.provisional.clone())
    }
}

impl<Q, V> core::fmt::Debug for RootHandle<Q, V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RootHandle")
            .field("call", &self.call)
            .finish_non_exhaustive()
    }
}
