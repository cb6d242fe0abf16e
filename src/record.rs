//! Call records for the speculation ledger.
//!
//! A [`CallRecord`] is the ledger's view of one speculative call: its place
//! in the call tree, the guess it was handed, the real reply once known, and
//! the side effects its speculative run produced. Records are owned
//! exclusively by the ledger; everything else refers to them by [`CallId`].
//!
//! State transitions:
//! ```text
//! Pending ──► Committed
//!    │
//!    └──────► Aborted
//! ```
//!
//! Exactly one transition, never back. Double resolution panics: it can only
//! happen through an engine defect, not through user input.

use crate::error::TransportError;
use crate::types::{CallId, Endpoint, Time};
use core::fmt;

/// The state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Dispatched, real reply not yet reconciled.
    Pending,
    /// Guess confirmed (and subtree settled); effects are final.
    Committed,
    /// Guess discredited; effects discarded.
    Aborted,
}

impl CallState {
    /// Returns true if the call reached a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

/// Why a call was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The real reply did not match the guess.
    Mismatch,
    /// The continuation signalled a speculation failure from its run.
    RunFailed,
    /// An ancestor was aborted; this call was invalidated with it.
    Cascade,
    /// The transport failed to produce a real reply.
    Transport,
}

impl AbortReason {
    /// Returns a short string for tracing and diagnostics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mismatch => "mismatch",
            Self::RunFailed => "run_failed",
            Self::Cascade => "cascade",
            Self::Transport => "transport",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An externally observable action performed by a speculative run.
///
/// This set is what rollback discards when the owning call aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    /// A child call was dispatched.
    ChildCall(CallId),
    /// The continuation produced a provisional result.
    ProvisionalResult,
}

/// The ledger's record of one speculative call.
pub struct CallRecord<V> {
    /// Unique identifier.
    pub id: CallId,
    /// The remote endpoint the request was dispatched to.
    pub target: Endpoint,
    /// The call that spawned this one, if any.
    pub parent: Option<CallId>,
    /// Children in creation order.
    pub children: Vec<CallId>,
    /// Current state.
    pub state: CallState,
    /// The guessed reply handed to the continuation.
    ///
    /// `None` for replacement calls born from a retry: those run with the
    /// real value and have nothing left to guess.
    pub guess: Option<V>,
    /// The real reply, once the transport resolved.
    pub real: Option<V>,
    /// True once this call's input value is authoritative: either the real
    /// reply matched the guess, or the call is a replacement running with
    /// the real value.
    pub matched: bool,
    /// True if the continuation's run signalled a speculation failure.
    pub run_failed: bool,
    /// True once the continuation's run has finished and its outcome is
    /// recorded. Replies arriving earlier are parked in `parked_reply`.
    pub run_complete: bool,
    /// A reply that arrived before the speculative run finished.
    pub parked_reply: Option<core::result::Result<V, TransportError>>,
    /// The continuation's return value; final only after commit.
    pub provisional: Option<V>,
    /// Side effects of the speculative run, discarded on abort.
    pub effects: Vec<SideEffect>,
    /// How many times this logical call has been re-executed (0 for the
    /// original speculative run).
    pub attempt: u32,
    /// When the request was dispatched.
    pub dispatched_at: Time,
    /// Past this instant a pending call is treated as a transport failure.
    pub deadline: Option<Time>,
    /// When the call reached a terminal state.
    pub resolved_at: Option<Time>,
    /// Why the call aborted, if it did.
    pub abort_reason: Option<AbortReason>,
}

impl<V> CallRecord<V> {
    /// Creates a pending record for a freshly dispatched speculative call.
    #[must_use]
    pub fn speculative(
        id: CallId,
        target: Endpoint,
        parent: Option<CallId>,
        guess: V,
        dispatched_at: Time,
        deadline: Option<Time>,
    ) -> Self {
        Self {
            id,
            target,
            parent,
            children: Vec::new(),
            state: CallState::Pending,
            guess: Some(guess),
            real: None,
            matched: false,
            run_failed: false,
            run_complete: false,
            parked_reply: None,
            provisional: None,
            effects: Vec::new(),
            attempt: 0,
            dispatched_at,
            deadline,
            resolved_at: None,
            abort_reason: None,
        }
    }

    /// Creates a pending replacement record for a retry.
    ///
    /// Replacement calls are born `matched`: they run with the authoritative
    /// value, so only their subtree can still discredit them.
    #[must_use]
    pub fn replacement(
        id: CallId,
        target: Endpoint,
        parent: Option<CallId>,
        real: V,
        attempt: u32,
        dispatched_at: Time,
    ) -> Self {
        Self {
            id,
            target,
            parent,
            children: Vec::new(),
            state: CallState::Pending,
            guess: None,
            real: Some(real),
            matched: true,
            run_failed: false,
            run_complete: false,
            parked_reply: None,
            provisional: None,
            effects: Vec::new(),
            attempt,
            dispatched_at,
            deadline: None,
            resolved_at: None,
            abort_reason: None,
        }
    }

    /// Returns true if the call is still pending.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self.state, CallState::Pending)
    }

    /// Commits the call.
    ///
    /// # Panics
    ///
    /// Panics if the call is already terminal.
    pub fn commit(&mut self, now: Time) {
        assert!(self.is_pending(), "call already resolved");
        self.state = CallState::Committed;
        self.resolved_at = Some(now);
        self.abort_reason = None;
    }

    /// Aborts the call.
    ///
    /// # Panics
    ///
    /// Panics if the call is already terminal.
    pub fn abort(&mut self, now: Time, reason: AbortReason) {
        assert!(self.is_pending(), "call already resolved");
        self.state = CallState::Aborted;
        self.resolved_at = Some(now);
        self.abort_reason = Some(reason);
    }
}

impl<V: fmt::Debug> fmt::Debug for CallRecord<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRecord")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("state", &self.state)
            .field("matched", &self.matched)
            .field("attempt", &self.attempt)
            .field("abort_reason", &self.abort_reason)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64) -> CallRecord<u32> {
        CallRecord::speculative(
            CallId::new_for_test(id),
            Endpoint::new("svc"),
            None,
            42,
            Time::from_nanos(10),
            None,
        )
    }

    #[test]
    fn state_predicates() {
        assert!(!CallState::Pending.is_terminal());
        assert!(CallState::Committed.is_terminal());
        assert!(CallState::Aborted.is_terminal());
    }

    #[test]
    fn lifecycle_commit() {
        let mut rec = record(1);
        assert!(rec.is_pending());
        rec.commit(Time::from_nanos(25));
        assert_eq!(rec.state, CallState::Committed);
        assert_eq!(rec.resolved_at, Some(Time::from_nanos(25)));
    }

    #[test]
    fn lifecycle_abort() {
        let mut rec = record(2);
        rec.abort(Time::from_nanos(30), AbortReason::Mismatch);
        assert_eq!(rec.state, CallState::Aborted);
        assert_eq!(rec.abort_reason, Some(AbortReason::Mismatch));
    }

    #[test]
    fn replacement_is_born_matched() {
        let rec: CallRecord<u32> = CallRecord::replacement(
            CallId::new_for_test(3),
            Endpoint::new("svc"),
            None,
            7,
            1,
            Time::ZERO,
        );
        assert!(rec.matched);
        assert!(rec.guess.is_none());
        assert_eq!(rec.real, Some(7));
        assert_eq!(rec.attempt, 1);
    }

    #[test]
    #[should_panic(expected = "call already resolved")]
    fn double_commit_panics() {
        let mut rec = record(4);
        rec.commit(Time::ZERO);
        rec.commit(Time::ZERO);
    }

    #[test]
    #[should_panic(expected = "call already resolved")]
    fn commit_after_abort_panics() {
        let mut rec = record(5);
        rec.abort(Time::ZERO, AbortReason::Cascade);
        rec.commit(Time::ZERO);
    }
}
