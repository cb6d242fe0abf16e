//! Speculation ledger — per-call-tree registry for call lifecycle.
//!
//! The ledger is the single source of truth for one call tree. Every create,
//! commit, and abort flows through here, which is what makes the rollback
//! guarantees structural: an aborted subtree cannot leave a live descendant
//! behind because the abort walks the parent→children index atomically under
//! the tree lock.
//!
//! # Invariants
//!
//! 1. Every call transitions through exactly one path:
//!    `Pending → Committed` or `Pending → Aborted`.
//! 2. A child is only ever attached to a `Pending` parent.
//! 3. A call commits only when its own value is authoritative (`matched`),
//!    every ancestor's value is authoritative, and every child is terminal.
//! 4. Double resolution panics (enforced by `CallRecord`).
//!
//! Iteration order is deterministic (`BTreeMap`), so commit cascades and
//! abort collections replay identically for identical inputs.

use crate::error::{Error, ErrorKind, Result};
use crate::record::{AbortReason, CallRecord, CallState, SideEffect};
use crate::types::{CallId, Time};
use std::collections::BTreeMap;

/// Statistics about one ledger's call tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerStats {
    /// Total calls ever created.
    pub created: u64,
    /// Total calls committed.
    pub committed: u64,
    /// Total calls aborted.
    pub aborted: u64,
    /// Currently pending.
    pub pending: u64,
}

impl LedgerStats {
    /// Returns true if every created call has reached a terminal state.
    #[must_use]
    pub const fn is_quiescent(&self) -> bool {
        self.pending == 0
    }
}

/// The speculation ledger: call records for one call tree.
#[derive(Debug)]
pub struct SpecLedger<V> {
    /// All calls, keyed by ID. BTreeMap for deterministic iteration.
    calls: BTreeMap<CallId, CallRecord<V>>,
    /// Running statistics.
    stats: LedgerStats,
}

impl<V> Default for SpecLedger<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> SpecLedger<V> {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: BTreeMap::new(),
            stats: LedgerStats::default(),
        }
    }

    /// Inserts a freshly created call record.
    ///
    /// # Panics
    ///
    /// Panics if the ID is already present (IDs are process-unique, so a
    /// collision is a defect).
    pub fn create(&mut self, record: CallRecord<V>) {
        let id = record.id;
        let prior = self.calls.insert(id, record);
        assert!(prior.is_none(), "call id reused in ledger");
        self.stats.created += 1;
        self.stats.pending += 1;
    }

    /// Records `child` under `parent` and logs the dispatch side effect.
    ///
    /// Fails with [`ErrorKind::UnknownParent`] if the parent is missing or no
    /// longer pending — a child must never attach to a call that has begun
    /// aborting or has already settled.
    pub fn record_child(&mut self, parent: CallId, child: CallId) -> Result<()> {
        let record = self
            .calls
            .get_mut(&parent)
            .ok_or_else(|| Error::usage(ErrorKind::UnknownParent, format!("{parent} not found")))?;
        if !record.is_pending() {
            return Err(Error::usage(
                ErrorKind::UnknownParent,
                format!("{parent} is not pending"),
            )
            .with_call(parent));
        }
        record.children.push(child);
        record.effects.push(SideEffect::ChildCall(child));
        Ok(())
    }

    /// Marks a single call committed.
    ///
    /// # Panics
    ///
    /// Panics if the call does not exist or is already terminal.
    pub fn mark_committed(&mut self, id: CallId, now: Time) {
        let record = self.calls.get_mut(&id).expect("call not found in ledger");
        record.commit(now);
        self.stats.committed += 1;
        self.stats.pending = self.stats.pending.saturating_sub(1);
    }

    /// Aborts `id` and every still-pending descendant, depth first.
    ///
    /// Returns the full set of aborted call IDs (root of the abort first) so
    /// the caller can discard every associated side-effect record in one
    /// pass. Descendants that already committed keep their state; their
    /// results are simply never delivered because the replacement run
    /// supersedes them.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not exist or is already terminal.
    pub fn mark_aborted(&mut self, id: CallId, now: Time, reason: AbortReason) -> Vec<CallId> {
        assert!(
            self.calls.get(&id).is_some_and(CallRecord::is_pending),
            "abort target not pending"
        );

        let mut aborted = Vec::new();
        let mut stack = vec![(id, reason)];
        while let Some((current, why)) = stack.pop() {
            let Some(record) = self.calls.get_mut(&current) else {
                continue;
            };
            if record.is_pending() {
                record.abort(now, why);
                self.stats.aborted += 1;
                self.stats.pending = self.stats.pending.saturating_sub(1);
                aborted.push(current);
            }
            for child in record.children.clone() {
                stack.push((child, AbortReason::Cascade));
            }
        }
        aborted
    }

    /// Aborts every pending call in the tree (terminal tree failure).
    pub fn abort_all_pending(&mut self, now: Time, reason: AbortReason) -> Vec<CallId> {
        let pending: Vec<CallId> = self
            .calls
            .iter()
            .filter(|(_, r)| r.is_pending())
            .map(|(id, _)| *id)
            .collect();
        for id in &pending {
            let record = self.calls.get_mut(id).expect("call not found in ledger");
            record.abort(now, reason);
            self.stats.aborted += 1;
            self.stats.pending = self.stats.pending.saturating_sub(1);
        }
        pending
    }

    /// Runs the commit cascade to fixpoint.
    ///
    /// A call commits when it is pending, its own value is authoritative,
    /// every ancestor's value is authoritative, and every child is terminal.
    /// Children therefore settle before their parents, while ancestor
    /// matching propagates top-down; both directions are resolved by
    /// iterating until no call changes state.
    ///
    /// Returns the IDs committed by this pass in deterministic order.
    pub fn run_commit_pass(&mut self, now: Time) -> Vec<CallId> {
        let mut committed = Vec::new();
        loop {
            let eligible: Vec<CallId> = self
                .calls
                .keys()
                .copied()
                .filter(|id| self.commit_eligible(*id))
                .collect();
            if eligible.is_empty() {
                break;
            }
            for id in eligible {
                self.mark_committed(id, now);
                committed.push(id);
            }
        }
        committed
    }

    /// Returns true if the call could commit right now.
    #[must_use]
    pub fn commit_eligible(&self, id: CallId) -> bool {
        let Some(record) = self.calls.get(&id) else {
            return false;
        };
        record.is_pending()
            && record.matched
            && record.run_complete
            && !record.run_failed
            && self.ancestors_matched(id)
            && self.children_terminal(id)
    }

    /// Returns true if every ancestor of `id` has an authoritative value.
    #[must_use]
    pub fn ancestors_matched(&self, id: CallId) -> bool {
        let mut cursor = self.calls.get(&id).and_then(|r| r.parent);
        while let Some(parent) = cursor {
            let Some(record) = self.calls.get(&parent) else {
                return false;
            };
            if !record.matched || record.state == CallState::Aborted {
                return false;
            }
            cursor = record.parent;
        }
        true
    }

    /// Returns true if every child of `id` is terminal.
    #[must_use]
    pub fn children_terminal(&self, id: CallId) -> bool {
        let Some(record) = self.calls.get(&id) else {
            return false;
        };
        record.children.iter().all(|child| {
            self.calls
                .get(child)
                .is_some_and(|r| r.state.is_terminal())
        })
    }

    /// Returns a reference to a call record.
    #[must_use]
    pub fn get(&self, id: CallId) -> Option<&CallRecord<V>> {
        self.calls.get(&id)
    }

    /// Returns a mutable reference to a call record.
    pub fn get_mut(&mut self, id: CallId) -> Option<&mut CallRecord<V>> {
        self.calls.get_mut(&id)
    }

    /// Returns the current ledger statistics.
    #[must_use]
    pub const fn stats(&self) -> LedgerStats {
        self.stats
    }

    /// Returns the number of pending calls.
    #[must_use]
    pub const fn pending_count(&self) -> u64 {
        self.stats.pending
    }

    /// Returns the IDs of calls whose deadline has passed, in deterministic
    /// order.
    #[must_use]
    pub fn overdue(&self, now: Time) -> Vec<CallId> {
        self.calls
            .iter()
            .filter(|(_, r)| {
                r.is_pending() && r.real.is_none() && r.deadline.is_some_and(|d| d < now)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Iterates over all calls in deterministic order.
    pub fn iter(&self) -> impl Iterator<Item = (&CallId, &CallRecord<V>)> {
        self.calls.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Endpoint;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    fn speculative(id: u64, parent: Option<u64>, guess: u32) -> CallRecord<u32> {
        CallRecord::speculative(
            CallId::new_for_test(id),
            Endpoint::new("svc"),
            parent.map(CallId::new_for_test),
            guess,
            Time::ZERO,
            None,
        )
    }

    fn cid(id: u64) -> CallId {
        CallId::new_for_test(id)
    }

    /// Builds root(1) -> child(2) -> grandchild(3).
    fn three_level() -> SpecLedger<u32> {
        let mut ledger = SpecLedger::new();
        ledger.create(speculative(1, None, 10));
        ledger.create(speculative(2, Some(1), 20));
        ledger.record_child(cid(1), cid(2)).unwrap();
        ledger.create(speculative(3, Some(2), 30));
        ledger.record_child(cid(2), cid(3)).unwrap();
        ledger
    }

    fn mark_matched(ledger: &mut SpecLedger<u32>, id: CallId) {
        let rec = ledger.get_mut(id).unwrap();
        rec.matched = true;
        rec.run_complete = true;
    }

    #[test]
    fn create_and_record_child() {
        init_test("create_and_record_child");
        let ledger = three_level();
        let pending = ledger.pending_count();
        crate::assert_with_log!(pending == 3, "pending", 3, pending);
        let root = ledger.get(cid(1)).unwrap();
        crate::assert_with_log!(
            root.children == vec![cid(2)],
            "root children",
            vec![cid(2)],
            root.children
        );
        crate::test_complete!("create_and_record_child");
    }

    #[test]
    fn record_child_rejects_missing_parent() {
        init_test("record_child_rejects_missing_parent");
        let mut ledger: SpecLedger<u32> = SpecLedger::new();
        let err = ledger.record_child(cid(99), cid(1)).unwrap_err();
        crate::assert_with_log!(
            err.kind() == ErrorKind::UnknownParent,
            "kind",
            ErrorKind::UnknownParent,
            err.kind()
        );
        crate::test_complete!("record_child_rejects_missing_parent");
    }

    #[test]
    fn record_child_rejects_terminal_parent() {
        init_test("record_child_rejects_terminal_parent");
        let mut ledger = SpecLedger::new();
        ledger.create(speculative(1, None, 10));
        ledger.mark_aborted(cid(1), Time::ZERO, AbortReason::Mismatch);
        let err = ledger.record_child(cid(1), cid(2)).unwrap_err();
        crate::assert_with_log!(
            err.kind() == ErrorKind::UnknownParent,
            "kind",
            ErrorKind::UnknownParent,
            err.kind()
        );
        crate::test_complete!("record_child_rejects_terminal_parent");
    }

    #[test]
    fn abort_cascades_depth_first() {
        init_test("abort_cascades_depth_first");
        let mut ledger = three_level();
        let aborted = ledger.mark_aborted(cid(1), Time::from_nanos(5), AbortReason::Mismatch);

        crate::assert_with_log!(aborted.len() == 3, "aborted count", 3, aborted.len());
        crate::assert_with_log!(aborted[0] == cid(1), "abort root first", cid(1), aborted[0]);

        let root = ledger.get(cid(1)).unwrap();
        crate::assert_with_log!(
            root.abort_reason == Some(AbortReason::Mismatch),
            "root reason",
            Some(AbortReason::Mismatch),
            root.abort_reason
        );
        for id in [2, 3] {
            let rec = ledger.get(cid(id)).unwrap();
            crate::assert_with_log!(
                rec.state == CallState::Aborted,
                "descendant aborted",
                CallState::Aborted,
                rec.state
            );
            crate::assert_with_log!(
                rec.abort_reason == Some(AbortReason::Cascade),
                "descendant reason",
                Some(AbortReason::Cascade),
                rec.abort_reason
            );
        }
        crate::assert_with_log!(
            ledger.stats().is_quiescent(),
            "quiescent",
            true,
            ledger.stats().is_quiescent()
        );
        crate::test_complete!("abort_cascades_depth_first");
    }

    #[test]
    fn abort_skips_already_terminal_descendants() {
        init_test("abort_skips_already_terminal_descendants");
        let mut ledger = three_level();
        // Settle the grandchild first.
        mark_matched(&mut ledger, cid(3));
        ledger.mark_committed(cid(3), Time::ZERO);

        let aborted = ledger.mark_aborted(cid(1), Time::ZERO, AbortReason::Mismatch);
        crate::assert_with_log!(aborted.len() == 2, "aborted count", 2, aborted.len());
        let grandchild = ledger.get(cid(3)).unwrap();
        crate::assert_with_log!(
            grandchild.state == CallState::Committed,
            "committed stays",
            CallState::Committed,
            grandchild.state
        );
        crate::test_complete!("abort_skips_already_terminal_descendants");
    }

    #[test]
    fn commit_pass_settles_children_before_parents() {
        init_test("commit_pass_settles_children_before_parents");
        let mut ledger = three_level();
        mark_matched(&mut ledger, cid(1));
        mark_matched(&mut ledger, cid(2));
        mark_matched(&mut ledger, cid(3));

        let committed = ledger.run_commit_pass(Time::from_nanos(9));
        crate::assert_with_log!(committed.len() == 3, "committed count", 3, committed.len());
        // Leaf settles in the first fixpoint iteration, root in the last.
        let leaf_pos = committed.iter().position(|c| *c == cid(3)).unwrap();
        let root_pos = committed.iter().position(|c| *c == cid(1)).unwrap();
        crate::assert_with_log!(leaf_pos < root_pos, "leaf before root", true, leaf_pos < root_pos);
        crate::test_complete!("commit_pass_settles_children_before_parents");
    }

    #[test]
    fn parent_waits_for_pending_child() {
        init_test("parent_waits_for_pending_child");
        let mut ledger = three_level();
        mark_matched(&mut ledger, cid(1));
        mark_matched(&mut ledger, cid(2));
        // Grandchild still speculative: nothing commits above it.
        let committed = ledger.run_commit_pass(Time::ZERO);
        crate::assert_with_log!(committed.is_empty(), "nothing commits", true, committed.is_empty());

        mark_matched(&mut ledger, cid(3));
        let committed = ledger.run_commit_pass(Time::ZERO);
        crate::assert_with_log!(committed.len() == 3, "all commit", 3, committed.len());
        crate::test_complete!("parent_waits_for_pending_child");
    }

    #[test]
    fn child_waits_for_unmatched_ancestor() {
        init_test("child_waits_for_unmatched_ancestor");
        let mut ledger = three_level();
        // Child and grandchild matched, root still speculative.
        mark_matched(&mut ledger, cid(2));
        mark_matched(&mut ledger, cid(3));
        let committed = ledger.run_commit_pass(Time::ZERO);
        crate::assert_with_log!(committed.is_empty(), "held by root", true, committed.is_empty());
        crate::test_complete!("child_waits_for_unmatched_ancestor");
    }

    #[test]
    fn run_failure_blocks_commit() {
        init_test("run_failure_blocks_commit");
        let mut ledger: SpecLedger<u32> = SpecLedger::new();
        ledger.create(speculative(1, None, 10));
        let rec = ledger.get_mut(cid(1)).unwrap();
        rec.matched = true;
        rec.run_complete = true;
        rec.run_failed = true;
        crate::assert_with_log!(
            !ledger.commit_eligible(cid(1)),
            "not eligible",
            false,
            ledger.commit_eligible(cid(1))
        );
        crate::test_complete!("run_failure_blocks_commit");
    }

    #[test]
    fn overdue_reports_expired_pending_calls() {
        init_test("overdue_reports_expired_pending_calls");
        let mut ledger: SpecLedger<u32> = SpecLedger::new();
        let mut rec = speculative(1, None, 10);
        rec.deadline = Some(Time::from_nanos(100));
        ledger.create(rec);
        ledger.create(speculative(2, None, 20)); // no deadline

        let overdue = ledger.overdue(Time::from_nanos(50));
        crate::assert_with_log!(overdue.is_empty(), "not yet", true, overdue.is_empty());

        let overdue = ledger.overdue(Time::from_nanos(101));
        crate::assert_with_log!(overdue == vec![cid(1)], "expired", vec![cid(1)], overdue);
        crate::test_complete!("overdue_reports_expired_pending_calls");
    }

    #[test]
    fn abort_all_pending_clears_tree() {
        init_test("abort_all_pending_clears_tree");
        let mut ledger = three_level();
        let aborted = ledger.abort_all_pending(Time::ZERO, AbortReason::Transport);
        crate::assert_with_log!(aborted.len() == 3, "aborted", 3, aborted.len());
        crate::assert_with_log!(
            ledger.stats().is_quiescent(),
            "quiescent",
            true,
            ledger.stats().is_quiescent()
        );
        crate::test_complete!("abort_all_pending_clears_tree");
    }

    #[test]
    #[should_panic(expected = "abort target not pending")]
    fn abort_terminal_call_panics() {
        let mut ledger = three_level();
        ledger.mark_aborted(cid(1), Time::ZERO, AbortReason::Mismatch);
        ledger.mark_aborted(cid(1), Time::ZERO, AbortReason::Mismatch);
    }
}
