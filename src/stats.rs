//! Prediction statistics.
//!
//! Per-facade counters for how well guesses are doing. Cheap enough to stay
//! on unconditionally; applications use the correct/incorrect ratio to decide
//! whether speculation is paying for itself on a given workload.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live atomic counters for one facade.
#[derive(Debug, Default)]
pub struct SpecStats {
    predictions_total: AtomicU64,
    predictions_correct: AtomicU64,
    predictions_incorrect: AtomicU64,
    retries: AtomicU64,
    stale_replies: AtomicU64,
    transport_failures: AtomicU64,
}

impl SpecStats {
    /// Creates zeroed stats.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a speculative dispatch (one prediction made).
    pub fn record_prediction(&self) {
        self.predictions_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a guess confirmed by the real reply.
    pub fn record_correct(&self) {
        self.predictions_correct.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a guess discredited by the real reply or a failed run.
    pub fn record_incorrect(&self) {
        self.predictions_incorrect.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one admitted re-execution.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a reply discarded because its call was already terminal.
    pub fn record_stale_reply(&self) {
        self.stale_replies.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a transport failure.
    pub fn record_transport_failure(&self) {
        self.transport_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a consistent-enough snapshot of the counters.
    ///
    /// Counters are read individually; a snapshot taken while calls are in
    /// flight may be mid-update, which is fine for diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            predictions_total: self.predictions_total.load(Ordering::Relaxed),
            predictions_correct: self.predictions_correct.load(Ordering::Relaxed),
            predictions_incorrect: self.predictions_incorrect.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            stale_replies: self.stale_replies.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`SpecStats`], serializable for export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Speculative dispatches made.
    pub predictions_total: u64,
    /// Guesses confirmed by the real reply.
    pub predictions_correct: u64,
    /// Guesses discredited (mismatch or failed run).
    pub predictions_incorrect: u64,
    /// Re-executions admitted by the retry coordinator.
    pub retries: u64,
    /// Replies discarded against terminal calls.
    pub stale_replies: u64,
    /// Transport failures observed.
    pub transport_failures: u64,
}

impl StatsSnapshot {
    /// Fraction of resolved predictions that were correct, or `None` before
    /// any prediction resolved.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> Option<f64> {
        let resolved = self.predictions_correct + self.predictions_incorrect;
        if resolved == 0 {
            return None;
        }
        Some(self.predictions_correct as f64 / resolved as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = SpecStats::new();
        stats.record_prediction();
        stats.record_prediction();
        stats.record_correct();
        stats.record_incorrect();
        stats.record_retry();
        stats.record_stale_reply();

        let snap = stats.snapshot();
        assert_eq!(snap.predictions_total, 2);
        assert_eq!(snap.predictions_correct, 1);
        assert_eq!(snap.predictions_incorrect, 1);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.stale_replies, 1);
        assert_eq!(snap.hit_rate(), Some(0.5));
    }

    #[test]
    fn hit_rate_undefined_before_resolution() {
        let stats = SpecStats::new();
        stats.record_prediction();
        assert_eq!(stats.snapshot().hit_rate(), None);
    }

    #[test]
    fn snapshot_serializes() {
        let stats = SpecStats::new();
        stats.record_prediction();
        stats.record_correct();
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"predictions_correct\":1"));
    }
}
