//! Retry coordination for aborted speculation chains.
//!
//! When a guess is discredited the aborted chain is re-executed with the
//! authoritative value. The coordinator is the gatekeeper for those
//! re-executions: it bounds retry depth (a replacement run can itself fail
//! speculatively) and guarantees at most one outstanding retry per logical
//! call, so a burst of reply deliveries cannot fan one abort out into several
//! replacement runs.
//!
//! The coordinator holds no call state. The ledger owns the records; this
//! type answers "may this re-execution proceed" and keeps admission counters.

use crate::types::CallId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// The coordinator's answer to a re-execution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Re-execution may proceed as the given attempt.
    Admit,
    /// The retry bound is exceeded; the call chain fails with
    /// `RetryExhausted`.
    Exhausted,
}

/// Admits or refuses re-execution of aborted chains.
#[derive(Debug)]
pub struct RetryCoordinator {
    max_depth: u32,
    /// Logical calls (identified by their original ID) with a retry in
    /// flight.
    outstanding: Mutex<HashSet<CallId>>,
    admitted: AtomicU64,
    refused: AtomicU64,
}

impl RetryCoordinator {
    /// Creates a coordinator with the given retry depth bound.
    ///
    /// `max_depth` counts replacement runs: attempt 0 is the original
    /// speculative run, attempts 1..=max_depth are admitted retries.
    #[must_use]
    pub fn new(max_depth: u32) -> Self {
        Self {
            max_depth,
            outstanding: Mutex::new(HashSet::new()),
            admitted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    /// Returns the configured depth bound.
    #[must_use]
    pub const fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Decides whether a re-execution at `attempt` may proceed.
    pub fn admit(&self, attempt: u32) -> RetryVerdict {
        if attempt > self.max_depth {
            self.refused.fetch_add(1, Ordering::Relaxed);
            RetryVerdict::Exhausted
        } else {
            self.admitted.fetch_add(1, Ordering::Relaxed);
            RetryVerdict::Admit
        }
    }

    /// Claims the single retry slot for a logical call.
    ///
    /// Returns false if a retry for `original` is already in flight; the
    /// caller must then drop its re-execution request on the floor.
    pub fn begin(&self, original: CallId) -> bool {
        self.outstanding.lock().insert(original)
    }

    /// Releases the retry slot for a logical call.
    pub fn finish(&self, original: CallId) {
        self.outstanding.lock().remove(&original);
    }

    /// Total admitted re-executions.
    #[must_use]
    pub fn admitted_count(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Total refused re-executions.
    #[must_use]
    pub fn refused_count(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }
}
