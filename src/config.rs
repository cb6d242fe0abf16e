//! Engine configuration.

use std::sync::Arc;

/// Default retry depth bound.
pub const DEFAULT_MAX_RETRY_DEPTH: u32 = 3;

/// How a real reply is compared against the recorded guess.
#[derive(Clone)]
pub enum Matcher<V> {
    /// Structural equality (`PartialEq`).
    Structural,
    /// A custom predicate, `predicate(guess, real)`.
    ///
    /// Lets applications treat semantically equivalent replies as a match
    /// (version counters, timestamps) without forcing that notion into the
    /// value type's `PartialEq`.
    Predicate(Arc<dyn Fn(&V, &V) -> bool + Send + Sync>),
}

impl<V: PartialEq> Matcher<V> {
    /// Returns true if `real` confirms `guess`.
    #[must_use]
    pub fn matches(&self, guess: &V, real: &V) -> bool {
        match self {
            Self::Structural => guess == real,
            Self::Predicate(p) => p(guess, real),
        }
    }
}

impl<V> Default for Matcher<V> {
    fn default() -> Self {
        Self::Structural
    }
}

impl<V> core::fmt::Debug for Matcher<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Structural => f.write_str("Matcher::Structural"),
            Self::Predicate(_) => f.write_str("Matcher::Predicate(..)"),
        }
    }
}

/// Configuration for a [`SpecFacade`](crate::facade::SpecFacade).
///
/// ```
/// use specular::config::EngineConfig;
///
/// let config: EngineConfig<u32> = EngineConfig::new()
///     .max_retry_depth(1)
///     .call_timeout_millis(250);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig<V> {
    /// Re-executions admitted per logical call before `RetryExhausted`.
    pub max_retry_depth: u32,
    /// Nanoseconds a call may stay unreplied before it is treated as a
    /// transport timeout. `None` disables expiry.
    pub call_timeout: Option<u64>,
    /// Guess/reply comparison.
    pub matcher: Matcher<V>,
}

impl<V> EngineConfig<V> {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_retry_depth: DEFAULT_MAX_RETRY_DEPTH,
            call_timeout: None,
            matcher: Matcher::Structural,
        }
    }

    /// Sets the retry depth bound.
    #[must_use]
    pub fn max_retry_depth(mut self, depth: u32) -> Self {
        self.max_retry_depth = depth;
        self
    }

    /// Sets the per-call timeout in nanoseconds.
    #[must_use]
    pub fn call_timeout_nanos(mut self, nanos: u64) -> Self {
        self.call_timeout = Some(nanos);
        self
    }

    /// Sets the per-call timeout in milliseconds.
    #[must_use]
    pub fn call_timeout_millis(mut self, millis: u64) -> Self {
        self.call_timeout = Some(millis.saturating_mul(1_000_000));
        self
    }

    /// Sets the guess/reply matcher.
    #[must_use]
    pub fn matcher(mut self, matcher: Matcher<V>) -> Self {
        self.matcher = matcher;
        self
    }
}

impl<V> Default for EngineConfig<V> {
    fn default() -> Self {
        Self::new()
    }
}
