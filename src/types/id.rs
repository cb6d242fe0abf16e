//! Identifier types for engine entities.
//!
//! Calls and facades get type-safe identifiers allocated from process-wide
//! counters. Identifiers are never reused: a retried call is a *fresh* call
//! with a fresh identifier, which is what lets stale transport replies for a
//! replaced call be recognized and discarded.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CALL: AtomicU64 = AtomicU64::new(1);
static NEXT_FACADE: AtomicU64 = AtomicU64::new(1);

/// A unique identifier for one speculative call.
///
/// Calls form a tree; parent/child relationships are expressed as identifier
/// references in the ledger, never as direct ownership pointers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

impl CallId {
    /// Allocates a fresh, process-unique call identifier.
    #[must_use]
    pub fn allocate() -> Self {
        Self(NEXT_CALL.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates a call ID for testing purposes.
    #[doc(hidden)]
    #[must_use]
    pub const fn new_for_test(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw numeric value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallId({})", self.0)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// A unique identifier for a facade instance.
///
/// Continuations are bound to exactly one facade; the binding check uses this
/// identifier rather than a reference so continuations stay `Send`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FacadeId(u64);

impl FacadeId {
    /// Allocates a fresh facade identifier.
    #[must_use]
    pub fn allocate() -> Self {
        Self(NEXT_FACADE.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates a facade ID for testing purposes.
    #[doc(hidden)]
    #[must_use]
    pub const fn new_for_test(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for FacadeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FacadeId({})", self.0)
    }
}

impl fmt::Display for FacadeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// An opaque name for a remote endpoint.
///
/// The engine never interprets this beyond equality; endpoint resolution is
/// the transport's concern.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(Arc<str>);

impl Endpoint {
    /// Creates an endpoint from a name.
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Returns the endpoint name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Endpoint {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Endpoint {
    fn from(name: String) -> Self {
        Self(Arc::from(name.as_str()))
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self.0)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
