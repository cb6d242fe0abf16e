//! The continuation contract.
//!
//! A continuation is the application's "what happens after the reply" code.
//! The engine runs it twice in the worst case: once speculatively with a
//! guessed reply, and once more with the real value if the guess was wrong.
//! The core property is that `run` cannot tell which execution it is in; it
//! receives a value and a [`SpecContext`] and must behave identically for
//! both.
//!
//! Continuations are bound to exactly one facade before their first run, and
//! to at most one live call at a time. [`Binding`] is the reusable enforcement
//! for implementations; the provided [`IdentityContinuation`] and
//! [`FnContinuation`] both delegate to it.

use crate::error::{Error, ErrorKind, Result};
use crate::facade::SpecContext;
use crate::types::{CallId, FacadeId};

/// Application code run against a reply, guessed or real.
///
/// `Q` is the request type, `V` the reply/value type. Implementations must
/// not mutate shared state in place during `run`: an aborted speculative run
/// is discarded wholesale, and any effect that escaped the engine's records
/// cannot be rolled back. Produce the result through the return value and
/// child calls through `cx` only.
pub trait Continuation<Q, V>: Send {
    /// Binds this continuation to a facade. Must be called before `run`.
    ///
    /// Binding twice to the same facade is a no-op; binding to a second
    /// facade fails with [`ErrorKind::Rebind`].
    fn bind(&mut self, facade: FacadeId) -> Result<()>;

    /// Runs the continuation against `value`.
    ///
    /// `value` is either a guess or the authoritative reply; the
    /// implementation cannot and must not distinguish the two. Returning
    /// `Err` with [`ErrorKind::SpeculationFailed`] signals a self-detected
    /// inconsistency and is treated exactly like a mismatched guess. Any
    /// other error is a permanent failure for the call.
    fn run(&mut self, cx: &mut SpecContext<'_, Q, V>, value: V) -> Result<V>;
}

/// Bind/attach bookkeeping shared by continuation implementations.
#[derive(Debug, Clone, Copy, Default)]
pub struct Binding {
    facade: Option<FacadeId>,
    live_call: Option<CallId>,
}

impl Binding {
    /// Creates an unbound binding.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            facade: None,
            live_call: None,
        }
    }

    /// Binds to `facade`. Idempotent for the same facade.
    pub fn bind(&mut self, facade: FacadeId) -> Result<()> {
        match self.facade {
            None => {
                self.facade = Some(facade);
                Ok(())
            }
            Some(bound) if bound == facade => Ok(()),
            Some(bound) => Err(Error::usage(
                ErrorKind::Rebind,
                format!("bound to {bound}, rebind to {facade}"),
            )),
        }
    }

    /// Attaches to a live call; fails if another call is still attached.
    pub fn attach(&mut self, call: CallId) -> Result<()> {
        if let Some(live) = self.live_call {
            return Err(Error::usage(
                ErrorKind::InvalidContinuation,
                format!("already attached to live call {live}"),
            )
            .with_call(call));
        }
        self.live_call = Some(call);
        Ok(())
    }

    /// Detaches from `call` if it is the attached one.
    pub fn detach(&mut self, call: CallId) {
        if self.live_call == Some(call) {
            self.live_call = None;
        }
    }

    /// Returns the bound facade, if any.
    #[must_use]
    pub const fn facade(&self) -> Option<FacadeId> {
        self.facade
    }

    /// Returns the attached live call, if any.
    #[must_use]
    pub const fn live_call(&self) -> Option<CallId> {
        self.live_call
    }
}

/// A continuation that returns the reply unchanged.
///
/// The degenerate "nothing to do after the reply" case. With an identity
/// continuation a mismatch still aborts and re-runs, but the re-run is just
/// the authoritative value passing through.
#[derive(Debug, Default)]
pub struct IdentityContinuation {
    binding: Binding,
}

impl IdentityContinuation {
    /// Creates an identity continuation.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            binding: Binding::new(),
        }
    }
}

impl<Q, V> Continuation<Q, V> for IdentityContinuation {
    fn bind(&mut self, facade: FacadeId) -> Result<()> {
        self.binding.bind(facade)
    }

    fn run(&mut self, _cx: &mut SpecContext<'_, Q, V>, value: V) -> Result<V> {
        Ok(value)
    }
}

/// Adapts a closure into a [`Continuation`].
pub struct FnContinuation<F> {
    binding: Binding,
    f: F,
}

impl<F> FnContinuation<F> {
    /// Wraps `f` as a continuation.
    #[must_use]
    pub const fn new(f: F) -> Self {
        Self {
            binding: Binding::new(),
            f,
        }
    }
}

impl<Q, V, F> Continuation<Q, V> for FnContinuation<F>
where
    F: FnMut(&mut SpecContext<'_, Q, V>, V) -> Result<V> + Send,
{
    fn bind(&mut self, facade: FacadeId) -> Result<()> {
        self.binding.bind(facade)
    }

    fn run(&mut self, cx: &mut SpecContext<'_, Q, V>, value: V) -> Result<V> {
        (self.f)(cx, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_is_idempotent_for_same_facade() {
        let mut binding = Binding::new();
        let facade = FacadeId::new_for_test(1);
        binding.bind(facade).unwrap();
        binding.bind(facade).unwrap();
        assert_eq!(binding.facade(), Some(facade));
    }

    #[test]
    fn rebind_to_second_facade_fails() {
        let mut binding = Binding::new();
        binding.bind(FacadeId::new_for_test(1)).unwrap();
        let err = binding.bind(FacadeId::new_for_test(2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rebind);
    }

    #[test]
    fn attach_while_live_fails() {
        let mut binding = Binding::new();
        binding.attach(CallId::new_for_test(1)).unwrap();
        let err = binding.attach(CallId::new_for_test(2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidContinuation);

        binding.detach(CallId::new_for_test(1));
        binding.attach(CallId::new_for_test(2)).unwrap();
        assert_eq!(binding.live_call(), Some(CallId::new_for_test(2)));
    }

    #[test]
    fn detach_of_other_call_is_ignored() {
        let mut binding = Binding::new();
        binding.attach(CallId::new_for_test(1)).unwrap();
        binding.detach(CallId::new_for_test(9));
        assert_eq!(binding.live_call(), Some(CallId::new_for_test(1)));
    }
}
