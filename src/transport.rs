//! Transport adapter seam.
//!
//! The engine never talks to a network directly. It hands a serialized-enough
//! request to a [`Transport`] together with a [`ReplySink`] and moves on; the
//! transport resolves the sink exactly once, from whatever thread it likes,
//! when the real reply (or a failure) materializes. Wire format, connection
//! management, and endpoint resolution all live behind this trait.
//!
//! Two test doubles ship with the crate:
//! - [`LabTransport`] captures sends and lets the test pump replies in a
//!   deterministic order, which is how reconciliation races are exercised.
//! - [`FnTransport`] computes the reply inline from a closure, useful when a
//!   test only cares about the value and not the delivery interleaving.

use crate::error::TransportError;
use crate::types::{CallId, Endpoint};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// A one-shot resolution channel for a dispatched request.
///
/// The sink must be resolved exactly once. Dropping an unresolved sink
/// delivers [`TransportError::ConnectionLost`], so a transport that loses
/// track of a request still terminates the call instead of wedging it.
pub struct ReplySink<V> {
    call: CallId,
    deliver: Option<Box<dyn FnOnce(Result<V, TransportError>) + Send>>,
}

impl<V> ReplySink<V> {
    /// Creates a sink that feeds resolutions into `deliver`.
    #[must_use]
    pub fn new(call: CallId, deliver: impl FnOnce(Result<V, TransportError>) + Send + 'static) -> Self {
        Self {
            call,
            deliver: Some(Box::new(deliver)),
        }
    }

    /// Returns the call this sink resolves.
    #[must_use]
    pub const fn call(&self) -> CallId {
        self.call
    }

    /// Delivers the real reply.
    pub fn resolve(mut self, value: V) {
        if let Some(deliver) = self.deliver.take() {
            deliver(Ok(value));
        }
    }

    /// Delivers a transport failure.
    pub fn fail(mut self, error: TransportError) {
        if let Some(deliver) = self.deliver.take() {
            deliver(Err(error));
        }
    }
}

impl<V> Drop for ReplySink<V> {
    fn drop(&mut self) {
        if let Some(deliver) = self.deliver.take() {
            deliver(Err(TransportError::ConnectionLost));
        }
    }
}

impl<V> core::fmt::Debug for ReplySink<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReplySink")
            .field("call", &self.call)
            .field("resolved", &self.deliver.is_none())
            .finish()
    }
}

/// The transport seam: dispatches a request and resolves the sink later.
///
/// `send` must not block on the network; the whole point of speculation is
/// that the caller resumes before the reply exists. Implementations may
/// resolve the sink inline (the reply path then runs on the caller's thread,
/// which the engine tolerates) or from any other thread.
pub trait Transport<Q, V>: Send + Sync {
    /// Dispatches `request` to `target`. The reply resolves `sink`.
    fn send(&self, target: &Endpoint, request: Q, sink: ReplySink<V>);
}

/// A captured, not-yet-replied send.
struct InFlight<Q, V> {
    target: Endpoint,
    request: Q,
    sink: ReplySink<V>,
}

/// A transport double that captures sends for deterministic replay.
///
/// Tests pump replies with [`deliver_next`](Self::deliver_next) in whatever
/// order the scenario needs; undelivered sends fail with `ConnectionLost`
/// when the transport is dropped.
pub struct LabTransport<Q, V> {
    pending: Mutex<VecDeque<InFlight<Q, V>>>,
    sent: Mutex<Vec<(CallId, Endpoint)>>,
}

impl<Q, V> Default for LabTransport<Q, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Q, V> LabTransport<Q, V> {
    /// Creates an empty lab transport.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Returns the number of sends awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns every dispatch observed so far, in order.
    #[must_use]
    pub fn sent_log(&self) -> Vec<(CallId, Endpoint)> {
        self.sent.lock().clone()
    }

    /// Resolves the oldest pending send with a reply computed by `reply`.
    ///
    /// Returns false if nothing was pending.
    pub fn deliver_next(
        &self,
        reply: impl FnOnce(&Endpoint, &Q) -> Result<V, TransportError>,
    ) -> bool {
        let Some(in_flight) = self.pending.lock().pop_front() else {
            return false;
        };
        match reply(&in_flight.target, &in_flight.request) {
            Ok(value) => in_flight.sink.resolve(value),
            Err(error) => in_flight.sink.fail(error),
        }
        true
    }

    /// Resolves every pending send (including ones queued by the deliveries
    /// themselves) with replies computed by `reply`.
    ///
    /// Returns the number of replies delivered.
    pub fn deliver_all_with(
        &self,
        mut reply: impl FnMut(&Endpoint, &Q) -> Result<V, TransportError>,
    ) -> usize {
        let mut delivered = 0;
        while self.deliver_next(&mut reply) {
            delivered += 1;
        }
        delivered
    }

    /// Fails the oldest pending send. Returns false if nothing was pending.
    pub fn fail_next(&self, error: TransportError) -> bool {
        let Some(in_flight) = self.pending.lock().pop_front() else {
            return false;
        };
        in_flight.sink.fail(error);
        true
    }
}

impl<Q: Send, V: Send> Transport<Q, V> for LabTransport<Q, V> {
    fn send(&self, target: &Endpoint, request: Q, sink: ReplySink<V>) {
        tracing::trace!(call = %sink.call(), target = %target, "lab transport captured send");
        self.sent.lock().push((sink.call(), target.clone()));
        self.pending.lock().push_back(InFlight {
            target: target.clone(),
            request,
            sink,
        });
    }
}

/// A transport double that computes replies inline.
///
/// The sink resolves on the sender's thread before `send` returns, which is
/// the most hostile interleaving for reconciliation: the real reply can land
/// before the speculative run has finished.
pub struct FnTransport<F> {
    reply: F,
}

impl<F> FnTransport<F> {
    /// Creates a transport that answers every send with `reply`.
    #[must_use]
    pub const fn new(reply: F) -> Self {
        Self { reply }
    }
}

impl<Q, V, F> Transport<Q, V> for FnTransport<F>
where
    F: Fn(&Endpoint, &Q) -> Result<V, TransportError> + Send + Sync,
{
    fn send(&self, target: &Endpoint, request: Q, sink: ReplySink<V>) {
        match (self.reply)(target, &request) {
            Ok(value) => sink.resolve(value),
            Err(error) => sink.fail(error),
        }
    }
}
