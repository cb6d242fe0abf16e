//! Shared helpers for conformance tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use specular::types::Endpoint;
use specular::{
    CallId, Continuation, EngineConfig, FnContinuation, FnTransport, SpecContext, SpecFacade,
    TransportError,
};
use std::sync::Arc;

/// The arithmetic every fake service applies to its request.
pub fn step(req: u32) -> u32 {
    req * 2 + 1
}

/// Applies [`step`] `n` times: the blocking baseline for chain tests.
pub fn blocking_chain(request: u32, n: u32) -> u32 {
    (0..n).fold(request, |v, _| step(v))
}

/// A facade whose transport computes [`step`] inline.
pub fn step_facade() -> SpecFacade<u32, u32> {
    step_facade_with(EngineConfig::new())
}

/// A [`step`] facade with a custom configuration.
pub fn step_facade_with(config: EngineConfig<u32>) -> SpecFacade<u32, u32> {
    let transport = Arc::new(FnTransport::new(|_: &Endpoint, req: &u32| Ok(step(*req))));
    SpecFacade::new(transport, config)
}

/// Builds a continuation chain of `remaining` further stages.
///
/// Each stage receives its reply value, issues the next stage as a child call
/// with that value as the request, and returns the value unchanged. Child
/// call IDs are appended to `issued` in creation order, so the last entry
/// after a clean run is the leaf.
pub fn chain_stage(
    remaining: u32,
    issued: Arc<Mutex<Vec<CallId>>>,
) -> Box<dyn Continuation<u32, u32>> {
    Box::new(FnContinuation::new(
        move |cx: &mut SpecContext<'_, u32, u32>, value: u32| {
            if remaining > 0 {
                let child = cx.call(
                    "chain",
                    value,
                    chain_stage(remaining - 1, issued.clone()),
                    |req| step(*req),
                )?;
                issued.lock().push(child);
            }
            Ok(value)
        },
    ))
}

/// The correct reply function for pumping a `LabTransport` in chain tests.
pub fn step_reply(_: &Endpoint, req: &u32) -> Result<u32, TransportError> {
    Ok(step(*req))
}
