//! Conformance tests for the speculation lifecycle: commit ordering,
//! cascading abort, replacement runs, and stale reply handling.

mod common;

use common::{blocking_chain, chain_stage, step, step_reply};
use parking_lot::Mutex;
use specular::test_utils::init_test_logging;
use specular::types::Endpoint;
use specular::{
    CallState, EngineConfig, FnTransport, IdentityContinuation, LabTransport, SpecFacade,
};
use std::sync::Arc;

fn lab_facade() -> (Arc<LabTransport<u32, u32>>, SpecFacade<u32, u32>) {
    let transport = Arc::new(LabTransport::new());
    let facade = SpecFacade::new(transport.clone(), EngineConfig::new());
    (transport, facade)
}

#[test]
fn parent_commits_only_after_children_settle() {
    init_test_logging();
    specular::test_phase!("parent_commits_only_after_children_settle");

    let (transport, facade) = lab_facade();
    let issued = Arc::new(Mutex::new(Vec::new()));
    let handle = facade
        .invoke("chain", 5, chain_stage(1, issued.clone()), |req| step(*req))
        .unwrap();
    let child = issued.lock()[0];

    // Root reply arrives first (FIFO). The root's guess is confirmed, but it
    // must not commit while its child is still speculative.
    assert!(transport.deliver_next(step_reply));
    specular::assert_with_log!(
        handle.try_result().is_none(),
        "root held by pending child",
        None::<()>,
        handle.try_result()
    );
    assert_eq!(handle.call_state(handle.call_id()), Some(CallState::Pending));

    // Child reply confirms; the cascade settles the child, then the root.
    assert!(transport.deliver_next(step_reply));
    assert_eq!(handle.call_state(child), Some(CallState::Committed));
    assert_eq!(
        handle.call_state(handle.call_id()),
        Some(CallState::Committed)
    );
    assert_eq!(handle.try_result(), Some(Ok(step(5))));

    specular::test_complete!("parent_commits_only_after_children_settle");
}

#[test]
fn three_level_cascade_aborts_with_one_root_retry() {
    init_test_logging();
    specular::test_phase!("three_level_cascade_aborts_with_one_root_retry");

    let (transport, facade) = lab_facade();
    let issued = Arc::new(Mutex::new(Vec::new()));

    // Wrong root guess: the speculative subtree below it is built on 999.
    let handle = facade
        .invoke("chain", 5, chain_stage(2, issued.clone()), |_| 999)
        .unwrap();
    let (old_c1, old_c2) = {
        let ids = issued.lock();
        (ids[0], ids[1])
    };
    assert_eq!(transport.pending_count(), 3);

    // The real root reply discredits the guess: the whole speculative
    // subtree aborts and the replacement run rebuilds it from the real value.
    assert!(transport.deliver_next(step_reply));
    assert_eq!(handle.call_state(handle.call_id()), Some(CallState::Aborted));
    assert_eq!(handle.call_state(old_c1), Some(CallState::Aborted));
    assert_eq!(handle.call_state(old_c2), Some(CallState::Aborted));
    assert_ne!(handle.current_root(), handle.call_id());

    // Replies for the discarded children are still in flight; they must be
    // discarded as stale while the rebuilt children confirm.
    let delivered = transport.deliver_all_with(|t, req| step_reply(t, req));
    assert_eq!(delivered, 4);

    assert_eq!(handle.try_result(), Some(Ok(step(5))));
    let leaf = *issued.lock().last().unwrap();
    specular::assert_with_log!(
        handle.committed_result(leaf) == Some(blocking_chain(5, 3)),
        "leaf value",
        Some(blocking_chain(5, 3)),
        handle.committed_result(leaf)
    );

    let snap = facade.stats();
    assert_eq!(snap.retries, 1, "exactly one root retry");
    assert_eq!(snap.stale_replies, 2, "both discarded children replied late");
    assert_eq!(snap.predictions_incorrect, 1);
    assert_eq!(snap.predictions_correct, 2);

    let ledger = handle.ledger_stats();
    assert!(ledger.is_quiescent());
    assert_eq!(ledger.created, 6);
    assert_eq!(ledger.aborted, 3);
    assert_eq!(ledger.committed, 3);

    specular::test_complete!("three_level_cascade_aborts_with_one_root_retry");
}

#[test]
fn every_call_reaches_exactly_one_terminal_state() {
    init_test_logging();

    let (transport, facade) = lab_facade();
    let issued = Arc::new(Mutex::new(Vec::new()));
    let handle = facade
        .invoke("chain", 3, chain_stage(2, issued.clone()), |_| 1000)
        .unwrap();
    transport.deliver_all_with(|t, req| step_reply(t, req));

    assert!(handle.is_settled());
    let stats = handle.ledger_stats();
    assert!(stats.is_quiescent());
    assert_eq!(stats.committed + stats.aborted, stats.created);
}

#[test]
fn final_result_is_never_a_guess() {
    init_test_logging();

    // Even with a wildly wrong guess the application observes only the
    // authoritative value.
    let transport = Arc::new(FnTransport::new(|_: &Endpoint, req: &u32| Ok(step(*req))));
    let facade: SpecFacade<u32, u32> = SpecFacade::new(transport, EngineConfig::new());
    let handle = facade
        .invoke("svc", 7, Box::new(IdentityContinuation::new()), |_| 123_456)
        .unwrap();
    assert_eq!(handle.try_result(), Some(Ok(step(7))));
}
