//! Convergence checking
//!
//! The central reconciliation property: whatever order commands and truths
//! interleave in, once everything settles the local state must equal the
//! state obtained by replaying only the confirmed truths in log.index
//! order.

use std::time::Duration;

use fabula_core::EventAspects;
use fabula_prophet::{ChronicleHandle, ChronicleSnapshot, Reducer, RegisterMap, RegisterReducer};

/// Replay a confirmed truth log through the reference reducer from
/// scratch.
pub fn replay_truths(truths: &[EventAspects]) -> RegisterMap {
    let reducer = RegisterReducer;
    let mut state = reducer.initial();
    for truth in truths {
        let (next, _) = reducer
            .apply(&state, &truth.delta)
            .expect("confirmed truth log must be replayable");
        state = next;
    }
    state
}

/// Wait until the chronicle has settled `truths` confirmed truths and has
/// no pending commands left.
pub async fn settled_snapshot(
    handle: &ChronicleHandle<RegisterMap>,
    truths: u64,
) -> ChronicleSnapshot<RegisterMap> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = handle.snapshot().await.expect("chronicle worker alive");
        if snapshot.truth_count >= truths && snapshot.pending_count == 0 {
            return snapshot;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "chronicle did not settle: {} truths, {} pending",
                snapshot.truth_count, snapshot.pending_count
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Assert the settled chronicle state equals the from-scratch replay of
/// `truths`.
pub async fn assert_rebase_equivalence(
    handle: &ChronicleHandle<RegisterMap>,
    truths: &[EventAspects],
) {
    let snapshot = settled_snapshot(handle, truths.len() as u64).await;
    let reference = replay_truths(truths);
    assert_eq!(
        snapshot.confirmed, reference,
        "confirmed state diverged from truth replay"
    );
    assert_eq!(
        snapshot.speculative, reference,
        "speculative state diverged after settling"
    );
}
