//! Concurrent claim tests.
//!
//! Many threads race through the coordinator at the same instant. Whatever
//! the interleaving, each code goes to at most one claimant and each
//! identity gets at most one code per window.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use rand::seq::SliceRandom;
use coupon_core::coordinator::{ClaimCoordinator, RecyclePolicy};
use coupon_core::error::CouponError;
use coupon_core::identity::Identity;
use coupon_core::store::CouponStore;
use coupon_core::types::Code;
use coupon_tests::helpers::*;

const WINDOW: Duration = Duration::from_secs(3600);

/// Run one claim per identity, all released from a barrier together.
fn race(coordinator: Arc<ClaimCoordinator>, identities: Vec<Identity>) -> Vec<Result<Code, CouponError>> {
    let barrier = Arc::new(Barrier::new(identities.len()));
    let handles: Vec<_> = identities
        .into_iter()
        .map(|identity| {
            let coordinator = Arc::clone(&coordinator);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                coordinator.claim(&identity, at(0))
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn assert_exclusive(store: Arc<dyn CouponStore>, visitors: u32, codes: usize) {
    let coordinator = Arc::new(coordinator(
        Arc::clone(&store),
        WINDOW,
        RecyclePolicy::Expire,
        &code_values(codes),
    ));
    let mut identities: Vec<Identity> = (0..visitors).map(|n| visitor(&coordinator, n)).collect();
    identities.shuffle(&mut rand::thread_rng());
    let results = race(Arc::clone(&coordinator), identities);

    let won: Vec<&Code> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    let distinct: HashSet<&str> = won.iter().map(|c| c.value.as_str()).collect();
    assert_eq!(won.len(), codes.min(visitors as usize));
    assert_eq!(distinct.len(), won.len(), "a code was handed out twice");

    let exhausted = results
        .iter()
        .filter(|r| matches!(r, Err(CouponError::PoolExhausted)))
        .count();
    assert_eq!(exhausted + won.len(), visitors as usize);

    let stats = store.stats().unwrap();
    assert_eq!(stats.claimed, won.len());
    for code in won {
        let stored = store.get_code(&code.value).unwrap().unwrap();
        assert_eq!(stored.claimed_by, code.claimed_by);
    }
}

#[test]
fn memory_store_hands_each_code_out_once() {
    assert_exclusive(memory_store(), 40, 10);
}

#[test]
fn rocks_store_hands_each_code_out_once() {
    let (store, _dir) = temp_rocks_store();
    assert_exclusive(store, 40, 10);
}

#[test]
fn more_codes_than_visitors_everyone_wins() {
    let (store, _dir) = temp_rocks_store();
    assert_exclusive(store, 12, 30);
}

#[test]
fn same_identity_racing_wins_once() {
    let (store, _dir) = temp_rocks_store();
    let coordinator = Arc::new(coordinator(
        Arc::clone(&store),
        WINDOW,
        RecyclePolicy::Expire,
        &code_values(10),
    ));
    let me = visitor(&coordinator, 7);
    let results = race(Arc::clone(&coordinator), vec![me; 16]);

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, CouponError::Blocked { .. }))
    );
    assert_eq!(store.stats().unwrap().claimed, 1);
}

#[test]
fn shared_ip_racing_wins_once() {
    let coordinator = Arc::new(coordinator(
        memory_store(),
        WINDOW,
        RecyclePolicy::Expire,
        &code_values(10),
    ));
    // Same network address, different cookies: the IP key links them.
    let identities: Vec<Identity> = (0..8)
        .map(|n| {
            coordinator.resolve(&coupon_core::identity::RequestContext {
                ip: Some([203, 0, 113, 50].into()),
                cookie: Some(format!("00000000-0000-4000-8000-{n:012x}")),
                user_agent: None,
            })
        })
        .collect();
    let results = race(Arc::clone(&coordinator), identities);
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
}

#[test]
fn reset_policy_under_contention_never_duplicates_live_claims() {
    let coordinator = Arc::new(coordinator(
        memory_store(),
        WINDOW,
        RecyclePolicy::ResetOnExhaustion,
        &code_values(4),
    ));
    let identities = (0..20).map(|n| visitor(&coordinator, n)).collect();
    let results = race(Arc::clone(&coordinator), identities);

    // Every visitor gets a code because exhaustion resets the pool, and
    // between resets no code is issued twice.
    assert!(results.iter().all(|r| r.is_ok()));
    let stats = coordinator.pool().stats().unwrap();
    assert_eq!(stats.total, 4);
}
