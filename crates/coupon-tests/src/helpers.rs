//! Shared helpers for the integration tests.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use coupon_core::coordinator::{ClaimConfig, ClaimCoordinator, RecyclePolicy};
use coupon_core::identity::{Identity, IdentityResolver, RequestContext};
use coupon_core::store::{CouponStore, MemoryStore};
use coupon_node_lib::RocksStore;

/// Fixed base instant plus `secs`.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `n` distinct code values: `CODE000`, `CODE001`, ...
pub fn code_values(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("CODE{i:03}")).collect()
}

/// A RocksDB store in a fresh temp directory. Keep the `TempDir` alive.
pub fn temp_rocks_store() -> (Arc<dyn CouponStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = RocksStore::open(dir.path().join("db")).expect("open rocks store");
    (Arc::new(store), dir)
}

pub fn memory_store() -> Arc<dyn CouponStore> {
    Arc::new(MemoryStore::new())
}

/// Coordinator over `store` with the given window and policy, pre-loaded
/// with `codes`.
pub fn coordinator(
    store: Arc<dyn CouponStore>,
    cooldown: Duration,
    policy: RecyclePolicy,
    codes: &[String],
) -> ClaimCoordinator {
    let coordinator = ClaimCoordinator::new(
        store,
        IdentityResolver::new("integration"),
        ClaimConfig { cooldown, policy },
    );
    coordinator
        .pool()
        .add_many(codes, at(-10_000))
        .expect("load codes");
    coordinator
}

/// Visitor `n`: a distinct public IP and a distinct cookie.
pub fn visitor(coordinator: &ClaimCoordinator, n: u32) -> Identity {
    let ip: IpAddr = [198, 18, (n >> 8) as u8, n as u8].into();
    coordinator.resolve(&RequestContext {
        ip: Some(ip),
        cookie: Some(format!("00000000-0000-4000-8000-{n:012x}")),
        user_agent: Some("integration-test".into()),
    })
}
