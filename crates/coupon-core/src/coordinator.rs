//! Per-request claim orchestration.
//!
//! ```text
//! resolve identity -> check cooldown -> Blocked
//!                                    -> allocate -> Exhausted (after optional reset + one retry)
//!                                                -> record cooldown -> Claimed
//! ```
//!
//! The check, allocation and record run under one claim lock, so two
//! concurrent requests from the same visitor cannot both pass the cooldown
//! check. Once a code is allocated it stays allocated: a failed cooldown write
//! is retried once and then logged, never rolled back.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::constants::DEFAULT_COOLDOWN_SECS;
use crate::error::CouponError;
use crate::identity::{Identity, IdentityResolver, RequestContext};
use crate::ledger::CooldownLedger;
use crate::pool::CodePool;
use crate::store::CouponStore;
use crate::types::Code;

/// How claimed codes find their way back into the pool.
///
/// Exactly one policy is active per deployment; mixing them would let one
/// code be recycled by expiry while another waits for a full reset.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RecyclePolicy {
    /// The sweeper releases each code once its claim is older than the cooldown window.
    #[default]
    Expire,
    /// No sweeper; the coordinator releases every code when the pool runs dry.
    ResetOnExhaustion,
}

impl RecyclePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expire => "expire",
            Self::ResetOnExhaustion => "reset-on-exhaustion",
        }
    }

    /// Whether the background sweeper should run under this policy.
    pub fn runs_sweeper(&self) -> bool {
        matches!(self, Self::Expire)
    }
}

impl fmt::Display for RecyclePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecyclePolicy {
    type Err = CouponError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "expire" => Ok(Self::Expire),
            "reset-on-exhaustion" | "reset" => Ok(Self::ResetOnExhaustion),
            other => Err(CouponError::InvalidInput(format!(
                "unknown recycle policy: {other}"
            ))),
        }
    }
}

/// Tunables for [`ClaimCoordinator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimConfig {
    /// Minimum time between successful claims for one throttling key.
    pub cooldown: Duration,
    pub policy: RecyclePolicy,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(DEFAULT_COOLDOWN_SECS),
            policy: RecyclePolicy::default(),
        }
    }
}

/// Orchestrates identity resolution, cooldown checks and code allocation.
pub struct ClaimCoordinator {
    resolver: IdentityResolver,
    ledger: CooldownLedger,
    pool: CodePool,
    policy: RecyclePolicy,
    /// Serializes check → allocate → record.
    claim_lock: Mutex<()>,
}

impl ClaimCoordinator {
    pub fn new(store: Arc<dyn CouponStore>, resolver: IdentityResolver, config: ClaimConfig) -> Self {
        Self {
            resolver,
            ledger: CooldownLedger::new(Arc::clone(&store), config.cooldown),
            pool: CodePool::new(store),
            policy: config.policy,
            claim_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &CodePool {
        &self.pool
    }

    pub fn ledger(&self) -> &CooldownLedger {
        &self.ledger
    }

    pub fn policy(&self) -> RecyclePolicy {
        self.policy
    }

    pub fn resolve(&self, ctx: &RequestContext) -> Identity {
        self.resolver.resolve(ctx)
    }

    /// Try to allocate one code to `identity`.
    ///
    /// # Errors
    ///
    /// - [`CouponError::Blocked`] if any of the identity's keys is cooling down
    /// - [`CouponError::PoolExhausted`] if no code could be allocated
    /// - [`CouponError::Storage`] if the store failed before allocation
    pub fn claim(&self, identity: &Identity, now: DateTime<Utc>) -> Result<Code, CouponError> {
        let keys = identity.storage_keys();
        let _guard = self.claim_lock.lock();

        let verdict = self.ledger.is_blocked(&keys, now)?;
        if verdict.blocked {
            info!(
                claimant = %identity.primary_key(),
                remaining_secs = verdict.remaining_secs,
                "claim: blocked by cooldown"
            );
            return Err(CouponError::Blocked {
                remaining_secs: verdict.remaining_secs,
            });
        }

        let claimant = identity.primary_key();
        let code = match self.pool.claim_one(&claimant, now)? {
            Some(code) => code,
            None => match self.retry_after_reset(&claimant, now)? {
                Some(code) => code,
                None => {
                    info!(%claimant, "claim: pool exhausted");
                    return Err(CouponError::PoolExhausted);
                }
            },
        };

        self.record_cooldown(&keys, &code, now);
        info!(code = %code.value, %claimant, "claim: code allocated");
        Ok(code)
    }

    /// Under [`RecyclePolicy::ResetOnExhaustion`], release the whole pool if
    /// nothing is available and try exactly once more.
    fn retry_after_reset(&self, claimant: &str, now: DateTime<Utc>) -> Result<Option<Code>, CouponError> {
        if self.policy != RecyclePolicy::ResetOnExhaustion {
            return Ok(None);
        }
        if self.pool.stats()?.is_exhausted() {
            self.pool.reset_all()?;
        }
        self.pool.claim_one(claimant, now)
    }

    fn record_cooldown(&self, keys: &[String], code: &Code, now: DateTime<Utc>) {
        let Err(first) = self.ledger.record_claim(keys, now) else {
            return;
        };
        warn!(error = %first, code = %code.value, "claim: cooldown write failed, retrying");
        if let Err(e) = self.ledger.record_claim(keys, now) {
            error!(error = %e, code = %code.value, "claim: cooldown not recorded; code stays claimed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{CooldownEntry, PoolStats};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const COOKIE_X: &str = "00000000-0000-4000-8000-00000000000a";
    const COOKIE_Y: &str = "00000000-0000-4000-8000-00000000000b";
    const COOKIE_Z: &str = "00000000-0000-4000-8000-00000000000c";

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn visitor(ip: &str, cookie: &str) -> RequestContext {
        RequestContext {
            ip: Some(ip.parse().unwrap()),
            cookie: Some(cookie.to_string()),
            user_agent: None,
        }
    }

    fn setup(codes: &[&str], policy: RecyclePolicy) -> (ClaimCoordinator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let coordinator = ClaimCoordinator::new(
            store.clone(),
            IdentityResolver::new("test"),
            ClaimConfig {
                cooldown: Duration::from_secs(60),
                policy,
            },
        );
        for c in codes {
            coordinator.pool().add(c, t(-100)).unwrap();
        }
        (coordinator, store)
    }

    #[test]
    fn walkthrough_two_codes_three_visitors() {
        let (coord, store) = setup(&["A", "B"], RecyclePolicy::Expire);
        let x = coord.resolve(&visitor("203.0.113.1", COOKIE_X));
        let y = coord.resolve(&visitor("203.0.113.2", COOKIE_Y));
        let z = coord.resolve(&visitor("203.0.113.3", COOKIE_Z));

        assert_eq!(coord.claim(&x, t(0)).unwrap().value, "A");
        assert_eq!(
            coord.claim(&x, t(30)),
            Err(CouponError::Blocked { remaining_secs: 30 })
        );
        assert_eq!(coord.claim(&y, t(30)).unwrap().value, "B");
        assert_eq!(coord.claim(&z, t(31)), Err(CouponError::PoolExhausted));
        for key in z.storage_keys() {
            assert!(store.get_cooldown(&key).unwrap().is_none());
        }

        // Sweep at t=61 with a 60s window.
        let released = coord.pool().release_expired(t(61) - chrono::Duration::seconds(60)).unwrap();
        assert_eq!(released, 1);
        assert!(coord.pool().get("A").unwrap().unwrap().is_available());
        assert!(!coord.pool().get("B").unwrap().unwrap().is_available());
    }

    #[test]
    fn cookie_alone_blocks_new_ip() {
        let (coord, _) = setup(&["A", "B"], RecyclePolicy::Expire);
        let first = coord.resolve(&visitor("203.0.113.1", COOKIE_X));
        coord.claim(&first, t(0)).unwrap();

        let moved = coord.resolve(&visitor("198.51.100.9", COOKIE_X));
        assert!(matches!(coord.claim(&moved, t(10)), Err(CouponError::Blocked { .. })));
    }

    #[test]
    fn ip_alone_blocks_new_cookie() {
        let (coord, _) = setup(&["A", "B"], RecyclePolicy::Expire);
        coord.claim(&coord.resolve(&visitor("203.0.113.1", COOKIE_X)), t(0)).unwrap();
        let cleared = coord.resolve(&visitor("203.0.113.1", COOKIE_Y));
        assert!(matches!(coord.claim(&cleared, t(5)), Err(CouponError::Blocked { .. })));
    }

    #[test]
    fn claims_again_after_window() {
        let (coord, _) = setup(&["A", "B"], RecyclePolicy::Expire);
        let x = coord.resolve(&visitor("203.0.113.1", COOKIE_X));
        coord.claim(&x, t(0)).unwrap();
        assert_eq!(coord.claim(&x, t(60)).unwrap().value, "B");
    }

    #[test]
    fn records_claimant_as_primary_key() {
        let (coord, store) = setup(&["A"], RecyclePolicy::Expire);
        let x = coord.resolve(&visitor("203.0.113.1", COOKIE_X));
        let code = coord.claim(&x, t(0)).unwrap();
        assert_eq!(code.claimed_by, Some(x.primary_key()));
        for key in x.storage_keys() {
            assert_eq!(
                store.get_cooldown(&key).unwrap(),
                Some(CooldownEntry { key: key.clone(), last_claim_at: t(0) })
            );
        }
    }

    #[test]
    fn expire_policy_never_resets() {
        let (coord, _) = setup(&["A"], RecyclePolicy::Expire);
        coord.claim(&coord.resolve(&visitor("203.0.113.1", COOKIE_X)), t(0)).unwrap();
        let y = coord.resolve(&visitor("203.0.113.2", COOKIE_Y));
        assert_eq!(coord.claim(&y, t(1)), Err(CouponError::PoolExhausted));
        assert_eq!(coord.pool().stats().unwrap().available, 0);
    }

    #[test]
    fn reset_policy_recycles_exhausted_pool() {
        let (coord, _) = setup(&["A", "B"], RecyclePolicy::ResetOnExhaustion);
        coord.claim(&coord.resolve(&visitor("203.0.113.1", COOKIE_X)), t(0)).unwrap();
        coord.claim(&coord.resolve(&visitor("203.0.113.2", COOKIE_Y)), t(1)).unwrap();

        let z = coord.resolve(&visitor("203.0.113.3", COOKIE_Z));
        assert_eq!(coord.claim(&z, t(2)).unwrap().value, "A");
        assert_eq!(
            coord.pool().stats().unwrap(),
            PoolStats { total: 2, available: 1, claimed: 1 }
        );
    }

    #[test]
    fn reset_policy_with_empty_pool_is_exhausted() {
        let (coord, store) = setup(&[], RecyclePolicy::ResetOnExhaustion);
        let x = coord.resolve(&visitor("203.0.113.1", COOKIE_X));
        assert_eq!(coord.claim(&x, t(0)), Err(CouponError::PoolExhausted));
        assert_eq!(store.cooldown_count(), 0);
    }

    #[test]
    fn policy_parses_and_displays() {
        assert_eq!("expire".parse::<RecyclePolicy>().unwrap(), RecyclePolicy::Expire);
        assert_eq!(
            "Reset-On-Exhaustion".parse::<RecyclePolicy>().unwrap(),
            RecyclePolicy::ResetOnExhaustion
        );
        assert!("sometimes".parse::<RecyclePolicy>().is_err());
        assert_eq!(RecyclePolicy::ResetOnExhaustion.to_string(), "reset-on-exhaustion");
        assert!(RecyclePolicy::Expire.runs_sweeper());
        assert!(!RecyclePolicy::ResetOnExhaustion.runs_sweeper());
    }

    /// Delegates to a [`MemoryStore`] but fails the first `failures` cooldown writes.
    struct FlakyLedgerStore {
        inner: MemoryStore,
        failures: AtomicUsize,
    }

    impl CouponStore for FlakyLedgerStore {
        fn insert_code(&self, value: &str, at: DateTime<Utc>) -> Result<Code, CouponError> {
            self.inner.insert_code(value, at)
        }
        fn seed_if_empty(&self, values: &[String], at: DateTime<Utc>) -> Result<usize, CouponError> {
            self.inner.seed_if_empty(values, at)
        }
        fn get_code(&self, value: &str) -> Result<Option<Code>, CouponError> {
            self.inner.get_code(value)
        }
        fn list_codes(&self) -> Result<Vec<Code>, CouponError> {
            self.inner.list_codes()
        }
        fn stats(&self) -> Result<PoolStats, CouponError> {
            self.inner.stats()
        }
        fn claim_first_available(&self, claimant: &str, at: DateTime<Utc>) -> Result<Option<Code>, CouponError> {
            self.inner.claim_first_available(claimant, at)
        }
        fn release_claimed_before(&self, threshold: DateTime<Utc>) -> Result<usize, CouponError> {
            self.inner.release_claimed_before(threshold)
        }
        fn release_all_claimed(&self) -> Result<usize, CouponError> {
            self.inner.release_all_claimed()
        }
        fn get_cooldown(&self, key: &str) -> Result<Option<CooldownEntry>, CouponError> {
            self.inner.get_cooldown(key)
        }
        fn upsert_cooldowns(&self, keys: &[String], at: DateTime<Utc>) -> Result<(), CouponError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(CouponError::Storage("disk full".into()));
            }
            self.inner.upsert_cooldowns(keys, at)
        }
        fn clear_cooldowns(&self) -> Result<usize, CouponError> {
            self.inner.clear_cooldowns()
        }
    }

    fn flaky(failures: usize) -> (ClaimCoordinator, Arc<FlakyLedgerStore>) {
        let store = Arc::new(FlakyLedgerStore {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(failures),
        });
        let coord = ClaimCoordinator::new(
            store.clone(),
            IdentityResolver::new("test"),
            ClaimConfig { cooldown: Duration::from_secs(60), policy: RecyclePolicy::Expire },
        );
        coord.pool().add("A", t(0)).unwrap();
        (coord, store)
    }

    #[test]
    fn cooldown_write_is_retried_once() {
        let (coord, store) = flaky(1);
        let x = coord.resolve(&visitor("203.0.113.1", COOKIE_X));
        coord.claim(&x, t(0)).unwrap();
        assert!(store.inner.cooldown_count() > 0);
    }

    #[test]
    fn failed_cooldown_write_keeps_code_claimed() {
        let (coord, store) = flaky(2);
        let x = coord.resolve(&visitor("203.0.113.1", COOKIE_X));
        let code = coord.claim(&x, t(0)).unwrap();
        assert_eq!(code.value, "A");
        assert!(!coord.pool().get("A").unwrap().unwrap().is_available());
        assert_eq!(store.inner.cooldown_count(), 0);
    }
}
