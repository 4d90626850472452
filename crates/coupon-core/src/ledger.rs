//! Cooldown ledger: last successful claim time per throttling key.
//!
//! Entries never expire on their own. Whether a key is blocked is computed
//! at check time from `last_claim_at` and the configured window, so stale
//! entries are harmless.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::CouponError;
use crate::store::CouponStore;

/// Result of a cooldown check across all keys of an identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CooldownVerdict {
    pub blocked: bool,
    /// Longest remaining wait among the blocking keys, rounded up to whole
    /// seconds. Zero when not blocked.
    pub remaining_secs: u64,
}

impl CooldownVerdict {
    pub const CLEAR: Self = Self {
        blocked: false,
        remaining_secs: 0,
    };
}

/// Seconds left before a key that last claimed at `last` may claim again,
/// or `None` if the window has passed.
///
/// A `last` in the future (clock skew) counts as a claim made right now.
pub fn remaining_secs(last: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> Option<u64> {
    let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
    let elapsed_ms = (now - last).num_milliseconds().max(0);
    if elapsed_ms >= window_ms {
        return None;
    }
    let left_ms = (window_ms - elapsed_ms).unsigned_abs();
    Some(left_ms.div_ceil(1000))
}

/// Per-key cooldown tracking on top of a [`CouponStore`].
#[derive(Clone)]
pub struct CooldownLedger {
    store: Arc<dyn CouponStore>,
    window: Duration,
}

impl CooldownLedger {
    pub fn new(store: Arc<dyn CouponStore>, window: Duration) -> Self {
        Self { store, window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Any blocking key blocks the request; the longest wait wins.
    pub fn is_blocked(&self, keys: &[String], now: DateTime<Utc>) -> Result<CooldownVerdict, CouponError> {
        let mut verdict = CooldownVerdict::CLEAR;
        for key in keys {
            let Some(entry) = self.store.get_cooldown(key)? else {
                continue;
            };
            if let Some(left) = remaining_secs(entry.last_claim_at, now, self.window) {
                debug!(%key, remaining_secs = left, "ledger: key cooling down");
                verdict.blocked = true;
                verdict.remaining_secs = verdict.remaining_secs.max(left);
            }
        }
        Ok(verdict)
    }

    /// Record a successful claim for every key. Call only after a code was allocated.
    pub fn record_claim(&self, keys: &[String], at: DateTime<Utc>) -> Result<(), CouponError> {
        self.store.upsert_cooldowns(keys, at)
    }

    /// Drop every entry. Test environments only.
    pub fn clear(&self) -> Result<usize, CouponError> {
        self.store.clear_cooldowns()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn ledger(window_secs: u64) -> CooldownLedger {
        CooldownLedger::new(Arc::new(MemoryStore::new()), Duration::from_secs(window_secs))
    }

    #[test]
    fn unknown_keys_are_clear() {
        let ledger = ledger(60);
        let verdict = ledger.is_blocked(&["ip:a".into(), "cookie:b".into()], t(0)).unwrap();
        assert_eq!(verdict, CooldownVerdict::CLEAR);
    }

    #[test]
    fn blocked_inside_window_clear_after() {
        let ledger = ledger(60);
        let keys = vec!["ip:a".to_string()];
        ledger.record_claim(&keys, t(0)).unwrap();

        let v = ledger.is_blocked(&keys, t(30)).unwrap();
        assert!(v.blocked);
        assert_eq!(v.remaining_secs, 30);

        assert!(ledger.is_blocked(&keys, t(59)).unwrap().blocked);
        assert!(!ledger.is_blocked(&keys, t(60)).unwrap().blocked);
    }

    #[test]
    fn any_key_blocks_and_longest_wait_wins() {
        let ledger = ledger(60);
        ledger.record_claim(&["ip:a".into()], t(0)).unwrap();
        ledger.record_claim(&["cookie:b".into()], t(20)).unwrap();

        let v = ledger
            .is_blocked(&["cookie:zzz".into(), "ip:a".into(), "cookie:b".into()], t(30))
            .unwrap();
        assert!(v.blocked);
        assert_eq!(v.remaining_secs, 50);
    }

    #[test]
    fn remaining_rounds_up() {
        let last = t(0);
        let now = last + chrono::Duration::milliseconds(500);
        assert_eq!(remaining_secs(last, now, Duration::from_secs(60)), Some(60));
    }

    #[test]
    fn future_timestamp_counts_as_now() {
        assert_eq!(remaining_secs(t(100), t(0), Duration::from_secs(60)), Some(60));
    }

    #[test]
    fn clear_drops_entries() {
        let ledger = ledger(60);
        ledger.record_claim(&["a".into(), "b".into()], t(0)).unwrap();
        assert_eq!(ledger.clear().unwrap(), 2);
        assert!(!ledger.is_blocked(&["a".into()], t(1)).unwrap().blocked);
    }

    proptest! {
        #[test]
        fn remaining_never_increases(window in 1u64..7200, steps in prop::collection::vec(0i64..500, 1..20)) {
            let window = Duration::from_secs(window);
            let last = t(0);
            let mut now = last;
            let mut prev = u64::MAX;
            for step in steps {
                now += chrono::Duration::seconds(step);
                let left = remaining_secs(last, now, window).unwrap_or(0);
                prop_assert!(left <= prev);
                prop_assert!(left <= window.as_secs());
                prev = left;
            }
        }
    }
}
