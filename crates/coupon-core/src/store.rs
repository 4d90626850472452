//! Persistence interface and in-memory implementation.
//!
//! Provides the [`CouponStore`] trait covering both the code pool and the
//! cooldown ledger. [`MemoryStore`] is suitable for tests; the server uses
//! RocksDB (coupon-node).
//!
//! Every method that changes a code must apply the change atomically with
//! respect to every other such method: a claim and a concurrent release can
//! never both act on the same code.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::CouponError;
use crate::types::{Code, CooldownEntry, PoolStats};

/// Shared storage for codes and cooldown entries.
///
/// Implementations synchronize internally; all methods take `&self` so one
/// handle can be shared across request tasks and the sweeper.
pub trait CouponStore: Send + Sync {
    /// Insert a new available code.
    ///
    /// # Errors
    ///
    /// - [`CouponError::DuplicateCode`] if `value` already exists (exact match)
    fn insert_code(&self, value: &str, at: DateTime<Utc>) -> Result<Code, CouponError>;

    /// Insert `values` only if the pool holds no codes at all.
    ///
    /// Returns the number of codes inserted (zero when the pool was not empty).
    fn seed_if_empty(&self, values: &[String], at: DateTime<Utc>) -> Result<usize, CouponError>;

    /// Look up a code by value.
    fn get_code(&self, value: &str) -> Result<Option<Code>, CouponError>;

    /// All codes in insertion order.
    fn list_codes(&self) -> Result<Vec<Code>, CouponError>;

    fn stats(&self) -> Result<PoolStats, CouponError>;

    /// Atomically claim the available code with the lowest sequence number.
    ///
    /// Returns `None` when no code is available.
    fn claim_first_available(
        &self,
        claimant: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Code>, CouponError>;

    /// Release every code whose claim is strictly older than `threshold`.
    fn release_claimed_before(&self, threshold: DateTime<Utc>) -> Result<usize, CouponError>;

    /// Release every claimed code.
    fn release_all_claimed(&self) -> Result<usize, CouponError>;

    fn get_cooldown(&self, key: &str) -> Result<Option<CooldownEntry>, CouponError>;

    /// Set `last_claim_at = at` for every key, creating entries as needed.
    fn upsert_cooldowns(&self, keys: &[String], at: DateTime<Utc>) -> Result<(), CouponError>;

    /// Delete all cooldown entries, returning how many there were.
    fn clear_cooldowns(&self) -> Result<usize, CouponError>;
}

#[derive(Default)]
struct MemoryState {
    /// Codes keyed by sequence number.
    codes: BTreeMap<u64, Code>,
    /// Code value → sequence number.
    index: HashMap<String, u64>,
    cooldowns: HashMap<String, DateTime<Utc>>,
    next_seq: u64,
}

impl MemoryState {
    fn insert(&mut self, value: &str, at: DateTime<Utc>) -> Code {
        let seq = self.next_seq;
        self.next_seq += 1;
        let code = Code::new(seq, value, at);
        self.index.insert(value.to_string(), seq);
        self.codes.insert(seq, code.clone());
        code
    }
}

/// In-memory store for testing.
///
/// A single mutex guards all state, which makes every operation trivially
/// atomic. Nothing is persisted.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cooldown entries currently held.
    pub fn cooldown_count(&self) -> usize {
        self.state.lock().cooldowns.len()
    }
}

impl CouponStore for MemoryStore {
    fn insert_code(&self, value: &str, at: DateTime<Utc>) -> Result<Code, CouponError> {
        let mut state = self.state.lock();
        if state.index.contains_key(value) {
            return Err(CouponError::DuplicateCode(value.to_string()));
        }
        Ok(state.insert(value, at))
    }

    fn seed_if_empty(&self, values: &[String], at: DateTime<Utc>) -> Result<usize, CouponError> {
        let mut state = self.state.lock();
        if !state.codes.is_empty() {
            return Ok(0);
        }
        let mut inserted = 0;
        for value in values {
            if !state.index.contains_key(value) {
                state.insert(value, at);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn get_code(&self, value: &str) -> Result<Option<Code>, CouponError> {
        let state = self.state.lock();
        Ok(state
            .index
            .get(value)
            .and_then(|seq| state.codes.get(seq))
            .cloned())
    }

    fn list_codes(&self) -> Result<Vec<Code>, CouponError> {
        Ok(self.state.lock().codes.values().cloned().collect())
    }

    fn stats(&self) -> Result<PoolStats, CouponError> {
        let state = self.state.lock();
        let available = state.codes.values().filter(|c| c.is_available()).count();
        Ok(PoolStats {
            total: state.codes.len(),
            available,
            claimed: state.codes.len() - available,
        })
    }

    fn claim_first_available(
        &self,
        claimant: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Code>, CouponError> {
        let mut state = self.state.lock();
        Ok(state
            .codes
            .values_mut()
            .find(|c| c.is_available())
            .map(|code| {
                code.claim(claimant, at);
                code.clone()
            }))
    }

    fn release_claimed_before(&self, threshold: DateTime<Utc>) -> Result<usize, CouponError> {
        let mut state = self.state.lock();
        let mut released = 0;
        for code in state.codes.values_mut().filter(|c| c.claimed_before(threshold)) {
            code.release();
            released += 1;
        }
        Ok(released)
    }

    fn release_all_claimed(&self) -> Result<usize, CouponError> {
        let mut state = self.state.lock();
        let mut released = 0;
        for code in state.codes.values_mut().filter(|c| !c.is_available()) {
            code.release();
            released += 1;
        }
        Ok(released)
    }

    fn get_cooldown(&self, key: &str) -> Result<Option<CooldownEntry>, CouponError> {
        Ok(self
            .state
            .lock()
            .cooldowns
            .get(key)
            .map(|at| CooldownEntry {
                key: key.to_string(),
                last_claim_at: *at,
            }))
    }

    fn upsert_cooldowns(&self, keys: &[String], at: DateTime<Utc>) -> Result<(), CouponError> {
        let mut state = self.state.lock();
        for key in keys {
            state.cooldowns.insert(key.clone(), at);
        }
        Ok(())
    }

    fn clear_cooldowns(&self) -> Result<usize, CouponError> {
        let mut state = self.state.lock();
        let count = state.cooldowns.len();
        state.cooldowns.clear();
        Ok(count)
    }
}
