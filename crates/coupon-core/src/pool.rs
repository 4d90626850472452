//! The pool of distributable codes.
//!
//! [`CodePool::claim_one`] is the operation the whole system exists to
//! protect: each code goes to at most one claimant at any instant. The
//! guarantee comes from the store, which applies every code transition
//! atomically; this type adds validation and logging on top.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::CouponError;
use crate::store::CouponStore;
use crate::types::{validate_code_value, BulkAddReport, Code, PoolStats};

#[derive(Clone)]
pub struct CodePool {
    store: Arc<dyn CouponStore>,
}

impl CodePool {
    pub fn new(store: Arc<dyn CouponStore>) -> Self {
        Self { store }
    }

    /// Claim the earliest-inserted available code for `claimant`.
    pub fn claim_one(&self, claimant: &str, now: DateTime<Utc>) -> Result<Option<Code>, CouponError> {
        let code = self.store.claim_first_available(claimant, now)?;
        if let Some(code) = &code {
            debug!(code = %code.value, seq = code.seq, "pool: code claimed");
        }
        Ok(code)
    }

    /// Add one code.
    ///
    /// # Errors
    ///
    /// - [`CouponError::InvalidInput`] if the value fails validation
    /// - [`CouponError::DuplicateCode`] if the value is already in the pool
    pub fn add(&self, value: &str, now: DateTime<Utc>) -> Result<Code, CouponError> {
        validate_code_value(value)?;
        let code = self.store.insert_code(value, now)?;
        info!(code = %code.value, "pool: code added");
        Ok(code)
    }

    /// Add many codes. Every value is validated before anything is inserted;
    /// values already present (or repeated in `values`) are skipped.
    pub fn add_many(&self, values: &[String], now: DateTime<Utc>) -> Result<BulkAddReport, CouponError> {
        for value in values {
            validate_code_value(value)?;
        }

        let mut report = BulkAddReport::default();
        let mut seen = HashSet::new();
        for value in values {
            if !seen.insert(value.as_str()) {
                report.skipped.push(value.clone());
                continue;
            }
            match self.store.insert_code(value, now) {
                Ok(_) => report.added.push(value.clone()),
                Err(CouponError::DuplicateCode(_)) => report.skipped.push(value.clone()),
                Err(e) => return Err(e),
            }
        }
        info!(
            added = report.added.len(),
            skipped = report.skipped.len(),
            "pool: bulk add"
        );
        Ok(report)
    }

    /// Insert the default set if, and only if, the pool is empty.
    pub fn seed(&self, values: &[String], now: DateTime<Utc>) -> Result<usize, CouponError> {
        for value in values {
            validate_code_value(value)?;
        }
        let inserted = self.store.seed_if_empty(values, now)?;
        if inserted > 0 {
            info!(inserted, "pool: seeded initial codes");
        }
        Ok(inserted)
    }

    /// Return codes claimed strictly before `older_than` to the pool.
    pub fn release_expired(&self, older_than: DateTime<Utc>) -> Result<usize, CouponError> {
        self.store.release_claimed_before(older_than)
    }

    /// Return every claimed code to the pool.
    pub fn reset_all(&self) -> Result<usize, CouponError> {
        let released = self.store.release_all_claimed()?;
        info!(released, "pool: full reset");
        Ok(released)
    }

    pub fn stats(&self) -> Result<PoolStats, CouponError> {
        self.store.stats()
    }

    pub fn list(&self) -> Result<Vec<Code>, CouponError> {
        self.store.list_codes()
    }

    pub fn get(&self, value: &str) -> Result<Option<Code>, CouponError> {
        self.store.get_code(value)
    }
}
