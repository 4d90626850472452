//! Pool and ledger entities.
//!
//! A [`Code`] moves between [`CodeStatus::Available`] and
//! [`CodeStatus::Claimed`]; the claim fields are only ever populated together
//! with the `Claimed` status, which [`Code::claim`] and [`Code::release`]
//! maintain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_CODE_LEN;
use crate::error::CouponError;

/// Allocation state of a code.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CodeStatus {
    Available,
    Claimed,
}

/// One distributable promotional value.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Code {
    /// Insertion order; the pool hands out the lowest available sequence first.
    pub seq: u64,
    /// The promo value itself. Unique, case-sensitive, never changes.
    pub value: String,
    pub status: CodeStatus,
    /// Throttling key of the claimant, kept for auditing.
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Code {
    /// A fresh, available code.
    pub fn new(seq: u64, value: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            seq,
            value: value.into(),
            status: CodeStatus::Available,
            claimed_by: None,
            claimed_at: None,
            created_at,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == CodeStatus::Available
    }

    /// Mark as claimed by `claimant` at `at`.
    pub fn claim(&mut self, claimant: &str, at: DateTime<Utc>) {
        self.status = CodeStatus::Claimed;
        self.claimed_by = Some(claimant.to_string());
        self.claimed_at = Some(at);
    }

    /// Return to the available state, clearing the claim fields.
    pub fn release(&mut self) {
        self.status = CodeStatus::Available;
        self.claimed_by = None;
        self.claimed_at = None;
    }

    /// Whether this code is claimed and its claim is strictly older than `threshold`.
    pub fn claimed_before(&self, threshold: DateTime<Utc>) -> bool {
        self.status == CodeStatus::Claimed && self.claimed_at.is_some_and(|at| at < threshold)
    }
}

/// Last successful claim time for one throttling key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CooldownEntry {
    pub key: String,
    pub last_claim_at: DateTime<Utc>,
}

/// Pool occupancy counters.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub claimed: usize,
}

impl PoolStats {
    pub fn is_exhausted(&self) -> bool {
        self.available == 0
    }
}

/// Outcome of a bulk insert: which values went in and which were already present.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BulkAddReport {
    pub added: Vec<String>,
    pub skipped: Vec<String>,
}

/// Check that `value` is acceptable as a code.
///
/// The value is stored exactly as given; surrounding whitespace is not trimmed,
/// but a value consisting only of whitespace is rejected.
pub fn validate_code_value(value: &str) -> Result<(), CouponError> {
    if value.trim().is_empty() {
        return Err(CouponError::InvalidInput("code must not be empty".into()));
    }
    if value.len() > MAX_CODE_LEN {
        return Err(CouponError::InvalidInput(format!(
            "code longer than {MAX_CODE_LEN} bytes"
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(CouponError::InvalidInput(
            "code contains control characters".into(),
        ));
    }
    Ok(())
}
