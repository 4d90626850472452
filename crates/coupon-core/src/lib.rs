//! # coupon-core
//! Claim coordination for single-use promo codes.
//!
//! - [`identity::IdentityResolver`] turns request signals into throttling keys
//! - [`ledger::CooldownLedger`] answers "is this visitor still cooling down"
//! - [`pool::CodePool`] hands out each code to at most one claimant
//! - [`coordinator::ClaimCoordinator`] ties the three together per request
//!
//! Persistence goes through the [`store::CouponStore`] trait; the
//! [`store::MemoryStore`] here is for tests, the server uses RocksDB
//! (coupon-node).

pub mod constants;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod pool;
pub mod store;
pub mod types;
