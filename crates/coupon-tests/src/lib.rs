//! Integration test suite for Coupon Drop.
//!
//! Exercises the claim path end to end against both store implementations,
//! with particular attention to concurrent claims and recycling.

pub mod helpers;
