//! Defaults and limits shared by the server, the CLI and the stores.

/// Cooldown between successful claims for one throttling key, in seconds.
pub const DEFAULT_COOLDOWN_SECS: u64 = 3600;

/// Interval between expiry sweeps, in seconds.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

/// Codes inserted when the pool is empty at startup.
pub const DEFAULT_SEED_CODES: &[&str] = &["DISC10", "SAVE20", "FREE15", "OFFER25", "DEAL30"];

/// Longest accepted code value, in bytes.
pub const MAX_CODE_LEN: usize = 64;

/// Name of the identity cookie.
pub const IDENTITY_COOKIE: &str = "coupon_session";

/// Lifetime of the identity cookie (one year).
pub const IDENTITY_COOKIE_MAX_AGE_SECS: u64 = 365 * 24 * 60 * 60;
