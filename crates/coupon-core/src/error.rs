//! Error types for claim coordination and code administration.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CouponError {
    #[error("cooldown active: retry in {remaining_secs}s")] Blocked { remaining_secs: u64 },
    #[error("no codes available")] PoolExhausted,
    #[error("code already exists: {0}")] DuplicateCode(String),
    #[error("invalid input: {0}")] InvalidInput(String),
    #[error("storage: {0}")] Storage(String),
}

impl CouponError {
    /// Whether the caller caused this error (as opposed to the store).
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Storage(_))
    }
}
