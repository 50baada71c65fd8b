//! Rate limiter errors.

use thiserror::Error;

/// Result type for rate limiter operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// The cost can never fit the window. Permanent, never retried.
    #[error("request too large for rate limit window {window} of {key}: cost {cost} exceeds limit {limit}")]
    RequestTooLarge {
        key: String,
        window: String,
        cost: u64,
        limit: u64,
    },

    #[error("cancelled while waiting for rate limit")]
    Cancelled,
}

impl RateLimitError {
    pub fn is_retriable(&self) -> bool {
        false
    }
}
