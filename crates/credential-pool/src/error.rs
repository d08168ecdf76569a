//! Error types for credential admission

/// Errors from bucket and pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("context cancelled while waiting for rate limit capacity")]
    Cancelled,
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
