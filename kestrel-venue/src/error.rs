//! Error taxonomy for venue interactions.

use thiserror::Error;

/// Unified error type returned by venue clients.
#[derive(Debug, Error)]
pub enum VenueError {
    /// Network-level failure (connection refused, timeout, TLS).
    #[error("transport error: {0}")]
    Transport(String),

    /// The venue told us to slow down.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The venue rejected the request (insufficient margin, bad order, ...).
    #[error("venue rejected request: {0}")]
    Exchange(String),

    /// A payload failed to parse into the normalized types.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The request was invalid before it ever reached the venue.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Catch-all for errors that fit no other category.
    #[error("venue error: {0}")]
    Other(String),
}

impl VenueError {
    /// Whether the error is a transient rate limit worth retrying.
    #[must_use]
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

/// Convenience alias used throughout the venue traits.
pub type VenueResult<T> = Result<T, VenueError>;
