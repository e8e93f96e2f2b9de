//! Rejection types produced by the rate limiter.

use core::fmt;

/// Result type for consume operations.
pub type ConsumeResult = Result<(), RateLimitError>;

/// A rejected consume attempt.
///
/// Both variants are normal policy outcomes rather than failures of the
/// limiter itself; there is no fatal error class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// The request asks for more tokens than a bucket can ever hold.
    ///
    /// Permanent for this request: retrying with the same token count can
    /// never succeed, regardless of key or elapsed time.
    TokensExceedCapacity {
        /// Number of tokens the caller asked for.
        requested: u64,
        /// Configured maximum bucket capacity.
        capacity: u64,
    },

    /// The bucket for this key does not currently hold enough tokens.
    ///
    /// Transient: retrying after enough refill time may succeed.
    RateLimitExceeded {
        /// Key whose bucket rejected the request.
        key: String,
    },
}

impl RateLimitError {
    /// Returns `true` if retrying the same request later may succeed.
    ///
    /// Lets the boundary layer pick response semantics, e.g. attach a
    /// "retry later" hint only for transient rejections.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, RateLimitError::RateLimitExceeded { .. })
    }
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::TokensExceedCapacity { requested, capacity } => {
                write!(
                    f,
                    "requested tokens exceed bucket capacity: requested {requested}, capacity {capacity}; this request can never succeed"
                )
            }
            RateLimitError::RateLimitExceeded { key } => {
                write!(f, "rate limit exceeded for key: {key}")
            }
        }
    }
}

impl std::error::Error for RateLimitError {}
