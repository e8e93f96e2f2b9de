//! Keybucket
//!
//! Per-key token bucket rate limiting for Rust services.
//!
//! Each caller identity (API key, user id, IP address) gets its own
//! [`TokenBucket`] that refills continuously and is consumed with lock-free
//! compare-and-set loops. The [`RateLimiter`] registry creates buckets on
//! first use, validates requests against the configured capacity and evicts
//! idle buckets with a periodic background sweep.
//!
//! # Quick Start
//!
//! ```rust
//! use keybucket::{RateLimiter, RateLimiterConfig, RateLimitError};
//!
//! let limiter = RateLimiter::new(RateLimiterConfig::default());
//!
//! match limiter.try_consume("user-42", 1) {
//!     Ok(()) => println!("request admitted"),
//!     Err(RateLimitError::RateLimitExceeded { .. }) => println!("try again later"),
//!     Err(e) => println!("request denied: {e}"),
//! }
//! ```
//!
//! The background sweep is driven by a Tokio task; call
//! [`RateLimiter::start`] once the runtime is up and
//! [`RateLimiter::stop`] on shutdown.

mod rate_limiter;
pub use rate_limiter::{
    RateLimiter,
    RateLimiterConfig,
    SystemTimeSource,
    TimeSource,
    TokenBucket
};

mod error;
pub use error::{ConsumeResult, RateLimitError};
