//! Core rate limiting building blocks.
//!
//! This module defines the two components of the limiter and the shared
//! time abstraction they are built on:
//!
//! - [`TokenBucket`] - a single-key bucket that refills lazily from elapsed
//!   time and is consumed through lock-free compare-and-set loops.
//! - [`RateLimiter`] - the per-key registry that lazily creates buckets,
//!   validates requests and sweeps out idle entries in the background.
//!
//! ## Design principles
//!
//! - **Lock-free hot path** - no mutex is held while consuming; all retries
//!   are bounded CAS spins, so there is no deadlock risk and no priority
//!   inversion among callers.
//! - **Lazy refill** - buckets are refilled as a side effect of each consume
//!   attempt; there is no per-bucket timer.
//! - **Time abstraction** - all time-dependent logic is driven by a pluggable
//!   [`TimeSource`] to allow deterministic testing.
//!
//! ## Scope
//!
//! This module does **not** decide how caller identities are extracted or
//! how a rejection maps to a transport response. Those concerns belong to
//! higher-level layers.

use std::time::Instant;

pub use registry::{RateLimiter, RateLimiterConfig};
pub use token_bucket::TokenBucket;

mod registry;
mod token_bucket;

const MICROS_PER_SEC: u64 = 1_000_000;

/// Fixed-point scaling factor: one token is represented as this many
/// micro-tokens, so fractional refill progress survives between calls.
const TOKEN_SCALE: u64 = 1_000_000;

/// A source of time used by the rate limiter.
///
/// Decouples the limiter from the system clock, enabling deterministic and
/// fast unit tests.
///
/// Time is expressed in **microseconds** and must be **monotonic**
/// (non-decreasing).
pub trait TimeSource: Send + Sync {
    /// Returns a monotonic timestamp in microseconds.
    fn now_micros(&self) -> u64;
}

/// Monotonic system time source backed by `Instant`.
///
/// Uses a process-wide start anchor and returns elapsed microseconds since
/// that anchor, which avoids wall-clock jumps (NTP, manual adjustments).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    #[inline]
    fn anchor() -> Instant {
        // A stable anchor shared across calls; `OnceLock` gives us a
        // process-wide start point.
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        *START.get_or_init(Instant::now)
    }
}

impl TimeSource for SystemTimeSource {
    #[inline]
    fn now_micros(&self) -> u64 {
        Self::anchor()
            .elapsed()
            .as_micros()
            .try_into()
            .unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
pub(super) mod test_utils {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use super::{TimeSource, MICROS_PER_SEC};

    #[derive(Clone)]
    pub(crate) struct MockTimeSource {
        current_time: Arc<Mutex<u64>>,
    }

    impl MockTimeSource {
        pub(crate) fn new(initial_secs: u64) -> Self {
            Self {
                current_time: Arc::new(Mutex::new(initial_secs * MICROS_PER_SEC)),
            }
        }

        pub(crate) fn advance(&self, elapsed: Duration) {
            let mut time = self.current_time.lock().unwrap();
            *time += elapsed.as_micros() as u64;
        }
    }

    impl TimeSource for MockTimeSource {
        fn now_micros(&self) -> u64 {
            *self.current_time.lock().unwrap()
        }
    }
}
