//! Per-key bucket registry with background idle eviction.

use dashmap::DashMap;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::error::{ConsumeResult, RateLimitError};
use super::{SystemTimeSource, TimeSource, TokenBucket};

/// Fixed sweep period, independent of request traffic and of the
/// configurable expiry duration.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Policy parameters shared by every bucket the limiter creates.
///
/// The defaults match a small per-user API quota: bursts of up to 5
/// requests, refilling one per second, with per-key state dropped after a
/// minute of inactivity.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum number of tokens a bucket can hold.
    pub capacity: u64,

    /// Tokens added per second.
    pub refill_rate_per_sec: u64,

    /// Idle duration after which a bucket is evicted.
    pub expiry: Duration,
}

impl Default for RateLimiterConfig {
    #[inline]
    fn default() -> Self {
        Self {
            capacity: 5,
            refill_rate_per_sec: 1,
            expiry: Duration::from_secs(60),
        }
    }
}

impl RateLimiterConfig {
    /// Creates a config with the given capacity and refill rate and the
    /// default expiry.
    #[inline]
    pub fn new(capacity: u64, refill_rate_per_sec: u64) -> Self {
        Self {
            capacity,
            refill_rate_per_sec,
            ..Self::default()
        }
    }

    /// Sets the idle duration after which a bucket is evicted.
    #[inline]
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }
}

/// A keyed token-bucket rate limiter.
///
/// Owns the mapping from caller identity to [`TokenBucket`]. A bucket is
/// created full on the first consume attempt for a key; creation is atomic,
/// so racing first-time callers never observe two buckets for one key.
/// Buckets unused for longer than the configured expiry are removed by a
/// periodic background sweep, and the next request for a swept key is
/// indistinguishable from a brand-new one.
///
/// ## Concurrency
///
/// `try_consume` never blocks: bucket counters are updated via CAS loops
/// and the map supports fine-grained-locked get-or-create and removal,
/// safely interleaved with the sweep's full-table pass.
///
/// ## Lifecycle
///
/// The sweep runs on a Tokio task. Call [`start`](Self::start) once the
/// runtime is up and [`stop`](Self::stop) on shutdown; `stop` waits for the
/// task so no sweep is left running after teardown completes.
///
/// ## Example
///
/// ```rust
/// use keybucket::{RateLimiter, RateLimiterConfig};
///
/// let limiter = RateLimiter::new(RateLimiterConfig::new(10, 5));
///
/// assert!(limiter.try_consume("user-1", 10).is_ok());
/// assert!(limiter.try_consume("user-1", 1).is_err());
/// assert!(limiter.try_consume("user-2", 1).is_ok());
/// ```
#[derive(Debug)]
pub struct RateLimiter<T: TimeSource = SystemTimeSource> {
    /// Per-key bucket state.
    buckets: Arc<DashMap<String, TokenBucket>>,

    /// Maximum number of tokens per bucket.
    capacity: u64,

    /// Tokens added per second, applied to every created bucket.
    refill_rate: f64,

    /// Idle threshold in microseconds after which a bucket is evicted.
    expiry_us: u64,

    /// Time source used to determine the current time.
    time_source: T,

    /// Signals the sweeper task to shut down.
    cancellation: CancellationToken,

    /// Handle of the running sweeper task, if any.
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Creates a rate limiter using the system clock.
    ///
    /// # Panics
    ///
    /// Panics on the first consume attempt if the config holds a zero
    /// capacity or a zero refill rate (bucket construction asserts both).
    #[inline]
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::with_time_source(config, SystemTimeSource)
    }
}

impl<T: TimeSource> RateLimiter<T> {
    /// Creates a [`RateLimiter`] with a custom [`TimeSource`].
    ///
    /// This is primarily useful for testing and deterministic scenarios.
    pub fn with_time_source(config: RateLimiterConfig, time_source: T) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            capacity: config.capacity,
            refill_rate: config.refill_rate_per_sec as f64,
            expiry_us: config.expiry.as_micros().try_into().unwrap_or(u64::MAX),
            time_source,
            cancellation: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Attempts to consume `tokens` for the given `key`.
    ///
    /// Requests for more tokens than a bucket can ever hold are rejected
    /// up front with [`RateLimitError::TokensExceedCapacity`] and never
    /// touch the map. Otherwise the key's bucket is fetched or created
    /// atomically and the consume is delegated to it; an insufficient
    /// balance yields [`RateLimitError::RateLimitExceeded`].
    pub fn try_consume(&self, key: &str, tokens: u64) -> ConsumeResult {
        if tokens > self.capacity {
            #[cfg(feature = "tracing")]
            tracing::warn!(key, tokens, capacity = self.capacity, "requested tokens exceed bucket capacity");
            return Err(RateLimitError::TokensExceedCapacity {
                requested: tokens,
                capacity: self.capacity,
            });
        }

        let now = self.time_source.now_micros();

        // Fast path avoids allocating the key when the bucket exists;
        // `entry` makes racing first-time callers agree on one bucket.
        let admitted = match self.buckets.get(key) {
            Some(bucket) => bucket.try_consume(tokens, now),
            None => self
                .buckets
                .entry(key.to_owned())
                .or_insert_with(|| TokenBucket::new(self.capacity, self.refill_rate, now))
                .try_consume(tokens, now),
        };

        if admitted {
            #[cfg(feature = "tracing")]
            tracing::debug!(key, tokens, "consumed tokens");
            Ok(())
        } else {
            #[cfg(feature = "tracing")]
            tracing::warn!(key, tokens, "rate limit exceeded");
            Err(RateLimitError::RateLimitExceeded { key: key.to_owned() })
        }
    }

    /// Removes every bucket that has been idle for longer than the
    /// configured expiry.
    ///
    /// Driven periodically by the task spawned in [`start`](Self::start);
    /// exposed so hosts without a long-lived runtime can sweep manually.
    /// A removal racing with a consumer of the same key is benign: the
    /// consumer simply recreates a fresh, full bucket.
    pub fn sweep_expired(&self) {
        sweep(&self.buckets, self.time_source.now_micros(), self.expiry_us);
    }

    /// Number of live buckets. Mostly useful for diagnostics and tests.
    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket capacity (max tokens).
    #[inline(always)]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

impl<T: TimeSource + Clone + 'static> RateLimiter<T> {
    /// Starts the periodic background sweep.
    ///
    /// Spawns a Tokio task that evicts idle buckets every 30 seconds,
    /// beginning with an immediate pass. Calling `start` while the sweeper
    /// is already running is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn start(&self) {
        let Ok(mut sweeper) = self.sweeper.try_lock() else {
            return;
        };
        if sweeper.is_some() {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::info!("starting bucket sweeper task");

        let buckets = Arc::clone(&self.buckets);
        let time_source = self.time_source.clone();
        let expiry_us = self.expiry_us;
        let cancellation = self.cancellation.clone();

        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    _ = interval.tick() => sweep(&buckets, time_source.now_micros(), expiry_us),
                }
            }
        }));
    }

    /// Stops the background sweep.
    ///
    /// Cancels the sweeper task and waits for it to finish, so no sweep is
    /// still running once this returns. Safe to call without a preceding
    /// [`start`](Self::start).
    pub async fn stop(&self) {
        #[cfg(feature = "tracing")]
        tracing::info!("shutting down bucket sweeper task");

        self.cancellation.cancel();
        if let Some(handle) = self.sweeper.lock().await.take() {
            let _ = handle.await;
        }
    }
}

/// Single sweep pass: drops every bucket idle beyond `expiry_us` at `now_us`.
fn sweep(buckets: &DashMap<String, TokenBucket>, now_us: u64, expiry_us: u64) {
    #[cfg(feature = "tracing")]
    let before = buckets.len();

    buckets.retain(|_, bucket| !bucket.has_expired(now_us, expiry_us));

    // Concurrent inserts during the pass can push len() past `before`.
    #[cfg(feature = "tracing")]
    tracing::debug!(
        evicted = before.saturating_sub(buckets.len()),
        "swept idle buckets"
    );
}
