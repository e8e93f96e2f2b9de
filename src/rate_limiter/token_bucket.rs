//! Single-key token bucket consumed under lock-free concurrency.

use std::sync::atomic::{AtomicU64, Ordering::*};
use super::{MICROS_PER_SEC, TOKEN_SCALE};

/// A token bucket for one caller identity.
///
/// The bucket starts full with `capacity` tokens, refills continuously at
/// `refill_rate` tokens per second and hands tokens out to concurrent
/// callers without ever taking a lock.
///
/// ## Representation
///
/// The balance is kept in fixed-point form (one token = 1 000 000
/// micro-tokens) inside an [`AtomicU64`], so fractional refill progress
/// persists between calls and sub-integer-per-second rates accumulate
/// correctly.
///
/// ## Algorithm
///
/// Every consume attempt performs two independently atomic steps:
///
/// 1. **Refill** - snapshot `(available, last_refill)`, credit
///    `elapsed * refill_rate` tokens clamped to capacity and commit the new
///    balance with a CAS, retrying from a fresh snapshot on contention.
///    `last_refill` advances only by the time backing the tokens actually
///    credited, so progress accrued while the bucket is full is not
///    silently discarded.
/// 2. **Consume** - CAS loop that subtracts the requested tokens when the
///    balance suffices and rejects without mutating otherwise.
///
/// The two steps are deliberately not combined into one atomic transaction:
/// an overlapping caller's refill may land between them. The balance itself
/// is only ever read-modify-written via CAS, so tokens are never
/// double-spent or lost; only the interleaving of refill and consume across
/// callers is unordered.
///
/// ## Example
///
/// ```rust
/// use keybucket::TokenBucket;
///
/// // capacity 10, refilling 5 tokens per second, created at t = 0
/// let bucket = TokenBucket::new(10, 5.0, 0);
///
/// assert!(bucket.try_consume(10, 0));
/// assert!(!bucket.try_consume(1, 0));
///
/// // 300ms later, 1.5 tokens have accrued
/// assert!(bucket.try_consume(1, 300_000));
/// ```
#[derive(Debug)]
pub struct TokenBucket {
    /// Maximum balance in fixed-point representation.
    capacity_scaled: u64,

    /// Precomputed: refill rate in (tokens/sec) * scale.
    refill_rate_scaled_per_sec: u64,

    /// Current token balance in fixed-point representation.
    available: AtomicU64,

    /// Time in microseconds up to which refill has been accounted for.
    last_refill_us: AtomicU64,

    /// Last consume attempt in microseconds (used only for idle expiry).
    last_used_us: AtomicU64,
}

impl TokenBucket {
    /// Creates a bucket that starts full.
    ///
    /// # Parameters
    ///
    /// - `capacity`: maximum number of tokens the bucket can hold.
    /// - `refill_rate`: tokens added per second.
    /// - `now_us`: current monotonic time in microseconds.
    ///
    /// # Panics
    ///
    /// Panics if:
    ///
    /// - `capacity` is zero or `capacity * scale` overflows `u64`.
    /// - `refill_rate` is not finite (`NaN` or ±∞), not strictly positive,
    ///   or exceeds `u64::MAX` after fixed-point scaling.
    pub fn new(capacity: u64, refill_rate: f64, now_us: u64) -> Self {
        assert!(capacity > 0, "capacity must be greater than 0");
        assert!(refill_rate.is_finite(), "refill_rate must be finite");
        assert!(refill_rate > 0.0, "refill_rate must be greater than 0");

        let scaled_rate = refill_rate * TOKEN_SCALE as f64;
        assert!(scaled_rate <= u64::MAX as f64, "refill_rate too large");

        let capacity_scaled = capacity
            .checked_mul(TOKEN_SCALE)
            .expect("capacity * scale overflow");

        Self {
            capacity_scaled,
            refill_rate_scaled_per_sec: scaled_rate.round() as u64,
            available: AtomicU64::new(capacity_scaled),
            last_refill_us: AtomicU64::new(now_us),
            last_used_us: AtomicU64::new(now_us),
        }
    }

    /// Attempts to consume `tokens` at time `now_us`.
    ///
    /// Refills the bucket from the elapsed time first, then tries to take
    /// the requested amount. Returns `true` when the tokens were taken and
    /// `false` when the balance is insufficient; a rejected attempt leaves
    /// the balance untouched.
    ///
    /// Never blocks. Safe under unbounded concurrent callers.
    pub fn try_consume(&self, tokens: u64, now_us: u64) -> bool {
        // Touch last_used (best-effort, expiry heuristics only).
        self.last_used_us.store(now_us, Release);

        self.refill(now_us);

        if tokens == 0 {
            return true;
        }
        let requested = tokens.saturating_mul(TOKEN_SCALE);

        let mut current = self.available.load(Relaxed);
        loop {
            if current < requested {
                return false;
            }
            match self
                .available
                .compare_exchange(current, current - requested, AcqRel, Relaxed)
            {
                Ok(_) => return true,
                Err(next) => current = next,
            }
        }
    }

    /// Returns `true` if the bucket has not been touched for longer than
    /// `expiry_us` at time `now_us`. Pure; does not mutate the bucket.
    #[inline]
    pub fn has_expired(&self, now_us: u64, expiry_us: u64) -> bool {
        let last_used = self.last_used_us.load(Acquire);
        now_us.saturating_sub(last_used) > expiry_us
    }

    /// Current balance in tokens (possibly fractional), without performing
    /// a refill.
    #[inline]
    pub fn available(&self) -> f64 {
        self.available.load(Acquire) as f64 / TOKEN_SCALE as f64
    }

    /// Bucket capacity (max tokens).
    #[inline(always)]
    pub fn capacity(&self) -> u64 {
        self.capacity_scaled / TOKEN_SCALE
    }

    /// Tokens added per second.
    #[inline(always)]
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate_scaled_per_sec as f64 / TOKEN_SCALE as f64
    }

    /// Credits tokens for the time elapsed since the last refill.
    ///
    /// Optimistic retry-until-success update: the new balance is committed
    /// with a CAS on `available`, and `last_refill_us` is advanced only by
    /// the time that produced the credited tokens. When the bucket is full
    /// nothing is credited and `last_refill_us` stays put, so the idle
    /// interval is accounted for once tokens are consumed again.
    fn refill(&self, now_us: u64) {
        loop {
            let available = self.available.load(Acquire);
            let last_refill = self.last_refill_us.load(Acquire);

            if now_us <= last_refill {
                return;
            }
            let elapsed_us = now_us - last_refill;

            // add_scaled = elapsed_us * (tokens/sec * scale) / 1_000_000
            let num = (elapsed_us as u128) * (self.refill_rate_scaled_per_sec as u128);
            let add = u64::try_from(num / MICROS_PER_SEC as u128).unwrap_or(u64::MAX);
            if add == 0 {
                return;
            }

            let updated = available.saturating_add(add).min(self.capacity_scaled);
            let credited = updated - available;
            if credited == 0 {
                return;
            }

            // Time backing the credited tokens; the remainder of the
            // elapsed interval stays pending for later refills.
            let used = (credited as u128) * (MICROS_PER_SEC as u128)
                / (self.refill_rate_scaled_per_sec as u128);
            let used_us = u64::try_from(used).unwrap_or(elapsed_us);

            if self
                .available
                .compare_exchange(available, updated, AcqRel, Acquire)
                .is_ok()
            {
                self.last_refill_us.store(last_refill + used_us, Release);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const MS: u64 = 1_000;

    #[test]
    fn starts_full_and_allows_burst_up_to_capacity() {
        let bucket = TokenBucket::new(10, 5.0, 0);

        assert!(bucket.try_consume(10, 0));
        assert!(!bucket.try_consume(1, 0));
    }

    #[test]
    fn rejected_attempt_leaves_balance_untouched() {
        let bucket = TokenBucket::new(3, 1.0, 0);

        assert!(bucket.try_consume(2, 0));
        assert!(!bucket.try_consume(2, 0));
        assert!(bucket.try_consume(1, 0));
    }

    #[test]
    fn request_beyond_capacity_is_never_admitted() {
        let bucket = TokenBucket::new(5, 1.0, 0);
        assert!(!bucket.try_consume(6, 0));
        // The full balance is still there.
        assert!(bucket.try_consume(5, 0));
    }

    #[test]
    fn zero_tokens_always_admitted() {
        let bucket = TokenBucket::new(1, 1.0, 0);
        assert!(bucket.try_consume(1, 0));
        assert!(bucket.try_consume(0, 0));
    }

    #[test]
    fn refills_from_elapsed_time() {
        let bucket = TokenBucket::new(10, 5.0, 0);
        assert!(bucket.try_consume(10, 0));

        // 300ms at 5 tokens/sec -> 1.5 tokens
        assert!(bucket.try_consume(1, 300 * MS));
        assert!(!bucket.try_consume(1, 300 * MS));
    }

    #[test]
    fn fractional_refill_accumulates_across_calls() {
        let bucket = TokenBucket::new(5, 1.0, 0);
        assert!(bucket.try_consume(5, 0));

        // 0.4 tokens, then 0.8, then 1.2 - only the last attempt succeeds.
        assert!(!bucket.try_consume(1, 400 * MS));
        assert!(!bucket.try_consume(1, 800 * MS));
        assert!(bucket.try_consume(1, 1_200 * MS));
    }

    #[test]
    fn balance_is_clamped_at_capacity() {
        let bucket = TokenBucket::new(2, 1.0, 0);
        assert!(bucket.try_consume(1, 0));

        // A long idle interval refills to capacity, not beyond.
        assert!(bucket.try_consume(0, 3_600 * MICROS_PER_SEC));
        assert!((bucket.available() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn idle_time_while_full_is_not_discarded() {
        // last_refill does not advance while the bucket sits full, so a
        // long idle interval keeps funding refills after the balance is
        // drained: the initial charge of 2 plus 10s at 1 token/sec backs
        // six consecutive bursts of 2.
        let bucket = TokenBucket::new(2, 1.0, 0);
        let now = 10 * MICROS_PER_SEC;

        for _ in 0..6 {
            assert!(bucket.try_consume(2, now));
        }
        assert!(!bucket.try_consume(2, now));
    }

    #[test]
    fn expires_only_after_idle_threshold() {
        let bucket = TokenBucket::new(10, 5.0, 0);
        let expiry = MICROS_PER_SEC; // 1s

        assert!(!bucket.has_expired(900 * MS, expiry));
        assert!(bucket.has_expired(1_100 * MS, expiry));
    }

    #[test]
    fn consume_attempt_refreshes_expiry() {
        let bucket = TokenBucket::new(1, 1.0, 0);
        let expiry = MICROS_PER_SEC;

        // Even a rejected attempt counts as usage.
        assert!(bucket.try_consume(1, 0));
        assert!(!bucket.try_consume(1, 900 * MS));
        assert!(!bucket.has_expired(1_500 * MS, expiry));
        assert!(bucket.has_expired(2_000 * MS, expiry));
    }

    #[test]
    fn no_double_spend_under_contention() {
        let capacity = 8;
        let bucket = Arc::new(TokenBucket::new(capacity, 1.0, 0));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                thread::spawn(move || bucket.try_consume(1, 0))
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admitted| *admitted)
            .count() as u64;

        assert_eq!(admitted, capacity);
    }

    #[test]
    #[should_panic(expected = "capacity must be greater than 0")]
    fn panics_on_zero_capacity() {
        let _ = TokenBucket::new(0, 1.0, 0);
    }

    #[test]
    #[should_panic(expected = "refill_rate must be greater than 0")]
    fn panics_on_zero_refill_rate() {
        let _ = TokenBucket::new(1, 0.0, 0);
    }

    #[test]
    #[should_panic(expected = "refill_rate must be finite")]
    fn panics_on_nan_refill_rate() {
        let _ = TokenBucket::new(1, f64::NAN, 0);
    }

    #[test]
    #[should_panic(expected = "capacity * scale overflow")]
    fn panics_when_scaled_capacity_overflows() {
        let _ = TokenBucket::new(u64::MAX / TOKEN_SCALE + 1, 1.0, 0);
    }
}
