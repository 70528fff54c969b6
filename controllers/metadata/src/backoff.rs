//! # Exponential Backoff
//!
//! Provides the per-key retry delay used by the work queue.
//!
//! The delay doubles with every consecutive failure of the same key and is
//! capped, so a permanently failing key settles at a fixed, slow retry rate
//! instead of spinning.
//! Sequence with the defaults: 5ms, 10ms, 20ms, 40ms, ... 1000s (max).
//!
//! A [`TokenBucket`] additionally bounds the overall retry rate across all
//! keys; the queue waits for the longer of the two delays.

use std::time::Duration;
use tokio::time::Instant;

/// Sustained retries per second across all keys
pub const DEFAULT_RETRY_QPS: f64 = 10.0;
/// Retries allowed in a burst before the sustained rate applies
pub const DEFAULT_RETRY_BURST: u32 = 100;

/// Exponential backoff calculator
///
/// Stateless: the delay is derived from the number of failures recorded for
/// a key, so one calculator can be shared by every key in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Delay after the first failure
    base: Duration,
    /// Maximum delay
    max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_BACKOFF_BASE,
            crate::config::DEFAULT_BACKOFF_MAX,
        )
    }
}

impl ExponentialBackoff {
    /// Create a new exponential backoff with the given base and cap
    ///
    /// # Arguments
    ///
    /// * `base` - Delay returned for a key with no previous failures
    /// * `max` - Upper bound for every returned delay
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Calculate the delay before the next attempt for a key that has
    /// already failed `failures` times.
    ///
    /// `base * 2^failures`, capped at `max`. Saturates instead of
    /// overflowing for very large failure counts.
    #[must_use]
    pub fn calculate_for_failures(&self, failures: u32) -> Duration {
        let factor = 2_u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Token bucket limiting the overall retry rate.
///
/// Every reservation takes one token and always succeeds; once the bucket
/// is empty it returns how long the caller must wait for its token, so
/// retries line up at `qps`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_QPS, DEFAULT_RETRY_BURST, Instant::now())
    }
}

impl TokenBucket {
    /// Create a full bucket refilling at `qps` tokens per second
    #[must_use]
    pub fn new(qps: f64, burst: u32, now: Instant) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps,
            burst,
            tokens: burst,
            last: now,
        }
    }

    /// Take one token at `now` and return the wait before it is available.
    pub fn reserve(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = self.last.max(now);
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        self.tokens -= 1.0;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}
