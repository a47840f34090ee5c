//! Exponential backoff utilities.
//!
//! [`ExponentialBackoff`] is the single delay calculator used by the
//! reconnection manager (one instance per failure class) and by the fallback
//! relay link.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use crate::util::backoff::ExponentialBackoff;
//!
//! let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
//! assert_eq!(backoff.delay(0), Duration::from_secs(1));
//! assert_eq!(backoff.delay(1), Duration::from_secs(2));
//! assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(4));
//! ```

use std::time::Duration;

use rand::Rng;

/// Stateless exponential backoff delay calculator.
///
/// Computes delays using the formula: `base * 2^attempt`, capped at `max`.
///
/// # Formula
///
/// For attempt `n` (0-indexed):
/// - Attempt 0: `base`
/// - Attempt 1: `base * 2`
/// - Attempt 2: `base * 4`
/// - ...
/// - Capped at `max`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Base delay (delay for first attempt, i.e., attempt 0)
    base: Duration,
    /// Maximum delay (cap)
    max: Duration,
    /// Upper bound of the random extra delay, in percent of the uncapped delay.
    jitter_percent: u32,
}

impl ExponentialBackoff {
    /// Jitter never exceeds this share of the uncapped delay. Anything below
    /// 100% keeps the jittered schedule non-decreasing.
    pub const MAX_JITTER_PERCENT: u32 = 50;

    /// Create a new exponential backoff calculator without jitter.
    ///
    /// # Arguments
    /// - `base`: Initial delay (for attempt 0)
    /// - `max`: Maximum delay cap
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter_percent: 0,
        }
    }

    /// Adds up to `percent`% of random extra delay on top of every computed delay.
    pub fn with_jitter(mut self, percent: u32) -> Self {
        self.jitter_percent = percent.min(Self::MAX_JITTER_PERCENT);
        self
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    ///
    /// Returns `base * 2^attempt`, capped at `max`. Jitter is not applied.
    #[inline]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.raw_delay(attempt).min(self.max)
    }

    /// Calculate the delay for a 1-indexed attempt number.
    ///
    /// First attempt (1) returns `base`, second returns `base * 2`, etc.
    /// Returns `Duration::ZERO` for attempt 0.
    #[inline]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.delay(attempt - 1)
    }

    /// Same as [`Self::delay_for_attempt`] plus random jitter drawn from `rng`.
    ///
    /// The jitter is a fraction of the *uncapped* delay and the sum is capped
    /// again at `max`, so for any draw:
    /// `delay_for_attempt(n) <= jittered(n) <= delay_for_attempt(n + 1)`.
    pub fn jittered_delay_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let raw = self.raw_delay(attempt - 1);
        if self.jitter_percent == 0 || raw >= self.max {
            return raw.min(self.max);
        }
        let max_extra_ms = raw.as_millis() as u64 * self.jitter_percent as u64 / 100;
        let extra = if max_extra_ms == 0 {
            0
        } else {
            rng.gen_range(0..=max_extra_ms)
        };
        (raw + Duration::from_millis(extra)).min(self.max)
    }

    fn raw_delay(&self, attempt: u32) -> Duration {
        // Cap exponent to avoid overflow (2^10 = 1024 is plenty)
        let exponent = attempt.min(10);
        let multiplier = 1u32 << exponent;
        self.base.saturating_mul(multiplier)
    }

    /// Get the base delay.
    #[inline]
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Get the maximum delay.
    #[inline]
    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Default for ExponentialBackoff {
    /// Default backoff: 1 second base, 30 seconds max, no jitter.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}
