//! Retry backoff for the reconnect loop.
//!
//! The delay for attempt `n` is `initial × factor^n`, clamped to `max`,
//! then scaled by a uniform jitter factor in `[1 - jitter, 1 + jitter]` and
//! clamped again to `[initial, max]`. The base delay is derived from the
//! attempt number alone, so jitter output never feeds back into later
//! attempts.
//!
//! | Attempt | Base (defaults) | Range with 20% jitter |
//! |---------|-----------------|-----------------------|
//! | 0 | 1s | 1s .. 1.2s |
//! | 1 | 2s | 1.6s .. 2.4s |
//! | 2 | 4s | 3.2s .. 4.8s |
//! | 3+ | 5s (cap) | 4s .. 5s |

use crate::errors::ValidationError;
use rand::Rng;
use std::time::Duration;

/// Default initial delay (first retry).
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Default delay cap.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Default growth factor.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Default jitter ratio (±20%).
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.2;

/// Attempt-indexed retry delay strategy.
///
/// `attempt` is 0 for the first retry after a failed dial and resets to 0
/// after every successful dial.
pub trait RetryPolicy: Send + Sync {
    /// Delay to wait before the next dial.
    fn next(&self, attempt: u32) -> Duration;
}

impl<F> RetryPolicy for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn next(&self, attempt: u32) -> Duration {
        self(attempt)
    }
}

/// Jittered exponential backoff with floor and ceiling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_BACKOFF,
            max: DEFAULT_MAX_BACKOFF,
            factor: DEFAULT_BACKOFF_FACTOR,
            jitter: DEFAULT_BACKOFF_JITTER,
        }
    }
}

impl ExponentialBackoff {
    /// Create a backoff with the default growth factor.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidBackoff` if `initial` is zero, `max`
    /// is below `initial`, or `jitter` is outside `[0, 1)`.
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Result<Self, ValidationError> {
        Self::with_factor(initial, max, DEFAULT_BACKOFF_FACTOR, jitter)
    }

    /// Create a backoff with an explicit growth factor.
    ///
    /// # Errors
    ///
    /// Same as [`ExponentialBackoff::new`], plus `factor < 1.0` or non-finite.
    pub fn with_factor(
        initial: Duration,
        max: Duration,
        factor: f64,
        jitter: f64,
    ) -> Result<Self, ValidationError> {
        if initial.is_zero() {
            return Err(ValidationError::InvalidBackoff(
                "initial delay must be positive".to_string(),
            ));
        }
        if max < initial {
            return Err(ValidationError::InvalidBackoff(format!(
                "max delay {max:?} is below initial delay {initial:?}"
            )));
        }
        if !factor.is_finite() || factor < 1.0 {
            return Err(ValidationError::InvalidBackoff(format!(
                "factor must be >= 1.0, got {factor}"
            )));
        }
        if !(0.0..1.0).contains(&jitter) {
            return Err(ValidationError::InvalidBackoff(format!(
                "jitter must be in [0, 1), got {jitter}"
            )));
        }

        Ok(Self {
            initial,
            max,
            factor,
            jitter,
        })
    }

    /// Lower bound of any returned delay.
    #[must_use]
    pub fn initial(&self) -> Duration {
        self.initial
    }

    /// Upper bound of any returned delay.
    #[must_use]
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before jitter for the given attempt.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let unclamped = self.initial.as_secs_f64() * self.factor.powi(exponent);

        if !unclamped.is_finite() || unclamped > max_secs {
            self.max
        } else {
            Duration::try_from_secs_f64(unclamped).unwrap_or(self.max)
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }

        let scale = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        let jittered = base.as_secs_f64() * scale;
        // Out of range only when scaled past Duration::MAX
        Duration::try_from_secs_f64(jittered)
            .map_or(self.max, |delay| delay.clamp(self.initial, self.max))
    }
}
