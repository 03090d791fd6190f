//! Retry policy with exponential backoff and jitter.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::error::{ApiError, ConfigError, ErrorKind};

/// Largest accepted `rate_limit_factor`.
pub const MAX_RATE_LIMIT_FACTOR: f64 = 100.0;

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    /// Uses a fixed delay between retries.
    Fixed {
        #[serde(with = "duration_ms")]
        delay: Duration,
    },
    /// `base * factor^attempt`, capped at `max`.
    Exponential {
        #[serde(with = "duration_ms")]
        base: Duration,
        factor: f64,
        #[serde(with = "duration_ms")]
        max: Duration,
        /// Apply random jitter (+/- 50%) to the delay.
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(500),
            factor: 2.0,
            max: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let seconds =
                    (base.as_secs_f64() * factor.powi(exponent)).clamp(0.0, max.as_secs_f64());
                // NaN from a nonsensical factor lands on the cap.
                let capped = Duration::try_from_secs_f64(seconds).unwrap_or(max);

                if jitter {
                    apply_jitter(capped)
                } else {
                    capped
                }
            }
        }
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    let millis = delay.as_millis() as u64;
    let spread = millis / 2;
    let offset = fastrand::u64(0..=spread * 2);
    Duration::from_millis((millis + offset).saturating_sub(spread))
}

/// Attempt budget and delays for [`crate::ErrorHandler::with_retry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total invocations including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Multiplier applied to the backoff for rate-limited failures.
    pub rate_limit_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            rate_limit_factor: 3.0,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay },
            ..Self::default()
        }
    }

    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Rejects factors that would shrink, negate or overflow the delays.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Backoff::Exponential { factor, .. } = self.backoff {
            if !factor.is_finite() || factor < 1.0 {
                return Err(ConfigError::OutOfRange {
                    field: "retry.backoff.factor",
                    value: factor,
                    expected: "a finite number >= 1.0",
                });
            }
        }

        let factor = self.rate_limit_factor;
        if !factor.is_finite() || !(1.0..=MAX_RATE_LIMIT_FACTOR).contains(&factor) {
            return Err(ConfigError::OutOfRange {
                field: "retry.rate_limit_factor",
                value: factor,
                expected: "a number between 1.0 and 100.0",
            });
        }
        Ok(())
    }

    /// Attempt budget for a failure of `kind`. Unknown failures get one retry at most.
    pub fn attempts_for(&self, kind: ErrorKind) -> u32 {
        let budget = self.max_attempts.max(1);
        match kind {
            ErrorKind::Unknown => budget.min(2),
            kind if kind.is_retryable() => budget,
            _ => 1,
        }
    }

    /// Delay after failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, error: &ApiError, attempt: u32) -> Duration {
        let delay = self.backoff.delay(attempt);
        if error.kind() != ErrorKind::RateLimited {
            return delay;
        }

        let factor = if self.rate_limit_factor.is_finite() {
            self.rate_limit_factor.clamp(1.0, MAX_RATE_LIMIT_FACTOR)
        } else {
            1.0
        };
        let stretched =
            Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX);
        error
            .retry_after()
            .map_or(stretched, |retry_after| stretched.max(retry_after))
    }
}
