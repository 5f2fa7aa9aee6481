//! Adaptive pacing for campaign API calls.
//!
//! One limiter is owned per run and passed by `&mut` to every component that
//! talks to the platform, so pacing is shared without global state.
//!
//! ## Policy
//!
//! - **Success**: after `success_streak` consecutive successes the delay shrinks by 10%, down to the floor
//! - **429**: the delay doubles, up to the rate-limit ceiling
//! - **Other failures**: after `failure_streak` consecutive failures the delay grows by 50%, up to the failure ceiling
//!
//! A failure never lowers the delay, even when it is already above the failure ceiling.

use std::time::Duration;

use crate::config::RateLimitConfig;

/// Result of one outbound call, as seen by the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// 2xx (or an idempotent 404 on delete).
    Success,
    /// HTTP 429.
    RateLimited,
    /// 5xx, timeout, or transport failure.
    Failure,
}

/// Adaptive delay between platform calls.
#[derive(Debug, Clone)]
pub struct AdaptiveRateLimiter {
    config: RateLimitConfig,
    delay: Duration,
    consecutive_successes: u32,
    consecutive_failures: u32,
}

impl AdaptiveRateLimiter {
    /// Creates a limiter at the configured initial delay.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        let delay = config.initial_delay;
        Self {
            config,
            delay,
            consecutive_successes: 0,
            consecutive_failures: 0,
        }
    }

    /// Current delay between calls.
    #[must_use]
    pub const fn current_delay(&self) -> Duration {
        self.delay
    }

    /// Sleeps for the current delay.
    pub async fn wait(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    /// Adjusts the delay after a call.
    pub fn record(&mut self, outcome: CallOutcome) {
        match outcome {
            CallOutcome::Success => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.config.success_streak {
                    self.consecutive_successes = 0;
                    self.delay = self.delay.mul_f64(0.9).max(self.config.min_delay);
                }
            }
            CallOutcome::RateLimited => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;
                let widened = self
                    .delay
                    .saturating_mul(2)
                    .min(self.config.max_rate_limited_delay);
                self.delay = self.delay.max(widened);
                tracing::debug!(delay_ms = self.delay_ms(), "rate limited, widening delay");
            }
            CallOutcome::Failure => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_streak {
                    let widened = self
                        .delay
                        .mul_f64(1.5)
                        .min(self.config.max_failure_delay);
                    self.delay = self.delay.max(widened);
                    tracing::debug!(
                        delay_ms = self.delay_ms(),
                        failures = self.consecutive_failures,
                        "repeated failures, widening delay"
                    );
                }
            }
        }
    }

    fn delay_ms(&self) -> u64 {
        u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX)
    }
}
