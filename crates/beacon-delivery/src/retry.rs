//! Backoff policies with jitter for failed transmissions.
//!
//! A failed attempt produces a `RetryContext`; `decide_retry` either schedules
//! the next attempt at a monotonic instant or gives up with a reason the
//! worker reports in its `Dropped` event.

use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Retry policy applied to every destination of a controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts (including the first).
    pub max_attempts: u32,

    /// Base delay for backoff calculation.
    pub base_delay: Duration,

    /// Maximum delay between attempts.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0) to add randomness.
    pub jitter_factor: f64,

    /// Strategy for calculating backoff delays.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.25,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Checks the policy bounds.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` for zero attempts, a jitter
    /// factor outside `0.0..=1.0`, or a base delay above the maximum.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(DeliveryError::configuration(format!(
                "jitter_factor must be within 0.0..=1.0, got {}",
                self.jitter_factor
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(DeliveryError::configuration("base_delay exceeds max_delay"));
        }
        Ok(())
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff: delay doubles each attempt.
    #[default]
    Exponential,
    /// Linear backoff: delay increases by base amount each attempt.
    Linear,
}

/// Retry decision context for a failed attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempt that just failed (1-based).
    pub attempt_number: u32,
    /// Error that caused the failure.
    pub error: DeliveryError,
    /// Monotonic time of the failure.
    pub failed_at: Instant,
    /// Retry policy to apply.
    pub policy: RetryPolicy,
}

/// Result of retry decision calculation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry once `next_attempt_at` has passed.
    Retry {
        /// When the next attempt may be made
        next_attempt_at: Instant,
    },
    /// Do not retry.
    GiveUp {
        /// Reason why the payload should not be retried
        reason: String,
    },
}

impl RetryContext {
    /// Creates a new retry context for a failed attempt.
    pub fn new(
        attempt_number: u32,
        error: DeliveryError,
        failed_at: Instant,
        policy: RetryPolicy,
    ) -> Self {
        Self { attempt_number, error, failed_at, policy }
    }

    /// Determines if and when to retry.
    ///
    /// The attempt budget is checked before the error category, so an
    /// exhausted payload always reports the attempt limit.
    pub fn decide_retry(&self) -> RetryDecision {
        if self.attempt_number >= self.policy.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exceeded", self.policy.max_attempts),
            };
        }

        if !self.error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: format!("non-retryable error: {}", self.error),
            };
        }

        let Some(next_attempt_at) = self.failed_at.checked_add(self.calculate_delay()) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { next_attempt_at }
    }

    /// Calculates the delay until the next attempt.
    ///
    /// A Retry-After hint from the collector wins over the backoff strategy.
    /// Either way the delay never exceeds `max_delay`.
    pub fn calculate_delay(&self) -> Duration {
        if let Some(retry_after_seconds) = self.error.retry_after_seconds() {
            return std::cmp::min(Duration::from_secs(retry_after_seconds), self.policy.max_delay);
        }

        let multiplier = match self.policy.backoff_strategy {
            BackoffStrategy::Fixed => 1,
            BackoffStrategy::Linear => self.attempt_number.saturating_sub(1),
            BackoffStrategy::Exponential => {
                let exponent = self.attempt_number.saturating_sub(1).min(20);
                2_u32.saturating_pow(exponent)
            },
        };
        let base_delay =
            self.policy.base_delay.checked_mul(multiplier).unwrap_or(self.policy.max_delay);

        let capped_delay = std::cmp::min(base_delay, self.policy.max_delay);
        let jittered_delay = apply_jitter(capped_delay, self.policy.jitter_factor);

        std::cmp::min(jittered_delay, self.policy.max_delay)
    }
}

/// Randomizes the delay by ±jitter_factor.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 10,
            backoff_strategy: strategy,
            jitter_factor: 0.0,
            max_delay: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    fn delays(policy: &RetryPolicy, attempts: u32) -> Vec<Duration> {
        (1..=attempts)
            .map(|attempt| {
                RetryContext::new(
                    attempt,
                    DeliveryError::timeout(30),
                    Instant::now(),
                    policy.clone(),
                )
                .calculate_delay()
            })
            .collect()
    }

    #[test]
    fn exponential_backoff_doubles() {
        let delays = delays(&no_jitter(BackoffStrategy::Exponential), 5);
        assert_eq!(delays, [1, 2, 4, 8, 16].map(Duration::from_secs));
    }

    #[test]
    fn linear_backoff_starts_at_zero() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(5),
            ..no_jitter(BackoffStrategy::Linear)
        };
        assert_eq!(delays(&policy, 4), [0, 5, 10, 15].map(Duration::from_secs));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(10),
            ..no_jitter(BackoffStrategy::Fixed)
        };
        assert!(delays(&policy, 5).iter().all(|d| *d == Duration::from_secs(10)));
    }

    #[test]
    fn max_attempts_wins_over_retryable_error() {
        let policy = RetryPolicy { max_attempts: 3, ..Default::default() };
        let context =
            RetryContext::new(3, DeliveryError::network("reset"), Instant::now(), policy);

        match context.decide_retry() {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("maximum attempts (3)")),
            RetryDecision::Retry { .. } => unreachable!("should not retry at max attempts"),
        }
    }

    #[test]
    fn client_errors_are_not_retried() {
        let context = RetryContext::new(
            1,
            DeliveryError::client_error(403, "forbidden"),
            Instant::now(),
            RetryPolicy::default(),
        );

        assert!(matches!(
            context.decide_retry(),
            RetryDecision::GiveUp { reason } if reason.contains("non-retryable")
        ));
    }

    #[test]
    fn retry_after_hint_overrides_backoff() {
        let failed_at = Instant::now();
        let context = RetryContext::new(
            1,
            DeliveryError::rate_limited(Some(45)),
            failed_at,
            RetryPolicy::default(),
        );

        assert_eq!(
            context.decide_retry(),
            RetryDecision::Retry { next_attempt_at: failed_at + Duration::from_secs(45) }
        );
    }

    #[test]
    fn retry_after_hint_is_capped_at_max_delay() {
        let failed_at = Instant::now();
        let context = RetryContext::new(
            1,
            DeliveryError::rate_limited(Some(u64::MAX)),
            failed_at,
            RetryPolicy::default(),
        );

        assert_eq!(context.calculate_delay(), Duration::from_secs(60));
        assert_eq!(
            context.decide_retry(),
            RetryDecision::Retry { next_attempt_at: failed_at + Duration::from_secs(60) }
        );
    }

    #[test]
    fn huge_base_delay_saturates_instead_of_overflowing() {
        for strategy in [BackoffStrategy::Linear, BackoffStrategy::Exponential] {
            let policy = RetryPolicy {
                base_delay: Duration::MAX,
                max_delay: Duration::MAX,
                ..no_jitter(strategy)
            };
            let delay = RetryContext::new(12, DeliveryError::timeout(30), Instant::now(), policy)
                .calculate_delay();
            assert_eq!(delay, Duration::MAX);
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(10);
        let mut seen = std::collections::HashSet::new();

        for _ in 0..20 {
            let jittered = apply_jitter(base, 0.5);
            assert!(jittered >= Duration::from_secs(5));
            assert!(jittered <= Duration::from_secs(15));
            seen.insert(jittered.as_millis());
        }

        assert!(seen.len() > 1, "jitter should create variation");
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy { max_attempts: 0, ..Default::default() }.validate().is_err());
        assert!(RetryPolicy { jitter_factor: 1.5, ..Default::default() }.validate().is_err());
        assert!(RetryPolicy {
            base_delay: Duration::from_secs(120),
            max_delay: Duration::from_secs(60),
            ..Default::default()
        }
        .validate()
        .is_err());
    }
}
