//! Per-destination token bucket.
//!
//! Each worker owns one bucket. The bucket starts full (`budget` tokens) and
//! regains one token every `window / budget`, so a destination never sends
//! more than `budget` payloads in any sliding minute beyond the initial
//! burst.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use beacon_core::Clock;

/// Window over which the budget applies.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Token bucket driven by an injected clock.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    tokens: u32,
    refill_interval: Duration,
    last_refill: Instant,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Creates a full bucket allowing `per_minute` sends per minute.
    ///
    /// A zero budget is treated as one.
    pub fn per_minute(per_minute: u32, clock: Arc<dyn Clock>) -> Self {
        Self::with_window(per_minute, RATE_WINDOW, clock)
    }

    /// Creates a full bucket allowing `capacity` sends per `window`.
    pub fn with_window(capacity: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity.max(1);
        let refill_interval = window / capacity;
        let last_refill = clock.now();
        Self { capacity, tokens: capacity, refill_interval, last_refill, clock }
    }

    /// Tokens currently available.
    pub fn available(&mut self) -> u32 {
        self.refill();
        self.tokens
    }

    /// Takes a token if one is available.
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }

    /// Time until the next token becomes available; zero if one is ready.
    pub fn time_until_available(&mut self) -> Duration {
        self.refill();
        if self.tokens > 0 {
            return Duration::ZERO;
        }
        let since_refill = self.clock.now().saturating_duration_since(self.last_refill);
        self.refill_interval.saturating_sub(since_refill)
    }

    /// Waits on the clock until a token can be taken, then takes it.
    ///
    /// Callers that must stay cancellable wrap this in `tokio::select!`.
    pub async fn acquire(&mut self) {
        loop {
            if self.try_acquire() {
                return;
            }
            let wait = self.time_until_available();
            self.clock.sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    fn refill(&mut self) {
        if self.refill_interval.is_zero() {
            self.tokens = self.capacity;
            return;
        }

        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        let earned = elapsed.as_nanos() / self.refill_interval.as_nanos();
        if earned == 0 {
            return;
        }

        let earned = u32::try_from(earned).unwrap_or(u32::MAX);
        self.tokens = self.tokens.saturating_add(earned).min(self.capacity);
        if self.tokens == self.capacity {
            self.last_refill = now;
        } else {
            self.last_refill += self.refill_interval * earned;
        }
    }
}

#[cfg(test)]
mod tests {
    use beacon_core::TestClock;

    use super::*;

    fn limiter(budget: u32) -> (RateLimiter, TestClock) {
        let clock = TestClock::new();
        (RateLimiter::per_minute(budget, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn starts_with_a_full_burst() {
        let (mut limiter, _clock) = limiter(3);

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn refills_one_token_per_interval() {
        let (mut limiter, clock) = limiter(60);
        while limiter.try_acquire() {}

        assert_eq!(limiter.time_until_available(), Duration::from_secs(1));

        clock.advance(Duration::from_millis(999));
        assert!(!limiter.try_acquire());

        clock.advance(Duration::from_millis(1));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn idle_time_never_exceeds_capacity() {
        let (mut limiter, clock) = limiter(5);
        limiter.try_acquire();

        clock.advance(Duration::from_secs(3600));

        assert_eq!(limiter.available(), 5);
    }

    #[test]
    fn zero_budget_is_treated_as_one() {
        let (mut limiter, _clock) = limiter(0);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn acquire_sleeps_on_the_clock() {
        let (mut limiter, clock) = limiter(2);

        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(clock.elapsed(), Duration::ZERO);

        limiter.acquire().await;
        assert_eq!(clock.elapsed(), Duration::from_secs(30));
    }
}
