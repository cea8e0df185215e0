//! Rate limiting for preventing service overload
//!
//! [`RateLimiter`] is the policy layer over a [`TokenBucket`]: non-blocking
//! and blocking acquisition, server-dictated pauses (`Retry-After`) and an
//! optional adaptive mode that speeds up on success and backs off on 429s.
//!
//! # Example
//! ```no_run
//! use tollgate_core_resilience::{RateLimiter, RateLimiterConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), tollgate_core_resilience::ResilienceError> {
//! // 5 requests per second, bursts of up to 10
//! let limiter = RateLimiter::new("api.example.com", RateLimiterConfig::per_second(5.0, 10.0))?;
//!
//! if limiter.acquire(1.0, Some(Duration::from_secs(2))).await {
//!     // send the request
//! }
//! # Ok(())
//! # }
//! ```

use crate::clock::{Clock, TokioClock};
use crate::error::ResilienceError;
use crate::headers::{header_value, parse_retry_after, RateLimitHeaders, RETRY_AFTER};
use crate::token_bucket::{validate_rate, BucketSnapshot, TokenBucket, TokenBucketConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Status code servers use to signal throttling
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Tuning for adaptive rate adjustment
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveConfig {
    /// Floor for the refill rate
    pub min_rate: f64,
    /// Ceiling for the refill rate
    pub max_rate: f64,
    /// Multiplier applied on every success (> 1)
    pub increase_factor: f64,
    /// Multiplier applied per consecutive 429 (between 0 and 1)
    pub decrease_factor: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_rate: 1.0,
            max_rate: 100.0,
            increase_factor: 1.1,
            decrease_factor: 0.75,
        }
    }
}

impl AdaptiveConfig {
    fn validate(&self, initial_rate: f64) -> Result<(), ResilienceError> {
        validate_rate(self.min_rate)?;
        validate_rate(self.max_rate)?;
        if self.min_rate > self.max_rate {
            return Err(ResilienceError::InvalidConfig(format!(
                "min_rate {} exceeds max_rate {}",
                self.min_rate, self.max_rate
            )));
        }
        if !(initial_rate >= self.min_rate && initial_rate <= self.max_rate) {
            return Err(ResilienceError::InvalidConfig(format!(
                "refill_rate {} outside adaptive bounds [{}, {}]",
                initial_rate, self.min_rate, self.max_rate
            )));
        }
        if !(self.increase_factor.is_finite() && self.increase_factor > 1.0) {
            return Err(ResilienceError::InvalidConfig(format!(
                "increase_factor must be greater than 1 (got {})",
                self.increase_factor
            )));
        }
        if !(self.decrease_factor > 0.0 && self.decrease_factor < 1.0) {
            return Err(ResilienceError::InvalidConfig(format!(
                "decrease_factor must be between 0 and 1 (got {})",
                self.decrease_factor
            )));
        }
        Ok(())
    }
}

/// Configuration for a rate limiter
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Underlying bucket shape
    pub bucket: TokenBucketConfig,
    /// Honour `Retry-After` on 429 responses
    pub respect_retry_after: bool,
    /// Adaptive rate adjustment, disabled when `None`
    pub adaptive: Option<AdaptiveConfig>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            bucket: TokenBucketConfig::default(),
            respect_retry_after: true,
            adaptive: None,
        }
    }
}

impl RateLimiterConfig {
    /// `rate` permits per second with room for `capacity` at once
    pub fn per_second(rate: f64, capacity: f64) -> Self {
        Self {
            bucket: TokenBucketConfig {
                capacity,
                refill_rate: rate,
                burst_capacity: None,
            },
            ..Default::default()
        }
    }

    /// `requests` permits per minute, all available at once
    pub fn per_minute(requests: f64) -> Self {
        Self::per_second(requests / 60.0, requests)
    }

    /// Enable adaptive adjustment
    pub fn with_adaptive(mut self, adaptive: AdaptiveConfig) -> Self {
        self.adaptive = Some(adaptive);
        self
    }

    /// Check that every value is usable
    pub fn validate(&self) -> Result<(), ResilienceError> {
        self.bucket.validate()?;
        if let Some(adaptive) = &self.adaptive {
            adaptive.validate(self.bucket.refill_rate)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct AdaptiveState {
    config: AdaptiveConfig,
    current_rate: f64,
    consecutive_rate_limits: u32,
}

/// Token-bucket rate limiter shared by every caller of one destination
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    bucket: TokenBucket,
    clock: Arc<dyn Clock>,
    respect_retry_after: bool,
    adaptive: Option<Mutex<AdaptiveState>>,
}

impl RateLimiter {
    /// Create a rate limiter driven by the tokio clock
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Result<Self, ResilienceError> {
        Self::with_clock(name, config, Arc::new(TokioClock))
    }

    /// Create a rate limiter driven by the given clock
    pub fn with_clock(
        name: impl Into<String>,
        config: RateLimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        let adaptive = config.adaptive.map(|adaptive| {
            Mutex::new(AdaptiveState {
                config: adaptive,
                current_rate: config.bucket.refill_rate,
                consecutive_rate_limits: 0,
            })
        });
        Ok(Self {
            name: name.into(),
            bucket: TokenBucket::with_clock(config.bucket, Arc::clone(&clock))?,
            clock,
            respect_retry_after: config.respect_retry_after,
            adaptive,
        })
    }

    /// Destination this limiter protects
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take `n` permits if they are available right now
    pub fn try_acquire(&self, n: f64) -> bool {
        self.bucket.consume(n)
    }

    /// Wait for `n` permits, giving up after `timeout` (`None` waits forever).
    ///
    /// Every failed try is followed by a sleep of the computed wait time,
    /// capped by the remaining budget. No lock is held while sleeping.
    pub async fn acquire(&self, n: f64, timeout: Option<Duration>) -> bool {
        if n > self.bucket.max_grant() {
            warn!(
                limiter = %self.name,
                requested = n,
                max = self.bucket.max_grant(),
                "Permit request can never be satisfied"
            );
            return false;
        }

        // A timeout too large to represent waits forever
        let deadline = timeout.and_then(|t| self.clock.now().checked_add(t));
        loop {
            if self.bucket.consume(n) {
                return true;
            }

            let mut wait = self.bucket.time_until_available(n);
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(self.clock.now());
                if remaining.is_zero() {
                    debug!(limiter = %self.name, "Timed out waiting for permit");
                    return false;
                }
                wait = wait.min(remaining);
            }
            // Float rounding can report a zero wait for a bucket a hair short.
            let wait = wait.max(Duration::from_millis(1));

            debug!(limiter = %self.name, wait_ms = wait.as_millis() as u64, "Waiting for permit");
            self.clock.sleep(wait).await;
        }
    }

    /// Inspect a response; a 429 carrying `Retry-After` pauses the bucket
    pub fn on_response(&self, status: u16, headers: &HashMap<String, String>) {
        if status != TOO_MANY_REQUESTS {
            return;
        }
        let retry_after = header_value(headers, RETRY_AFTER)
            .and_then(|value| parse_retry_after(value, self.clock.utc_now()));
        self.on_rate_limited(retry_after);
    }

    /// Record a 429 whose `Retry-After` (if any) was already parsed
    pub fn on_rate_limited(&self, retry_after: Option<Duration>) {
        if let Some(delay) = retry_after {
            self.set_retry_after(delay);
        }
        self.record_rate_limited();
    }

    /// Pause the bucket for `delay` when Retry-After is respected
    pub fn set_retry_after(&self, delay: Duration) {
        if !self.respect_retry_after {
            debug!(limiter = %self.name, "Ignoring Retry-After");
            return;
        }
        warn!(
            limiter = %self.name,
            retry_after_secs = delay.as_secs_f64(),
            "Server requested pause"
        );
        self.bucket.set_retry_after(delay);
    }

    /// Adapt to `X-RateLimit-*` headers advertised by the server
    pub fn update_from_headers(&self, headers: &HashMap<String, String>) -> RateLimitHeaders {
        let parsed = RateLimitHeaders::from_headers(headers, self.clock.utc_now());

        if parsed.remaining == Some(0) {
            if let Some(reset_in) = parsed.reset_in {
                self.set_retry_after(reset_in);
            }
        } else if let Some(rate) = parsed.sustainable_rate() {
            let rate = match &self.adaptive {
                Some(adaptive) => {
                    let mut state = adaptive.lock().unwrap_or_else(PoisonError::into_inner);
                    state.current_rate = rate.clamp(state.config.min_rate, state.config.max_rate);
                    state.current_rate
                }
                None => rate,
            };
            self.apply_rate(rate);
        }
        parsed
    }

    /// Adaptive mode: speed up after a success
    pub fn record_success(&self) {
        let Some(adaptive) = &self.adaptive else {
            return;
        };
        let rate = {
            let mut state = adaptive.lock().unwrap_or_else(PoisonError::into_inner);
            state.consecutive_rate_limits = 0;
            let next = (state.current_rate * state.config.increase_factor).min(state.config.max_rate);
            if next == state.current_rate {
                return;
            }
            state.current_rate = next;
            next
        };
        self.apply_rate(rate);
    }

    /// Adaptive mode: slow down after a 429.
    ///
    /// Each consecutive 429 compounds the reduction: the k-th one in a row
    /// multiplies the rate by `decrease_factor^k`.
    pub fn record_rate_limited(&self) {
        let Some(adaptive) = &self.adaptive else {
            return;
        };
        let rate = {
            let mut state = adaptive.lock().unwrap_or_else(PoisonError::into_inner);
            state.consecutive_rate_limits = state.consecutive_rate_limits.saturating_add(1);
            let factor = state
                .config
                .decrease_factor
                .powi(state.consecutive_rate_limits.min(i32::MAX as u32) as i32);
            state.current_rate = (state.current_rate * factor).max(state.config.min_rate);
            state.current_rate
        };
        info!(limiter = %self.name, rate, "Reduced request rate after 429");
        self.apply_rate(rate);
    }

    fn apply_rate(&self, rate: f64) {
        if let Err(e) = self.bucket.set_refill_rate(rate) {
            warn!(limiter = %self.name, error = %e, "Rejected refill rate");
        } else {
            debug!(limiter = %self.name, rate, "Refill rate updated");
        }
    }

    /// Current refill rate in permits per second
    pub fn current_rate(&self) -> f64 {
        self.bucket.refill_rate()
    }

    /// Permits available right now
    pub fn available(&self) -> f64 {
        self.bucket.available()
    }

    /// Remaining server-imposed pause, if any
    pub fn retry_after_remaining(&self) -> Option<Duration> {
        self.bucket.retry_after_remaining()
    }

    /// Point-in-time view of the underlying bucket
    pub fn snapshot(&self) -> BucketSnapshot {
        self.bucket.snapshot()
    }

    /// Refill the bucket and clear any server-imposed pause
    pub fn reset(&self) {
        self.bucket.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(config: RateLimiterConfig, clock: &ManualClock) -> RateLimiter {
        RateLimiter::with_clock("test", config, Arc::new(clock.clone())).unwrap()
    }

    fn adaptive_limiter(clock: &ManualClock) -> RateLimiter {
        limiter(
            RateLimiterConfig::per_second(10.0, 10.0).with_adaptive(AdaptiveConfig {
                min_rate: 1.0,
                max_rate: 20.0,
                ..Default::default()
            }),
            clock,
        )
    }

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_concurrent_try_acquire_single_permit() {
        let clock = ManualClock::new();
        let limiter = Arc::new(limiter(RateLimiterConfig::per_second(1.0, 1.0), &clock));

        let a = tokio::spawn({
            let limiter = Arc::clone(&limiter);
            async move { limiter.try_acquire(1.0) }
        });
        let b = tokio::spawn({
            let limiter = Arc::clone(&limiter);
            async move { limiter.try_acquire(1.0) }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert!(a ^ b, "exactly one caller gets the permit");

        clock.advance(Duration::from_secs(1));
        assert!(limiter.try_acquire(1.0));
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        let clock = ManualClock::new();
        let limiter = limiter(RateLimiterConfig::per_second(1.0, 1.0), &clock);

        assert!(limiter.try_acquire(1.0));
        assert!(limiter.acquire(1.0, Some(Duration::from_secs(2))).await);

        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    }

    #[tokio::test]
    async fn test_acquire_times_out() {
        let clock = ManualClock::new();
        let limiter = limiter(RateLimiterConfig::per_second(1.0, 1.0), &clock);

        assert!(limiter.try_acquire(1.0));
        assert!(!limiter.acquire(1.0, Some(Duration::from_millis(100))).await);

        // Slept exactly the remaining budget, never longer.
        assert_eq!(clock.total_slept(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_acquire_with_unbounded_timeout_waits() {
        let clock = ManualClock::new();
        let limiter = limiter(RateLimiterConfig::per_second(2.0, 1.0), &clock);

        assert!(limiter.try_acquire(1.0));
        assert!(limiter.acquire(1.0, Some(Duration::MAX)).await);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(500)]);
    }

    #[tokio::test]
    async fn test_acquire_rejects_unsatisfiable_request() {
        let clock = ManualClock::new();
        let limiter = limiter(RateLimiterConfig::per_second(1.0, 2.0), &clock);

        assert!(!limiter.acquire(3.0, None).await);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_retry_after_header_pauses_acquire() {
        let clock = ManualClock::new();
        let limiter = limiter(RateLimiterConfig::per_second(10.0, 10.0), &clock);

        limiter.on_response(429, &headers(&[("Retry-After", "5")]));
        assert!(!limiter.try_acquire(1.0));
        assert_eq!(limiter.retry_after_remaining(), Some(Duration::from_secs(5)));

        assert!(limiter.acquire(1.0, None).await);
        assert_eq!(clock.total_slept(), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_after_ignored_for_other_statuses_or_when_disabled() {
        let clock = ManualClock::new();
        let limiter_a = limiter(RateLimiterConfig::per_second(10.0, 10.0), &clock);
        limiter_a.on_response(503, &headers(&[("Retry-After", "5")]));
        assert_eq!(limiter_a.retry_after_remaining(), None);

        let limiter_b = limiter(
            RateLimiterConfig {
                respect_retry_after: false,
                ..RateLimiterConfig::per_second(10.0, 10.0)
            },
            &clock,
        );
        limiter_b.on_response(429, &headers(&[("Retry-After", "5")]));
        assert_eq!(limiter_b.retry_after_remaining(), None);
    }

    #[test]
    fn test_adaptive_success_increases_rate_up_to_max() {
        let clock = ManualClock::new();
        let limiter = adaptive_limiter(&clock);

        limiter.record_success();
        assert!(limiter.current_rate() > 10.0);

        for _ in 0..100 {
            limiter.record_success();
        }
        assert_eq!(limiter.current_rate(), 20.0);
    }

    #[test]
    fn test_adaptive_consecutive_rate_limits_compound() {
        let clock = ManualClock::new();
        let limiter = adaptive_limiter(&clock);

        let initial = limiter.current_rate();
        limiter.record_rate_limited();
        let after_first = limiter.current_rate();
        limiter.record_rate_limited();
        let after_second = limiter.current_rate();

        assert!(after_first < initial);
        assert!(after_second < after_first);
        assert!(after_second / after_first < after_first / initial);
        assert!(initial - after_first < after_first - after_second);

        for _ in 0..100 {
            limiter.record_rate_limited();
        }
        assert_eq!(limiter.current_rate(), 1.0);
    }

    #[test]
    fn test_adaptive_success_resets_compounding() {
        let clock = ManualClock::new();
        let limiter = adaptive_limiter(&clock);

        limiter.record_rate_limited();
        limiter.record_success();
        let before = limiter.current_rate();
        limiter.record_rate_limited();

        let ratio = limiter.current_rate() / before;
        assert!((ratio - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_non_adaptive_ignores_feedback() {
        let clock = ManualClock::new();
        let limiter = limiter(RateLimiterConfig::per_second(10.0, 10.0), &clock);

        limiter.record_success();
        limiter.record_rate_limited();

        assert_eq!(limiter.current_rate(), 10.0);
    }

    #[test]
    fn test_update_from_headers_slows_rate() {
        let clock = ManualClock::new();
        let limiter = limiter(RateLimiterConfig::per_second(10.0, 10.0), &clock);

        let parsed = limiter.update_from_headers(&headers(&[
            ("X-RateLimit-Limit", "60"),
            ("X-RateLimit-Remaining", "5"),
            ("X-RateLimit-Reset", "300"),
        ]));

        assert_eq!(parsed.limit, Some(60));
        assert!(limiter.current_rate() <= 1.0);
    }

    #[test]
    fn test_update_from_headers_exhausted_window_pauses() {
        let clock = ManualClock::new();
        let limiter = limiter(RateLimiterConfig::per_second(10.0, 10.0), &clock);

        limiter.update_from_headers(&headers(&[
            ("X-RateLimit-Remaining", "0"),
            ("X-RateLimit-Reset", "30"),
        ]));

        assert_eq!(limiter.retry_after_remaining(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_invalid_adaptive_bounds_rejected() {
        let config = RateLimiterConfig::per_second(50.0, 10.0).with_adaptive(AdaptiveConfig {
            min_rate: 1.0,
            max_rate: 20.0,
            ..Default::default()
        });
        assert!(RateLimiter::new("bad", config).is_err());
    }
}
