//! Token bucket with lazy refill and server-imposed pauses
//!
//! The bucket holds a capped, continuously refilling count of permits.
//! Refill is lazy: every read computes the elapsed time since the last refill
//! and adds `elapsed * refill_rate`, capped at capacity. A `Retry-After`
//! window blocks consumption entirely until it expires on its own.
//!
//! # Burst overdraft
//!
//! With `burst_capacity` set above `capacity`, a single consume may overdraw
//! the bucket down to `capacity - burst_capacity`. While the balance is
//! negative nothing else is granted; refill has to bring it back to zero
//! first.
//!
//! # Example
//!
//! ```
//! use tollgate_core_resilience::token_bucket::{TokenBucket, TokenBucketConfig};
//!
//! let bucket = TokenBucket::new(TokenBucketConfig {
//!     capacity: 10.0,
//!     refill_rate: 2.0,
//!     burst_capacity: None,
//! })
//! .unwrap();
//!
//! assert!(bucket.consume(5.0));
//! assert!(!bucket.consume(6.0));
//! ```

use crate::clock::{Clock, TokioClock};
use crate::error::ResilienceError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Longest pause a server can impose on a bucket
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for a token bucket
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucketConfig {
    /// Maximum number of tokens held after a refill
    pub capacity: f64,

    /// Tokens added per second
    pub refill_rate: f64,

    /// Optional overdraft ceiling; must exceed `capacity` when set
    pub burst_capacity: Option<f64>,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_rate: 10.0,
            burst_capacity: None,
        }
    }
}

impl TokenBucketConfig {
    /// Check that every value is usable
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if !(self.capacity.is_finite() && self.capacity > 0.0) {
            return Err(ResilienceError::InvalidConfig(format!(
                "capacity must be a positive number (got {})",
                self.capacity
            )));
        }
        validate_rate(self.refill_rate)?;
        if let Some(burst) = self.burst_capacity {
            if !(burst.is_finite() && burst > self.capacity) {
                return Err(ResilienceError::InvalidConfig(format!(
                    "burst_capacity must exceed capacity {} (got {})",
                    self.capacity, burst
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn validate_rate(rate: f64) -> Result<(), ResilienceError> {
    if rate.is_finite() && rate > 0.0 {
        Ok(())
    } else {
        Err(ResilienceError::InvalidConfig(format!(
            "refill_rate must be a positive number (got {})",
            rate
        )))
    }
}

/// Point-in-time view of a bucket
#[derive(Debug, Clone, PartialEq)]
pub struct BucketSnapshot {
    /// Tokens after refilling to "now"
    pub tokens: f64,
    /// Configured capacity
    pub capacity: f64,
    /// Current refill rate in tokens per second
    pub refill_rate: f64,
    /// Remaining server-imposed pause, if any
    pub blocked_for: Option<Duration>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
}

impl BucketState {
    fn refill(&mut self, now: Instant, capacity: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(capacity);
        self.last_refill = now;
    }

    /// Remaining pause, clearing the window once it has expired
    fn blocked_for(&mut self, now: Instant) -> Option<Duration> {
        match self.blocked_until {
            Some(until) if now < until => Some(until - now),
            Some(_) => {
                self.blocked_until = None;
                None
            }
            None => None,
        }
    }
}

/// Thread-safe token bucket.
///
/// Refill and consume happen under one mutex, so two callers can never both
/// be granted the last permit.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    burst_capacity: Option<f64>,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket driven by the tokio clock
    pub fn new(config: TokenBucketConfig) -> Result<Self, ResilienceError> {
        Self::with_clock(config, Arc::new(TokioClock))
    }

    /// Create a full bucket driven by the given clock
    pub fn with_clock(
        config: TokenBucketConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        let now = clock.now();
        Ok(Self {
            capacity: config.capacity,
            burst_capacity: config.burst_capacity,
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                refill_rate: config.refill_rate,
                last_refill: now,
                blocked_until: None,
            }),
            clock,
        })
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Try to take `n` tokens. Leaves the bucket untouched on failure.
    pub fn consume(&self, n: f64) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();

        if state.blocked_for(now).is_some() {
            return false;
        }
        state.refill(now, self.capacity);

        if state.tokens < 0.0 {
            return false;
        }
        if state.tokens >= n {
            state.tokens -= n;
            return true;
        }
        match self.burst_capacity {
            Some(burst) if state.tokens - n >= self.capacity - burst => {
                state.tokens -= n;
                true
            }
            _ => false,
        }
    }

    /// How long until `n` tokens could be consumed.
    ///
    /// An active Retry-After window takes precedence over token math.
    pub fn time_until_available(&self, n: f64) -> Duration {
        let now = self.clock.now();
        let mut state = self.lock();

        if let Some(remaining) = state.blocked_for(now) {
            return remaining;
        }
        state.refill(now, self.capacity);

        if state.tokens >= n {
            return Duration::ZERO;
        }
        let wait = (n - state.tokens) / state.refill_rate;
        Duration::try_from_secs_f64(wait).unwrap_or(Duration::MAX)
    }

    /// Block all consumption for `duration` from now
    pub fn set_retry_after(&self, duration: Duration) {
        let now = self.clock.now();
        let mut state = self.lock();
        state.blocked_until = Some(now + duration.min(MAX_RETRY_AFTER));
    }

    /// Remaining Retry-After window, if one is active
    pub fn retry_after_remaining(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.lock().blocked_for(now)
    }

    /// Refill the bucket and clear any Retry-After window
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut state = self.lock();
        state.tokens = self.capacity;
        state.blocked_until = None;
        state.last_refill = now;
    }

    /// Tokens available right now, after refill
    pub fn available(&self) -> f64 {
        let now = self.clock.now();
        let mut state = self.lock();
        state.refill(now, self.capacity);
        state.tokens
    }

    /// Change the refill rate. Tokens accrued so far are credited at the old
    /// rate first.
    pub fn set_refill_rate(&self, rate: f64) -> Result<(), ResilienceError> {
        validate_rate(rate)?;
        let now = self.clock.now();
        let mut state = self.lock();
        state.refill(now, self.capacity);
        state.refill_rate = rate;
        Ok(())
    }

    /// Current refill rate in tokens per second
    pub fn refill_rate(&self) -> f64 {
        self.lock().refill_rate
    }

    /// Configured capacity
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Largest request this bucket can ever grant in one consume
    pub fn max_grant(&self) -> f64 {
        self.burst_capacity.unwrap_or(self.capacity)
    }

    /// Point-in-time view, refilled to now
    pub fn snapshot(&self) -> BucketSnapshot {
        let now = self.clock.now();
        let mut state = self.lock();
        let blocked_for = state.blocked_for(now);
        state.refill(now, self.capacity);
        BucketSnapshot {
            tokens: state.tokens,
            capacity: self.capacity,
            refill_rate: state.refill_rate,
            blocked_for,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn bucket(capacity: f64, rate: f64, clock: &ManualClock) -> TokenBucket {
        TokenBucket::with_clock(
            TokenBucketConfig {
                capacity,
                refill_rate: rate,
                burst_capacity: None,
            },
            Arc::new(clock.clone()),
        )
        .unwrap()
    }

    #[test]
    fn test_consume_decrements_exactly() {
        let clock = ManualClock::new();
        let bucket = bucket(10.0, 2.0, &clock);

        assert!(bucket.consume(5.0));
        assert_eq!(bucket.available(), 5.0);
        assert!(bucket.consume(3.0));
        assert_eq!(bucket.available(), 2.0);
    }

    #[test]
    fn test_failed_consume_leaves_tokens_unchanged() {
        let clock = ManualClock::new();
        let bucket = bucket(10.0, 2.0, &clock);

        assert!(!bucket.consume(11.0));
        assert_eq!(bucket.available(), 10.0);

        assert!(bucket.consume(10.0));
        assert!(!bucket.consume(1.0));
        assert_eq!(bucket.available(), 0.0);
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let clock = ManualClock::new();
        let bucket = bucket(10.0, 2.0, &clock);
        assert!(bucket.consume(10.0));

        clock.advance(Duration::from_secs(2));
        assert_eq!(bucket.available(), 4.0);

        clock.advance(Duration::from_secs(3600));
        assert_eq!(bucket.available(), 10.0);
    }

    #[test]
    fn test_time_until_available() {
        let clock = ManualClock::new();
        let bucket = bucket(10.0, 5.0, &clock);
        assert!(bucket.consume(10.0));

        let wait = bucket.time_until_available(3.0);
        assert!((wait.as_secs_f64() - 0.6).abs() < 1e-9);

        clock.advance(Duration::from_secs(1));
        assert_eq!(bucket.time_until_available(3.0), Duration::ZERO);
    }

    #[test]
    fn test_retry_after_blocks_until_expiry() {
        let clock = ManualClock::new();
        let bucket = bucket(10.0, 5.0, &clock);

        bucket.set_retry_after(Duration::from_secs(5));
        assert!(!bucket.consume(1.0));
        assert_eq!(bucket.time_until_available(1.0), Duration::from_secs(5));

        clock.advance(Duration::from_secs(2));
        assert_eq!(bucket.retry_after_remaining(), Some(Duration::from_secs(3)));

        clock.advance(Duration::from_secs(3));
        assert_eq!(bucket.retry_after_remaining(), None);
        assert!(bucket.consume(1.0));
    }

    #[test]
    fn test_reset_restores_capacity_and_clears_override() {
        let clock = ManualClock::new();
        let bucket = bucket(4.0, 1.0, &clock);
        assert!(bucket.consume(4.0));
        bucket.set_retry_after(Duration::from_secs(60));

        bucket.reset();

        assert_eq!(bucket.retry_after_remaining(), None);
        assert!(bucket.consume(4.0));
    }

    #[test]
    fn test_burst_overdraft_blocks_further_debt() {
        let clock = ManualClock::new();
        let bucket = TokenBucket::with_clock(
            TokenBucketConfig {
                capacity: 10.0,
                refill_rate: 1.0,
                burst_capacity: Some(15.0),
            },
            Arc::new(clock.clone()),
        )
        .unwrap();

        assert!(bucket.consume(12.0));
        assert_eq!(bucket.available(), -2.0);
        assert!(!bucket.consume(1.0));
        assert_eq!(bucket.available(), -2.0);

        // Back to zero after two seconds; one more second buys a token.
        clock.advance(Duration::from_secs(3));
        assert!(bucket.consume(1.0));
    }

    #[test]
    fn test_burst_limit_is_enforced() {
        let clock = ManualClock::new();
        let bucket = TokenBucket::with_clock(
            TokenBucketConfig {
                capacity: 10.0,
                refill_rate: 1.0,
                burst_capacity: Some(15.0),
            },
            Arc::new(clock.clone()),
        )
        .unwrap();

        assert!(!bucket.consume(16.0));
        assert_eq!(bucket.available(), 10.0);
        assert_eq!(bucket.max_grant(), 15.0);
    }

    #[test]
    fn test_set_refill_rate_credits_old_rate_first() {
        let clock = ManualClock::new();
        let bucket = bucket(10.0, 1.0, &clock);
        assert!(bucket.consume(10.0));

        clock.advance(Duration::from_secs(2));
        bucket.set_refill_rate(4.0).unwrap();
        assert_eq!(bucket.available(), 2.0);

        clock.advance(Duration::from_secs(1));
        assert_eq!(bucket.available(), 6.0);
        assert!(bucket.set_refill_rate(0.0).is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let zero_capacity = TokenBucketConfig {
            capacity: 0.0,
            ..Default::default()
        };
        assert!(TokenBucket::new(zero_capacity).is_err());

        let small_burst = TokenBucketConfig {
            capacity: 10.0,
            refill_rate: 1.0,
            burst_capacity: Some(5.0),
        };
        assert!(small_burst.validate().is_err());
    }

    #[test]
    fn test_concurrent_consumers_never_overdraw() {
        let clock = ManualClock::new();
        let bucket = Arc::new(bucket(100.0, 1.0, &clock));
        let granted = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                let granted = Arc::clone(&granted);
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        if bucket.consume(1.0) {
                            granted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(granted.load(std::sync::atomic::Ordering::SeqCst), 100);
        assert_eq!(bucket.available(), 0.0);
    }
}
