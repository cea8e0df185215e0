//! Exponential backoff with optional jitter
//!
//! `delay(attempt) = min(max_delay, base_delay * multiplier^(attempt - 1))`,
//! then, with jitter on, scaled by a uniform factor in `[0.5, 1.5]` so that
//! many clients failing together do not retry in lockstep.

use crate::error::ResilienceError;
use rand::Rng;
use std::time::Duration;

/// Immutable backoff schedule. Attempts are numbered from 1.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Upper bound on the unjittered delay
    pub max_delay: Duration,
    /// Growth factor between attempts (>= 1)
    pub multiplier: f64,
    /// Perturb delays by up to ±50%
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Deterministic schedule without jitter
    pub fn exponential(base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier,
            jitter: false,
        }
    }

    /// Same schedule with jitter toggled
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Check that every value is usable
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(ResilienceError::InvalidConfig(format!(
                "multiplier must be at least 1 (got {})",
                self.multiplier
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(ResilienceError::InvalidConfig(format!(
                "base_delay {:?} exceeds max_delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }

    /// Capped exponential delay before jitter. Attempt 0 maps to zero.
    pub fn base_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay to wait after failed attempt number `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_for(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor = rand::rng().random_range(0.5..=1.5);
        Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
    }

    /// Total unjittered wait across `retries` retries
    pub fn total_delay(&self, retries: u32) -> Duration {
        (1..=retries).map(|attempt| self.base_for(attempt)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let policy =
            BackoffPolicy::exponential(Duration::from_millis(100), Duration::from_secs(60), 2.0);

        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_monotonic_and_capped() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(30), 3.0);

        let mut previous = Duration::ZERO;
        for attempt in 1..=64 {
            let delay = policy.delay(attempt);
            assert!(delay >= previous, "attempt {attempt} shrank");
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_half_band() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(60), 2.0)
            .with_jitter(true);

        for attempt in 1..=6 {
            let base = policy.base_for(attempt).as_secs_f64();
            for _ in 0..200 {
                let delay = policy.delay(attempt).as_secs_f64();
                assert!(delay >= 0.5 * base - 1e-9, "{delay} below band for {base}");
                assert!(delay <= 1.5 * base + 1e-9, "{delay} above band for {base}");
            }
        }
    }

    #[test]
    fn test_jitter_actually_varies() {
        let policy = BackoffPolicy::default();
        let samples: Vec<Duration> = (0..50).map(|_| policy.delay(3)).collect();
        assert!(samples.iter().any(|d| *d != samples[0]));
    }

    #[test]
    fn test_total_delay() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(5), 2.0);
        // 1 + 2 + 4 + 5
        assert_eq!(policy.total_delay(4), Duration::from_secs(12));
    }

    #[test]
    fn test_validation() {
        assert!(BackoffPolicy::default().validate().is_ok());

        let shrinking = BackoffPolicy {
            multiplier: 0.5,
            ..Default::default()
        };
        assert!(shrinking.validate().is_err());

        let inverted = BackoffPolicy::exponential(Duration::from_secs(10), Duration::from_secs(1), 2.0);
        assert!(inverted.validate().is_err());
    }
}
