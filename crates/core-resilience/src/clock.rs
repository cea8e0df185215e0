//! Time source and sleep capability shared by every component
//!
//! Token refill, circuit cooldowns, backoff sleeps and deadlines all read time
//! through a [`Clock`]. Production code uses [`TokioClock`]; tests use
//! [`ManualClock`], whose `sleep` advances virtual time immediately so
//! multi-second backoffs run in microseconds and can be asserted exactly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Injectable clock + sleep capability
#[async_trait]
pub trait Clock: Send + Sync + Debug {
    /// Monotonic time, used for all elapsed-time arithmetic
    fn now(&self) -> Instant;

    /// Wall-clock time, used only to interpret HTTP-date headers
    fn utc_now(&self) -> DateTime<Utc>;

    /// Suspend the caller for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Clock backed by the tokio timer.
///
/// Honours `tokio::time::pause`, so tests running with paused time see
/// auto-advancing sleeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

#[derive(Debug)]
struct ManualState {
    offset: Duration,
    sleeps: Vec<Duration>,
}

/// Deterministic virtual clock.
///
/// `sleep` records the requested duration, advances virtual time by it and
/// yields to the scheduler once. Clones share the same timeline.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    utc_origin: DateTime<Utc>,
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    /// Create a clock starting at the current instant
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Create a clock whose wall time starts at `utc_origin`
    pub fn starting_at(utc_origin: DateTime<Utc>) -> Self {
        Self {
            origin: Instant::now(),
            utc_origin,
            state: Arc::new(Mutex::new(ManualState {
                offset: Duration::ZERO,
                sleeps: Vec::new(),
            })),
        }
    }

    /// Move virtual time forward without recording a sleep
    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.offset = state.offset.saturating_add(duration);
    }

    /// Virtual time elapsed since the clock was created
    pub fn elapsed(&self) -> Duration {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .offset
    }

    /// Every sleep requested so far, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sleeps
            .clone()
    }

    /// Sum of all recorded sleeps
    pub fn total_slept(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.elapsed())
            .ok()
            .and_then(|elapsed| self.utc_origin.checked_add_signed(elapsed))
            .unwrap_or(self.utc_origin)
    }

    async fn sleep(&self, duration: Duration) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.offset = state.offset.saturating_add(duration);
            state.sleeps.push(duration);
        }
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_clock_sleep_advances_time() {
        let clock = ManualClock::new();
        let start = clock.now();

        clock.sleep(Duration::from_secs(5)).await;
        clock.advance(Duration::from_millis(250));

        assert_eq!(clock.now() - start, Duration::from_millis(5250));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(5)]);
        assert_eq!(clock.total_slept(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_manual_clock_clones_share_timeline() {
        let clock = ManualClock::new();
        let other = clock.clone();

        other.sleep(Duration::from_secs(1)).await;

        assert_eq!(clock.elapsed(), Duration::from_secs(1));
        assert_eq!(clock.sleeps().len(), 1);
    }

    #[test]
    fn test_manual_clock_wall_time_follows_offset() {
        let origin = DateTime::parse_from_rfc3339("2015-10-21T07:28:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = ManualClock::starting_at(origin);

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.utc_now(), origin + chrono::Duration::seconds(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_respects_paused_time() {
        let clock = TokioClock;
        let start = clock.now();

        clock.sleep(Duration::from_secs(30)).await;

        assert!(clock.now() - start >= Duration::from_secs(30));
    }
}
