//! Lock-free counters describing what a controller has done

use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals for one controller. Updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct ExecutionStats {
    runs: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    successes: AtomicU64,
    permanent_failures: AtomicU64,
    exhausted: AtomicU64,
    circuit_rejections: AtomicU64,
    timeouts: AtomicU64,
}

/// Copy of the counters at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Calls to `run`
    pub runs: u64,
    /// Invocations of the attempt function
    pub attempts: u64,
    /// Backoff sleeps taken
    pub retries: u64,
    /// Runs that returned a value
    pub successes: u64,
    /// Runs ended by a permanent failure
    pub permanent_failures: u64,
    /// Runs that used up their retry budget
    pub exhausted: u64,
    /// Attempts refused by an open circuit
    pub circuit_rejections: u64,
    /// Runs that hit their deadline
    pub timeouts: u64,
}

impl ExecutionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_run(&self) {
        self.runs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_permanent(&self) {
        self.permanent_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Fraction of finished runs that returned a value
    pub fn success_rate(&self) -> f64 {
        let finished = self.successes
            + self.permanent_failures
            + self.exhausted
            + self.timeouts
            + self.circuit_rejections;
        if finished == 0 {
            return 1.0;
        }
        self.successes as f64 / finished as f64
    }
}
