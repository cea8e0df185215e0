//! Retry policy and the retry loop
//!
//! [`RetryPolicy`] decides *whether* a failure is worth retrying;
//! [`BackoffPolicy`] decides *how long* to wait; [`RetryController`] drives
//! the attempts.
//!
//! # Example
//! ```
//! use tollgate_core_resilience::{
//!     AttemptOutcome, BackoffPolicy, ManualClock, RetryController, RetryPolicy, RunContext,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let controller = RetryController::new(
//!     RetryPolicy::default(),
//!     BackoffPolicy::exponential(Duration::from_millis(10), Duration::from_secs(1), 2.0),
//! )
//! .unwrap()
//! .with_clock(Arc::new(ManualClock::new()));
//!
//! let value = controller
//!     .run(&RunContext::new(), |attempt| async move {
//!         if attempt.number < 3 {
//!             AttemptOutcome::transient("connection reset")
//!         } else {
//!             AttemptOutcome::Success(attempt.number)
//!         }
//!     })
//!     .await
//!     .unwrap();
//! assert_eq!(value, 3);
//! # }
//! ```

use crate::backoff::BackoffPolicy;
use crate::clock::{Clock, TokioClock};
use crate::context::{Attempt, RunContext};
use crate::error::{ExecutionError, ResilienceError};
use crate::outcome::{AttemptOutcome, Failure, FailureKind, OutcomeReport};
use crate::rate_limiter::TOO_MANY_REQUESTS;
use crate::stats::ExecutionStats;
use crate::token_bucket::MAX_RETRY_AFTER;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn, Instrument};

/// Status codes retried by default
pub const DEFAULT_RETRYABLE_STATUS_CODES: [u16; 4] = [429, 502, 503, 504];

/// Caller-supplied rule deciding which failures are transient
pub type RetryPredicate = Arc<dyn Fn(FailureKind) -> bool + Send + Sync>;

/// Which failures are retried, and how many times
#[derive(Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt
    pub max_retries: u32,
    /// Status codes treated as transient
    pub retryable_status_codes: BTreeSet<u16>,
    /// Wait at least as long as a server-supplied `Retry-After`
    pub respect_retry_after: bool,
    /// Replaces the built-in rule (timeouts, connection errors, 429, 5xx)
    /// for failures outside `retryable_status_codes`
    pub retryable_predicate: Option<RetryPredicate>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field("respect_retry_after", &self.respect_retry_after)
            .field(
                "retryable_predicate",
                &self.retryable_predicate.as_ref().map(|_| "<predicate>"),
            )
            .finish()
    }
}

impl PartialEq for RetryPolicy {
    fn eq(&self, other: &Self) -> bool {
        let same_predicate = match (&self.retryable_predicate, &other.retryable_predicate) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        self.max_retries == other.max_retries
            && self.retryable_status_codes == other.retryable_status_codes
            && self.respect_retry_after == other.respect_retry_after
            && same_predicate
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.into_iter().collect(),
            respect_retry_after: true,
            retryable_predicate: None,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, never retried
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Same policy with a different retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Same policy with `predicate` in place of the built-in rule
    pub fn with_retryable_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(FailureKind) -> bool + Send + Sync + 'static,
    {
        self.retryable_predicate = Some(Arc::new(predicate));
        self
    }

    /// Built-in rule: timeouts, connection errors, 429 and 5xx
    pub fn default_predicate(kind: FailureKind) -> bool {
        match kind {
            FailureKind::Timeout | FailureKind::Connection => true,
            FailureKind::Status(status) => {
                status == TOO_MANY_REQUESTS || (500..600).contains(&status)
            }
            FailureKind::Other => false,
        }
    }

    /// Check if a response status is worth retrying
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.is_transient(FailureKind::Status(status))
    }

    /// Transient iff the status is in `retryable_status_codes`, or the
    /// predicate (built-in unless replaced) accepts the failure. Other 4xx
    /// and everything else are permanent.
    pub fn is_transient(&self, kind: FailureKind) -> bool {
        if let FailureKind::Status(status) = kind {
            if self.retryable_status_codes.contains(&status) {
                return true;
            }
        }
        match &self.retryable_predicate {
            Some(predicate) => predicate(kind),
            None => Self::default_predicate(kind),
        }
    }

    /// Build the outcome a transport should report for a failure
    pub fn classify<T, E>(
        &self,
        kind: FailureKind,
        error: E,
        retry_after: Option<Duration>,
    ) -> AttemptOutcome<T, E> {
        let mut failure = Failure::new(error).with_retry_after(retry_after);
        if let FailureKind::Status(status) = kind {
            failure = failure.with_status(status);
        }
        if self.is_transient(kind) {
            AttemptOutcome::TransientFailure(failure)
        } else {
            AttemptOutcome::PermanentFailure(failure)
        }
    }
}

/// Passed to the retry observer before every backoff sleep
#[derive(Debug, Clone, PartialEq)]
pub struct RetryEvent {
    /// Number of the attempt that just failed
    pub attempt: u32,
    /// Sleep about to be taken
    pub delay: Duration,
    /// Why the attempt is being retried
    pub reason: String,
    /// Correlation ID of the run
    pub correlation_id: Arc<str>,
}

/// Synchronous hook for logging or metrics, called before each sleep
pub type RetryObserver = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

/// Why an attempt was refused before it started
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GateRejection {
    CircuitOpen(String),
    Timeout,
}

/// Admission and bookkeeping around each attempt
#[async_trait]
pub(crate) trait AttemptGate: Send + Sync {
    /// Decide whether the next attempt may start
    async fn admit(&self, deadline: Option<Instant>) -> Result<(), GateRejection>;

    /// Rejection the next `admit` is certain to return, checked before
    /// sleeping for a retry. Must not change any state.
    async fn blocked(&self) -> Option<GateRejection>;

    /// Learn how the attempt went
    async fn record(&self, report: OutcomeReport);
}

/// Gate that admits everything and records nothing
struct Ungated;

#[async_trait]
impl AttemptGate for Ungated {
    async fn admit(&self, _deadline: Option<Instant>) -> Result<(), GateRejection> {
        Ok(())
    }

    async fn blocked(&self) -> Option<GateRejection> {
        None
    }

    async fn record(&self, _report: OutcomeReport) {}
}

/// Drives repeated attempts of one unit of work
#[derive(Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
    observer: Option<RetryObserver>,
    stats: Arc<ExecutionStats>,
}

impl fmt::Debug for RetryController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryController")
            .field("policy", &self.policy)
            .field("backoff", &self.backoff)
            .field("clock", &self.clock)
            .field("observer", &self.observer.as_ref().map(|_| "<observer>"))
            .finish()
    }
}

impl RetryController {
    /// Create a controller using the tokio clock
    pub fn new(policy: RetryPolicy, backoff: BackoffPolicy) -> Result<Self, ResilienceError> {
        backoff.validate()?;
        Ok(Self {
            policy,
            backoff,
            clock: Arc::new(TokioClock),
            observer: None,
            stats: Arc::new(ExecutionStats::new()),
        })
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Install a retry observer
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub(crate) fn with_stats(mut self, stats: Arc<ExecutionStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Default policy for runs that do not override it
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Backoff schedule
    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Counters for every run driven by this controller
    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    /// Run `attempt_fn` until it succeeds, fails permanently, exhausts the
    /// retry budget or hits the context's deadline.
    pub async fn run<T, E, F, Fut>(
        &self,
        ctx: &RunContext,
        attempt_fn: F,
    ) -> Result<T, ExecutionError<E>>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = AttemptOutcome<T, E>>,
        E: fmt::Display,
    {
        self.run_gated(ctx, &Ungated, attempt_fn).await
    }

    pub(crate) async fn run_gated<T, E, F, Fut>(
        &self,
        ctx: &RunContext,
        gate: &dyn AttemptGate,
        attempt_fn: F,
    ) -> Result<T, ExecutionError<E>>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = AttemptOutcome<T, E>>,
        E: fmt::Display,
    {
        let span = tracing::debug_span!("run", correlation_id = %ctx.correlation_id);
        self.drive(ctx, gate, attempt_fn).instrument(span).await
    }

    async fn drive<T, E, F, Fut>(
        &self,
        ctx: &RunContext,
        gate: &dyn AttemptGate,
        mut attempt_fn: F,
    ) -> Result<T, ExecutionError<E>>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = AttemptOutcome<T, E>>,
        E: fmt::Display,
    {
        let policy = ctx.retry_policy.as_ref().unwrap_or(&self.policy);
        let started = self.clock.now();
        // A timeout too large to represent means no deadline
        let deadline = ctx.timeout.and_then(|timeout| started.checked_add(timeout));
        self.stats.record_run();

        let mut attempt: u32 = 1;
        loop {
            if let Err(rejection) = gate.admit(deadline).await {
                return Err(self.rejected(rejection, started));
            }

            self.stats.record_attempt();
            let call = attempt_fn(Attempt {
                number: attempt,
                correlation_id: Arc::clone(&ctx.correlation_id),
            });
            let outcome = match deadline {
                None => call.await,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(self.clock.now());
                    tokio::select! {
                        biased;
                        outcome = call => outcome,
                        _ = self.clock.sleep(remaining) => {
                            gate.record(OutcomeReport::Abandoned).await;
                            warn!(attempt, "Deadline expired during attempt");
                            self.stats.record_timeout();
                            return Err(self.timeout(started));
                        }
                    }
                }
            };

            let report = outcome.report();
            gate.record(report).await;

            let failure = match outcome {
                AttemptOutcome::Success(value) => {
                    self.stats.record_success();
                    if attempt > 1 {
                        info!(attempts = attempt, "Succeeded after retries");
                    }
                    return Ok(value);
                }
                AttemptOutcome::PermanentFailure(failure) => {
                    self.stats.record_permanent();
                    debug!(attempt, error = %failure.error, "Permanent failure, not retrying");
                    return Err(ExecutionError::Permanent(failure.error));
                }
                AttemptOutcome::TransientFailure(failure) => failure,
            };

            if attempt > policy.max_retries {
                self.stats.record_exhausted();
                warn!(
                    attempts = attempt,
                    max_retries = policy.max_retries,
                    error = %failure.error,
                    "Retries exhausted"
                );
                return Err(ExecutionError::MaxRetriesExceeded {
                    attempts: attempt,
                    max_retries: policy.max_retries,
                    last_error: failure.error,
                });
            }

            if let Some(rejection) = gate.blocked().await {
                debug!(attempt, "Next attempt would be rejected, not retrying");
                return Err(self.rejected(rejection, started));
            }

            let mut delay = self.backoff.delay(attempt);
            if policy.respect_retry_after {
                if let Some(retry_after) = failure.retry_after {
                    delay = delay.max(retry_after.min(MAX_RETRY_AFTER));
                }
            }

            if let Some(deadline) = deadline {
                let wakes = self.clock.now().checked_add(delay);
                if wakes.map_or(true, |wakes| wakes > deadline) {
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "Backoff would overrun deadline");
                    self.stats.record_timeout();
                    return Err(self.timeout(started));
                }
            }

            let event = RetryEvent {
                attempt,
                delay,
                reason: report.reason(),
                correlation_id: Arc::clone(&ctx.correlation_id),
            };
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %event.reason,
                error = %failure.error,
                "Retrying after transient failure"
            );
            if let Some(observer) = &self.observer {
                observer(&event);
            }

            self.stats.record_retry();
            self.clock.sleep(delay).await;
            attempt += 1;
        }
    }

    fn rejected<E>(&self, rejection: GateRejection, started: Instant) -> ExecutionError<E> {
        match rejection {
            GateRejection::CircuitOpen(name) => {
                self.stats.record_circuit_rejection();
                ExecutionError::CircuitOpen { name }
            }
            GateRejection::Timeout => {
                self.stats.record_timeout();
                self.timeout(started)
            }
        }
    }

    fn timeout<E>(&self, started: Instant) -> ExecutionError<E> {
        ExecutionError::Timeout {
            waited: self.clock.now().saturating_duration_since(started),
        }
    }
}
