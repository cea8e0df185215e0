//! The execution controller: one entry point composing every primitive
//!
//! For each attempt, side effects happen in a fixed order:
//!
//! ```text
//! circuit check → permit acquisition → attempt → outcome recording → retry decision
//! ```
//!
//! An open circuit therefore never costs a rate-limit token, and no permit
//! wait happens while the circuit is open.

use crate::backoff::BackoffPolicy;
use crate::circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::clock::{Clock, TokioClock};
use crate::context::{Attempt, RunContext};
use crate::error::{ExecutionError, ResilienceError};
use crate::headers::{header_value, parse_retry_after, RETRY_AFTER};
use crate::outcome::{AttemptOutcome, FailureKind, OutcomeReport};
use crate::rate_limiter::{RateLimiter, RateLimiterConfig, TOO_MANY_REQUESTS};
use crate::retry::{AttemptGate, GateRejection, RetryController, RetryEvent, RetryPolicy};
use crate::stats::{ExecutionStats, StatsSnapshot};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::Instrument;

/// Everything needed to build an [`ExecutionController`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionConfig {
    pub retry: RetryPolicy,
    pub backoff: BackoffPolicy,
    pub rate_limit: RateLimiterConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl ExecutionConfig {
    /// Check every component's settings
    pub fn validate(&self) -> Result<(), ResilienceError> {
        self.backoff.validate()?;
        self.rate_limit.validate()?;
        self.circuit_breaker.validate()?;
        Ok(())
    }
}

/// Point-in-time view of a controller, for status output
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerStatus {
    pub name: String,
    pub circuit: CircuitState,
    pub available_permits: f64,
    pub current_rate: f64,
    pub stats: StatsSnapshot,
}

/// Rate-limited, retrying, circuit-broken execution for one destination.
///
/// Cloning is cheap and clones share the limiter, breaker and counters.
#[derive(Debug, Clone)]
pub struct ExecutionController {
    name: Arc<str>,
    breaker: CircuitBreaker,
    limiter: Arc<RateLimiter>,
    retry: RetryController,
    clock: Arc<dyn Clock>,
    stats: Arc<ExecutionStats>,
}

impl ExecutionController {
    /// Build a controller on the tokio clock
    pub fn new(name: impl Into<Arc<str>>, config: ExecutionConfig) -> Result<Self, ResilienceError> {
        Self::with_clock(name, config, Arc::new(TokioClock))
    }

    /// Build a controller whose components all read `clock`
    pub fn with_clock(
        name: impl Into<Arc<str>>,
        config: ExecutionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        let name: Arc<str> = name.into();
        let breaker =
            CircuitBreaker::with_clock(Arc::clone(&name), config.circuit_breaker, Arc::clone(&clock))?;
        let limiter = RateLimiter::with_clock(name.to_string(), config.rate_limit, Arc::clone(&clock))?;
        let stats = Arc::new(ExecutionStats::new());
        let retry = RetryController::new(config.retry, config.backoff)?
            .with_clock(Arc::clone(&clock))
            .with_stats(Arc::clone(&stats));

        Ok(Self {
            name,
            breaker,
            limiter: Arc::new(limiter),
            retry,
            clock,
            stats,
        })
    }

    /// Install a retry observer, called synchronously before every backoff sleep
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.retry = self.retry.with_observer(observer);
        self
    }

    /// Destination name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.retry.policy()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Current circuit, limiter and counter state
    pub async fn status(&self) -> ControllerStatus {
        ControllerStatus {
            name: self.name.to_string(),
            circuit: self.breaker.state().await,
            available_permits: self.limiter.available(),
            current_rate: self.limiter.current_rate(),
            stats: self.stats.snapshot(),
        }
    }

    /// Run `attempt_fn` under circuit breaking, rate limiting and retries.
    ///
    /// Returns the first successful value, or exactly one of: a permanent
    /// failure, exhausted retries, an open circuit, or a timeout.
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
        let policy = ctx.retry_policy.as_ref().unwrap_or(self.retry.policy());
        let gate = DestinationGate {
            breaker: &self.breaker,
            limiter: &self.limiter,
            clock: self.clock.as_ref(),
            respect_retry_after: policy.respect_retry_after,
            admission: Mutex::new(None),
        };
        let span = tracing::debug_span!("execute", destination = %self.name);
        self.retry
            .run_gated(ctx, &gate, attempt_fn)
            .instrument(span)
            .await
    }

    /// Turn an HTTP failure into an attempt outcome.
    ///
    /// Parses `Retry-After` (seconds or HTTP-date) against this controller's
    /// clock and classifies the status with the default retry policy. Any
    /// `X-RateLimit-*` headers are fed to the limiter on the way.
    pub fn classify_response<T, E>(
        &self,
        status: u16,
        headers: &HashMap<String, String>,
        error: E,
    ) -> AttemptOutcome<T, E> {
        self.classify_with(self.retry.policy(), status, headers, error)
    }

    /// [`classify_response`](Self::classify_response) using the run's own
    /// retry policy when `ctx` overrides it
    pub fn classify_response_in<T, E>(
        &self,
        ctx: &RunContext,
        status: u16,
        headers: &HashMap<String, String>,
        error: E,
    ) -> AttemptOutcome<T, E> {
        let policy = ctx.retry_policy.as_ref().unwrap_or(self.retry.policy());
        self.classify_with(policy, status, headers, error)
    }

    fn classify_with<T, E>(
        &self,
        policy: &RetryPolicy,
        status: u16,
        headers: &HashMap<String, String>,
        error: E,
    ) -> AttemptOutcome<T, E> {
        let retry_after = header_value(headers, RETRY_AFTER)
            .and_then(|value| parse_retry_after(value, self.clock.utc_now()));
        self.limiter.update_from_headers(headers);
        policy.classify(FailureKind::Status(status), error, retry_after)
    }
}

/// Per-attempt admission against one destination's breaker and limiter
struct DestinationGate<'a> {
    breaker: &'a CircuitBreaker,
    limiter: &'a RateLimiter,
    clock: &'a dyn Clock,
    /// Whether this run lets a 429's Retry-After pause the limiter
    respect_retry_after: bool,
    /// Breaker ticket of the attempt in flight
    admission: Mutex<Option<Admission>>,
}

impl DestinationGate<'_> {
    fn take_admission(&self) -> Option<Admission> {
        self.admission
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl<'a> AttemptGate for DestinationGate<'a> {
    async fn admit(&self, deadline: Option<Instant>) -> Result<(), GateRejection> {
        let Some(admission) = self.breaker.admit().await else {
            return Err(GateRejection::CircuitOpen(self.breaker.name().to_string()));
        };

        let remaining = deadline.map(|deadline| deadline.saturating_duration_since(self.clock.now()));
        if !self.limiter.acquire(1.0, remaining).await {
            // No attempt was made, so nothing is recorded against the circuit
            self.breaker.release(admission).await;
            return Err(GateRejection::Timeout);
        }
        *self.admission.lock().unwrap_or_else(PoisonError::into_inner) = Some(admission);
        Ok(())
    }

    async fn blocked(&self) -> Option<GateRejection> {
        if self.breaker.is_open().await {
            Some(GateRejection::CircuitOpen(self.breaker.name().to_string()))
        } else {
            None
        }
    }

    async fn record(&self, report: OutcomeReport) {
        let Some(admission) = self.take_admission() else {
            return;
        };
        match report {
            OutcomeReport::Success => {
                self.breaker.record_success_for(admission).await;
                self.limiter.record_success();
            }
            OutcomeReport::Transient {
                status,
                retry_after,
            } => {
                self.breaker.record_failure_for(admission).await;
                if status == Some(TOO_MANY_REQUESTS) {
                    let retry_after = retry_after.filter(|_| self.respect_retry_after);
                    self.limiter.on_rate_limited(retry_after);
                }
            }
            // The destination is healthy; the request was at fault
            OutcomeReport::Permanent { .. } => self.breaker.record_success_for(admission).await,
            OutcomeReport::Abandoned => self.breaker.record_failure_for(admission).await,
        }
    }
}

impl Drop for DestinationGate<'_> {
    // A run dropped mid-attempt never reports; free a trial slot it holds
    fn drop(&mut self) {
        if let Some(admission) = self.take_admission() {
            if admission.is_trial() {
                self.breaker.try_release(admission);
            }
        }
    }
}
