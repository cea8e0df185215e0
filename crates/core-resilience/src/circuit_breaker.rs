//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when a
//! destination is experiencing issues. It has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Destination is unhealthy, requests fail immediately
//! - HalfOpen: A single trial request tests whether it has recovered
//!
//! The Open→HalfOpen transition is lazy: it happens on the first call after
//! the cooldown, never on a background timer.

use crate::clock::{Clock, TokioClock};
use crate::error::{ExecutionError, ResilienceError};
use crate::outcome::AttemptOutcome;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately until the cooldown elapses
    Open { opened_at: Instant },
    /// Circuit is half-open, one trial request is allowed through
    HalfOpen,
}

impl CircuitState {
    /// Short name for logs and status output
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Duration to wait before transitioning from open to half-open
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::InvalidConfig(
                "failure_threshold must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Ticket handed out when a call is let through.
///
/// Reports made with a ticket only count while the circuit is still in the
/// state that issued it; a late report from an earlier period is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    generation: u64,
    trial: bool,
}

impl Admission {
    /// Whether this call is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct CircuitBreakerState {
    /// Current state of the circuit
    state: CircuitState,
    /// Consecutive failure count (Closed only)
    consecutive_failures: u32,
    /// When the outstanding half-open trial was admitted
    trial_started: Option<Instant>,
    /// Bumped on every state change
    generation: u64,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            trial_started: None,
            generation: 0,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open { opened_at: now };
        self.consecutive_failures = 0;
        self.trial_started = None;
        self.generation += 1;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.trial_started = None;
        self.generation += 1;
    }

    fn start_trial(&mut self, now: Instant) -> Admission {
        self.state = CircuitState::HalfOpen;
        self.consecutive_failures = 0;
        self.trial_started = Some(now);
        self.generation += 1;
        Admission {
            generation: self.generation,
            trial: true,
        }
    }

    fn is_current(&self, admission: Admission) -> bool {
        admission.generation == self.generation
    }

    fn release(&mut self, admission: Admission) {
        if admission.trial && self.is_current(admission) && self.state == CircuitState::HalfOpen {
            self.trial_started = None;
        }
    }
}

/// Circuit breaker for protecting against cascading failures
///
/// Cloning is cheap; clones share state, so one breaker can guard a
/// destination across many tasks.
///
/// # Example
/// ```no_run
/// use tollgate_core_resilience::{AttemptOutcome, CircuitBreaker, CircuitBreakerConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let breaker = CircuitBreaker::new("api.example.com", CircuitBreakerConfig::default())
///         .unwrap();
///
///     let result = breaker
///         .call(|| async { AttemptOutcome::<_, String>::Success(42) })
///         .await;
///
///     println!("Result: {:?}", result);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<CircuitBreakerState>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Result<Self, ResilienceError> {
        Self::with_clock(name, config, Arc::new(TokioClock))
    }

    /// Create a breaker reading time from `clock`
    pub fn with_clock(
        name: impl Into<Arc<str>>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config: Arc::new(config),
            clock,
            state: Arc::new(Mutex::new(CircuitBreakerState::new())),
        })
    }

    /// Destination this breaker guards
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker
    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Get current consecutive failure count
    pub async fn failure_count(&self) -> u32 {
        self.state.lock().await.consecutive_failures
    }

    /// Reset the circuit breaker to closed state
    pub async fn reset(&self) {
        self.state.lock().await.close();
    }

    /// Check, without changing anything, whether the circuit is rejecting
    /// calls right now (open and still cooling down)
    pub async fn is_open(&self) -> bool {
        match self.state.lock().await.state {
            CircuitState::Open { opened_at } => {
                self.clock.now().saturating_duration_since(opened_at) < self.config.cooldown
            }
            _ => false,
        }
    }

    /// Decide whether a call may proceed.
    ///
    /// In Open, returns false until the cooldown has elapsed; the first call
    /// after that moves the circuit to HalfOpen and takes the trial slot.
    /// In HalfOpen, only the holder of the trial slot is let through.
    pub async fn allow(&self) -> bool {
        self.admit().await.is_some()
    }

    /// Like [`allow`](Self::allow), returning the ticket to report with.
    ///
    /// A trial that has not reported back within one cooldown is presumed
    /// lost and its slot goes to the next caller.
    pub async fn admit(&self) -> Option<Admission> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        match state.state {
            CircuitState::Closed => Some(Admission {
                generation: state.generation,
                trial: false,
            }),
            CircuitState::Open { opened_at } => {
                if now.saturating_duration_since(opened_at) >= self.config.cooldown {
                    info!(circuit = %self.name, "Circuit half-open, allowing trial request");
                    Some(state.start_trial(now))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => match state.trial_started {
                Some(started) if now.saturating_duration_since(started) < self.config.cooldown => None,
                Some(_) => {
                    warn!(circuit = %self.name, "Trial request never reported, allowing another");
                    Some(state.start_trial(now))
                }
                None => Some(state.start_trial(now)),
            },
        }
    }

    /// Report a successful call
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        self.on_success(&mut state);
    }

    /// Report a failed call
    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        self.on_failure(&mut state);
    }

    /// Report a success for the call holding `admission`
    pub async fn record_success_for(&self, admission: Admission) {
        let mut state = self.state.lock().await;
        if self.accepts(&state, admission) {
            self.on_success(&mut state);
        }
    }

    /// Report a failure for the call holding `admission`
    pub async fn record_failure_for(&self, admission: Admission) {
        let mut state = self.state.lock().await;
        if self.accepts(&state, admission) {
            self.on_failure(&mut state);
        }
    }

    /// Give back the half-open trial slot without recording an outcome.
    ///
    /// Used when a call was admitted but never attempted (for example, its
    /// rate-limit wait timed out).
    pub async fn release_trial(&self) {
        let mut state = self.state.lock().await;
        if state.state == CircuitState::HalfOpen {
            state.trial_started = None;
        }
    }

    /// Give back the slot held by `admission`, if it is the current trial
    pub async fn release(&self, admission: Admission) {
        self.state.lock().await.release(admission);
    }

    /// Non-blocking [`release`](Self::release) for drop paths; does nothing
    /// if the state is locked, leaving the trial to expire instead.
    pub(crate) fn try_release(&self, admission: Admission) {
        if let Ok(mut state) = self.state.try_lock() {
            state.release(admission);
        }
    }

    fn accepts(&self, state: &CircuitBreakerState, admission: Admission) -> bool {
        let current = state.is_current(admission);
        if !current {
            debug!(circuit = %self.name, "Ignoring report from an earlier circuit state");
        }
        current
    }

    fn on_success(&self, state: &mut CircuitBreakerState) {
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                info!(circuit = %self.name, "Trial request succeeded, circuit closed");
                state.close();
            }
            CircuitState::Open { .. } => {
                // Late result from a call admitted before the circuit opened
                debug!(circuit = %self.name, "Ignoring success while open");
            }
        }
    }

    fn on_failure(&self, state: &mut CircuitBreakerState) {
        let now = self.clock.now();

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        circuit = %self.name,
                        failures = state.consecutive_failures,
                        cooldown_secs = self.config.cooldown.as_secs_f64(),
                        "Failure threshold reached, circuit opened"
                    );
                    state.open(now);
                }
            }
            CircuitState::HalfOpen => {
                warn!(circuit = %self.name, "Trial request failed, circuit re-opened");
                state.open(now);
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Execute a single attempt with circuit breaker protection, without retries
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, ExecutionError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = AttemptOutcome<T, E>>,
    {
        let Some(admission) = self.admit().await else {
            return Err(ExecutionError::CircuitOpen {
                name: self.name.to_string(),
            });
        };

        match op().await {
            AttemptOutcome::Success(value) => {
                self.record_success_for(admission).await;
                Ok(value)
            }
            AttemptOutcome::TransientFailure(failure) => {
                self.record_failure_for(admission).await;
                Err(ExecutionError::MaxRetriesExceeded {
                    attempts: 1,
                    max_retries: 0,
                    last_error: failure.error,
                })
            }
            AttemptOutcome::PermanentFailure(failure) => {
                // The destination answered; the request itself was bad.
                self.record_success_for(admission).await;
                Err(ExecutionError::Permanent(failure.error))
            }
        }
    }
}
