//! Tollgate Core Resilience: Pure-logic execution control for HTTP clients
//!
//! # Overview
//!
//! This crate decides, for an arbitrary unit of work, whether to run it now,
//! when to wait, when to retry it, and when to stop trying and fail fast.
//! It includes:
//!
//! - **Token Bucket**: Continuously refilling permit counter with Retry-After blocking
//! - **Rate Limiter**: Blocking/non-blocking acquisition and adaptive rate adjustment
//! - **Backoff Policy**: Capped exponential delays with optional jitter
//! - **Retry Controller**: Drives attempts through transient failures
//! - **Circuit Breaker**: Fails fast while a destination is unhealthy
//! - **Execution Controller**: Composes all of the above around one attempt function
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - HTTP clients, connections or TLS
//! - Request/response encoding
//! - Configuration files
//!
//! The transport reports each attempt as an [`AttemptOutcome`]; everything
//! else is decided here. All time flows through an injectable [`Clock`], so
//! tests can fast-forward through multi-second backoffs.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Application                │
//! └─────────────┬───────────────────────────┘
//!               │ run(ctx, attempt_fn)
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (Tracks failures, opens on threshold)  │
//! └─────────────┬───────────────────────────┘
//!               │ allowed
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Rate Limiter                      │  ← Prevent overload
//! │  (Token bucket, honours Retry-After)    │
//! └─────────────┬───────────────────────────┘
//!               │ permit
//!               ▼
//!         attempt_fn (transport)
//!               │
//!          outcome recorded
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Retry Controller                  │  ← Decide and wait
//! │  (Classify, back off, loop or stop)     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use tollgate_core_resilience::prelude::*;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let controller = ExecutionController::new("api.example.com", ExecutionConfig::default())?;
//! let ctx = RunContext::new().with_timeout(Duration::from_secs(30));
//!
//! let result = controller
//!     .run(&ctx, |attempt| async move {
//!         // Call the transport here and classify its result
//!         if attempt.number < 2 {
//!             AttemptOutcome::transient("connection reset")
//!         } else {
//!             AttemptOutcome::Success("body")
//!         }
//!     })
//!     .await;
//!
//! match result {
//!     Ok(body) => println!("Got {body}"),
//!     Err(e) if e.is_circuit_open() => println!("Destination unhealthy, using cache"),
//!     Err(e) => println!("Request failed: {e}"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod clock;
pub mod context;
pub mod error;
pub mod executor;
pub mod headers;
pub mod outcome;
pub mod rate_limiter;
pub mod retry;
pub mod stats;
pub mod token_bucket;

// Re-export main types for convenience
pub use backoff::BackoffPolicy;
pub use circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use clock::{Clock, ManualClock, TokioClock};
pub use context::{Attempt, RunContext};
pub use error::{ExecutionError, ResilienceError};
pub use executor::{ControllerStatus, ExecutionConfig, ExecutionController};
pub use headers::{parse_retry_after, RateLimitHeaders};
pub use outcome::{AttemptOutcome, Failure, FailureKind, OutcomeReport};
pub use rate_limiter::{AdaptiveConfig, RateLimiter, RateLimiterConfig};
pub use retry::{RetryController, RetryEvent, RetryObserver, RetryPolicy, RetryPredicate};
pub use stats::{ExecutionStats, StatsSnapshot};
pub use token_bucket::{BucketSnapshot, TokenBucket, TokenBucketConfig};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use tollgate_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::backoff::BackoffPolicy;
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::context::{Attempt, RunContext};
    pub use super::error::{ExecutionError, ResilienceError};
    pub use super::executor::{ExecutionConfig, ExecutionController};
    pub use super::outcome::{AttemptOutcome, Failure, FailureKind};
    pub use super::rate_limiter::{RateLimiter, RateLimiterConfig};
    pub use super::retry::{RetryController, RetryPolicy};
}
