//! Per-run context threaded explicitly through the controller
//!
//! Carries the correlation ID, the caller's deadline and an optional
//! per-call retry policy. Nothing here lives in thread-local or global state.

use crate::retry::RetryPolicy;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Caller-supplied settings for one controlled run
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Identifier attached to every log line of the run
    pub correlation_id: Arc<str>,
    /// Overall budget for the run (permit waits, backoffs and attempts)
    pub timeout: Option<Duration>,
    /// Replaces the controller's retry policy for this run only
    pub retry_policy: Option<RetryPolicy>,
}

impl RunContext {
    /// Fresh context with a random correlation ID and no deadline
    pub fn new() -> Self {
        Self::with_correlation_id(generate_correlation_id())
    }

    /// Context reusing an existing correlation ID (e.g. from an inbound request)
    pub fn with_correlation_id(correlation_id: impl Into<Arc<str>>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            timeout: None,
            retry_policy: None,
        }
    }

    /// Bound the whole run by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override retry classification and budget for this run
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Handed to the attempt function on every call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number within the run
    pub number: u32,
    /// Correlation ID of the enclosing run
    pub correlation_id: Arc<str>,
}

/// 64 bits of randomness as 16 hex characters
fn generate_correlation_id() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 8] = rng.random();
    hex::encode(bytes)
}
