//! Error types for execution control

use std::time::Duration;
use thiserror::Error;

/// Errors raised while building or reconfiguring resilience components
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResilienceError {
    /// A configuration value is out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Terminal outcome of a controlled run that did not produce a value.
///
/// A run always ends in a value or exactly one of these four variants, so
/// callers can branch on them to pick a fallback (cached value, default,
/// alert).
#[derive(Debug, Error)]
pub enum ExecutionError<E> {
    /// The attempt reported a failure that must not be retried
    #[error("Permanent failure: {0}")]
    Permanent(E),

    /// Every allowed attempt reported a transient failure
    #[error("Maximum retries ({max_retries}) exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded {
        /// Total calls made, initial attempt included
        attempts: u32,
        /// Retry budget that was configured for the run
        max_retries: u32,
        /// Error reported by the final attempt, unwrapped
        last_error: E,
    },

    /// The circuit breaker rejected the call before any work was done
    #[error("Circuit breaker '{name}' is open, rejecting requests")]
    CircuitOpen {
        /// Destination the breaker protects
        name: String,
    },

    /// The caller's deadline expired while waiting for a permit, a backoff
    /// or an attempt
    #[error("Deadline expired after waiting {waited:?}")]
    Timeout {
        /// Time spent in the run before giving up
        waited: Duration,
    },
}

impl<E> ExecutionError<E> {
    /// Check if the run failed on a non-retryable attempt
    pub fn is_permanent(&self) -> bool {
        matches!(self, ExecutionError::Permanent(_))
    }

    /// Check if the run used up its retry budget
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, ExecutionError::MaxRetriesExceeded { .. })
    }

    /// Check if the run was rejected by an open circuit
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ExecutionError::CircuitOpen { .. })
    }

    /// Check if the run hit its deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionError::Timeout { .. })
    }

    /// Number of attempts made, when the error carries one
    pub fn attempts(&self) -> Option<u32> {
        match self {
            ExecutionError::MaxRetriesExceeded { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Borrow the error reported by the attempt function, if any
    pub fn attempt_error(&self) -> Option<&E> {
        match self {
            ExecutionError::Permanent(e) => Some(e),
            ExecutionError::MaxRetriesExceeded { last_error, .. } => Some(last_error),
            _ => None,
        }
    }

    /// Take ownership of the error reported by the attempt function, if any
    pub fn into_attempt_error(self) -> Option<E> {
        match self {
            ExecutionError::Permanent(e) => Some(e),
            ExecutionError::MaxRetriesExceeded { last_error, .. } => Some(last_error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let permanent: ExecutionError<String> = ExecutionError::Permanent("bad request".into());
        assert!(permanent.is_permanent());
        assert!(!permanent.is_retries_exhausted());
        assert_eq!(permanent.attempts(), None);

        let exhausted: ExecutionError<String> = ExecutionError::MaxRetriesExceeded {
            attempts: 4,
            max_retries: 3,
            last_error: "503".into(),
        };
        assert!(exhausted.is_retries_exhausted());
        assert_eq!(exhausted.attempts(), Some(4));
        assert_eq!(exhausted.attempt_error().map(String::as_str), Some("503"));

        let open: ExecutionError<String> = ExecutionError::CircuitOpen {
            name: "api".into(),
        };
        assert!(open.is_circuit_open());
        assert!(open.attempt_error().is_none());

        let timeout: ExecutionError<String> = ExecutionError::Timeout {
            waited: Duration::from_secs(2),
        };
        assert!(timeout.is_timeout());
        assert!(timeout.into_attempt_error().is_none());
    }

    #[test]
    fn test_error_display() {
        let exhausted: ExecutionError<&str> = ExecutionError::MaxRetriesExceeded {
            attempts: 3,
            max_retries: 2,
            last_error: "connection reset",
        };
        assert_eq!(
            exhausted.to_string(),
            "Maximum retries (2) exceeded after 3 attempts: connection reset"
        );
    }
}
