//! The contract between the controller and the transport
//!
//! Every attempt reports a closed, typed outcome instead of raising ad hoc
//! errors. Status codes and server hints travel as explicit fields.

use std::fmt;
use std::time::Duration;

/// Details of a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Failure<E> {
    /// The transport's error, handed back to the caller untouched
    pub error: E,
    /// HTTP status, when the failure came from a response
    pub status: Option<u16>,
    /// Server-requested pause (parsed `Retry-After`)
    pub retry_after: Option<Duration>,
}

impl<E> Failure<E> {
    /// Failure without response metadata (connection reset, timeout, ...)
    pub fn new(error: E) -> Self {
        Self {
            error,
            status: None,
            retry_after: None,
        }
    }

    /// Attach the response status
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach a server-requested pause
    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

/// Result of one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome<T, E> {
    /// The attempt produced a value
    Success(T),
    /// The attempt failed in a way worth retrying
    TransientFailure(Failure<E>),
    /// The attempt failed in a way retrying cannot fix
    PermanentFailure(Failure<E>),
}

impl<T, E> AttemptOutcome<T, E> {
    /// Transient failure without metadata
    pub fn transient(error: E) -> Self {
        AttemptOutcome::TransientFailure(Failure::new(error))
    }

    /// Transient failure carrying a server-requested pause
    pub fn transient_after(error: E, retry_after: Duration) -> Self {
        AttemptOutcome::TransientFailure(Failure::new(error).with_retry_after(Some(retry_after)))
    }

    /// Permanent failure without metadata
    pub fn permanent(error: E) -> Self {
        AttemptOutcome::PermanentFailure(Failure::new(error))
    }

    /// Check if the attempt succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success(_))
    }

    /// Metadata-only summary used for bookkeeping
    pub fn report(&self) -> OutcomeReport {
        match self {
            AttemptOutcome::Success(_) => OutcomeReport::Success,
            AttemptOutcome::TransientFailure(f) => OutcomeReport::Transient {
                status: f.status,
                retry_after: f.retry_after,
            },
            AttemptOutcome::PermanentFailure(f) => OutcomeReport::Permanent { status: f.status },
        }
    }
}

/// What the breaker and limiter need to know about an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeReport {
    Success,
    Transient {
        status: Option<u16>,
        retry_after: Option<Duration>,
    },
    Permanent {
        status: Option<u16>,
    },
    /// The attempt was still running when the deadline expired
    Abandoned,
}

impl OutcomeReport {
    /// Short human-readable reason, used for retry logging
    pub fn reason(&self) -> String {
        match self {
            OutcomeReport::Success => "success".to_string(),
            OutcomeReport::Transient {
                status: Some(status),
                ..
            } => format!("HTTP {status}"),
            OutcomeReport::Transient { status: None, .. } => "transient failure".to_string(),
            OutcomeReport::Permanent { .. } => "permanent failure".to_string(),
            OutcomeReport::Abandoned => "deadline expired during attempt".to_string(),
        }
    }
}

impl fmt::Display for OutcomeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason())
    }
}

/// Coarse shape of a failure, input to the default classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The request timed out
    Timeout,
    /// The connection could not be established or was lost
    Connection,
    /// The server answered with this status
    Status(u16),
    /// Anything else (validation, decoding, ...)
    Other,
}
