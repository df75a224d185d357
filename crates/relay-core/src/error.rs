// error.rs - Parse errors and the relay-wide error taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a failure is handled by the dispatcher.
///
/// Every error type in the relay maps onto one of these classes. Only
/// exhausted retries and abandonment are surfaced outward; everything else
/// is resolved close to where it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Input that can never succeed. Dropped after logging, never retried.
    MalformedInput,
    /// A dependency hiccup. Retried with bounded exponential backoff.
    TransientDependency,
    /// A dependency refused the request, or retries ran out. Escalated.
    PermanentDependency,
    /// A duplicate delivery was skipped. Expected, not a failure.
    DuplicateSuppressed,
    /// A workflow run was given up on. Needs operator attention.
    RunAbandoned,
}

impl ErrorClass {
    /// Whether this class warrants another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::TransientDependency)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::MalformedInput => write!(f, "malformed_input"),
            ErrorClass::TransientDependency => write!(f, "transient_dependency"),
            ErrorClass::PermanentDependency => write!(f, "permanent_dependency"),
            ErrorClass::DuplicateSuppressed => write!(f, "duplicate_suppressed"),
            ErrorClass::RunAbandoned => write!(f, "run_abandoned"),
        }
    }
}

/// Errors produced while decoding a broker message.
///
/// All of these are permanent: retrying the same bytes gives the same error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The topic does not follow `/{class}/{action}/{resource_id}`.
    #[error("malformed topic {topic:?}: {reason}")]
    MalformedTopic { topic: String, reason: String },

    /// The payload is not a flat JSON object of scalar values.
    #[error("malformed payload on {topic:?}: {reason}")]
    MalformedPayload { topic: String, reason: String },

    /// The topic names a resource class this relay is not configured for.
    #[error("unknown resource class {class:?} in topic {topic:?}")]
    UnknownResourceClass { topic: String, class: String },
}

impl ParseError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::MalformedInput
    }

    pub fn topic(&self) -> &str {
        match self {
            ParseError::MalformedTopic { topic, .. }
            | ParseError::MalformedPayload { topic, .. }
            | ParseError::UnknownResourceClass { topic, .. } => topic,
        }
    }
}
