// error.rs - Error types for workflow submission and polling.

use std::time::Duration;

use relay_core::ErrorClass;
use thiserror::Error;

use crate::engine::WorkflowRef;

/// Errors that can occur while talking to a workflow engine.
#[derive(Debug, Clone, Error)]
pub enum TriggerError {
    /// The engine could not be reached or answered with a retryable status.
    #[error("workflow engine unavailable: {0}")]
    Unavailable(String),

    /// The call did not finish within its deadline.
    #[error("workflow engine call timed out after {0:?}")]
    Timeout(Duration),

    /// The engine refused the request.
    #[error("workflow engine rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The engine does not know this run.
    #[error("unknown workflow run: {0}")]
    UnknownRun(WorkflowRef),

    /// The engine answered with something we could not decode.
    #[error("unexpected workflow engine response: {0}")]
    BadResponse(String),

    /// The HTTP client could not be built from the configuration.
    #[error("workflow client setup failed: {0}")]
    ClientSetup(String),
}

impl TriggerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TriggerError::Unavailable(_) | TriggerError::Timeout(_))
    }

    pub fn class(&self) -> ErrorClass {
        if self.is_transient() {
            ErrorClass::TransientDependency
        } else {
            ErrorClass::PermanentDependency
        }
    }
}

impl From<reqwest::Error> for TriggerError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                return TriggerError::Unavailable(e.to_string());
            }
            return TriggerError::Rejected {
                status: status.as_u16(),
                message: e.to_string(),
            };
        }
        if e.is_decode() {
            return TriggerError::BadResponse(e.to_string());
        }
        if e.is_timeout() {
            return TriggerError::Timeout(Duration::ZERO);
        }
        TriggerError::Unavailable(e.to_string())
    }
}
