// error.rs - Error types for metadata store operations.

use std::time::Duration;

use relay_core::ErrorClass;
use thiserror::Error;

/// Errors that can occur while reading or writing the triplestore.
#[derive(Debug, Clone, Error)]
pub enum MetadataError {
    /// The store could not be reached or answered with a retryable status.
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),

    /// The call did not finish within its deadline.
    #[error("metadata store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store refused the request. Retrying will not help.
    #[error("metadata store rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The mutation cannot be expressed against this store.
    #[error("invalid mutation: {0}")]
    InvalidMutation(String),

    /// The store answered with something we could not decode.
    #[error("unexpected metadata store response: {0}")]
    BadResponse(String),

    /// The HTTP client could not be built from the configuration.
    #[error("metadata client setup failed: {0}")]
    ClientSetup(String),

    /// Transient failures continued past the retry budget.
    #[error("metadata store still failing after {attempts} attempt(s): {last}")]
    RetriesExhausted { attempts: u32, last: Box<MetadataError> },
}

impl MetadataError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MetadataError::Unavailable(_) | MetadataError::Timeout(_))
    }

    pub fn class(&self) -> ErrorClass {
        if self.is_transient() {
            ErrorClass::TransientDependency
        } else {
            ErrorClass::PermanentDependency
        }
    }
}

impl From<reqwest::Error> for MetadataError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                return MetadataError::Unavailable(e.to_string());
            }
            return MetadataError::Rejected {
                status: status.as_u16(),
                message: e.to_string(),
            };
        }
        if e.is_decode() {
            return MetadataError::BadResponse(e.to_string());
        }
        MetadataError::Unavailable(e.to_string())
    }
}
