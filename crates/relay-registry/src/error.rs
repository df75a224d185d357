// error.rs - Error types for the run registry.

use relay_core::{ErrorClass, IdempotencyKey};
use relay_workflow::WorkflowRef;
use thiserror::Error;

/// Errors that can occur while tracking runs.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A file I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    IoError {
        path: String,
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// No run is recorded for this key.
    #[error("run not found: {0}")]
    NotFound(IdempotencyKey),

    /// No run carries this workflow handle.
    #[error("no run for workflow ref {0}")]
    UnknownRef(WorkflowRef),

    #[error("invalid transition from {from} to {to} for run {key}")]
    InvalidTransition {
        key: IdempotencyKey,
        from: String,
        to: String,
    },

    /// A failed run has used all of its submissions.
    #[error("run {key} exhausted its submission budget after {attempts} attempt(s)")]
    BudgetExhausted { key: IdempotencyKey, attempts: u32 },

    /// A notification sink failed (non-fatal).
    #[error("notification error: {0}")]
    NotificationError(String),
}

impl RegistryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RegistryError::BudgetExhausted { .. } => ErrorClass::RunAbandoned,
            _ => ErrorClass::PermanentDependency,
        }
    }
}
