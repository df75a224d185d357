// engine.rs - The WorkflowEngine seam and run status types.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use relay_core::IdempotencyKey;
use serde::{Deserialize, Serialize};

use crate::error::TriggerError;

/// Opaque handle the engine returns for an accepted run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowRef(String);

impl WorkflowRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the engine says about a run.
///
/// Both polling and pushed callbacks produce this type, so the dispatcher
/// handles them through one code path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Accepted but not started.
    Queued,
    Running,
    Succeeded,
    Failed { reason: String },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed { .. })
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Queued => write!(f, "queued"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed { .. } => write!(f, "failed"),
        }
    }
}

/// A status change pushed by an engine (callback mode).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusNotice {
    pub workflow_ref: WorkflowRef,
    #[serde(flatten)]
    pub status: RunStatus,
}

/// One entry of the engine's authoritative run list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineRun {
    pub workflow_ref: WorkflowRef,
    /// Present when the engine records the submitting idempotency key.
    pub idempotency_key: Option<IdempotencyKey>,
    pub status: RunStatus,
}

/// A workflow engine the relay can start runs on.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Start a run. Engines that support idempotent submission must return
    /// the existing run's handle when `key` was seen before.
    async fn submit(
        &self,
        key: &IdempotencyKey,
        parameters: &BTreeMap<String, String>,
    ) -> Result<WorkflowRef, TriggerError>;

    /// Current status of a run.
    async fn poll(&self, workflow_ref: &WorkflowRef) -> Result<RunStatus, TriggerError>;

    /// The engine's view of recent runs, used by reconciliation.
    async fn list_runs(&self) -> Result<Vec<EngineRun>, TriggerError>;

    /// Whether `submit` deduplicates on the idempotency key.
    fn supports_idempotent_submit(&self) -> bool {
        false
    }

    /// Engine display name (for logs).
    fn name(&self) -> &str;
}
