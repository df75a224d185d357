// trigger.rs - Deadline-bounded access to a workflow engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use relay_core::IdempotencyKey;

use crate::engine::{EngineRun, RunStatus, WorkflowEngine, WorkflowRef};
use crate::error::TriggerError;

/// Submits runs and polls their status on a [`WorkflowEngine`].
///
/// Every call is bounded by `call_timeout`; an expired deadline is reported
/// as [`TriggerError::Timeout`], which is transient. The trigger never
/// deduplicates and never retries on its own: the dispatcher decides whether
/// a failed submission is attempted again.
#[derive(Clone)]
pub struct WorkflowTrigger {
    engine: Arc<dyn WorkflowEngine>,
    call_timeout: Duration,
    /// Event parameter name → workflow input name.
    parameter_map: BTreeMap<String, String>,
}

impl WorkflowTrigger {
    pub fn new(engine: Arc<dyn WorkflowEngine>, call_timeout: Duration) -> Self {
        Self {
            engine,
            call_timeout,
            parameter_map: BTreeMap::new(),
        }
    }

    pub fn with_parameter_map(mut self, parameter_map: BTreeMap<String, String>) -> Self {
        self.parameter_map = parameter_map;
        self
    }

    pub fn engine(&self) -> &Arc<dyn WorkflowEngine> {
        &self.engine
    }

    /// Whether resubmitting a key can never start a second run.
    pub fn supports_idempotent_submit(&self) -> bool {
        self.engine.supports_idempotent_submit()
    }

    /// Build the workflow input map for one parameter update. Names without
    /// an alias are passed through unchanged.
    pub fn workflow_parameters(&self, name: &str, value: &str) -> BTreeMap<String, String> {
        let input = self
            .parameter_map
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string());
        BTreeMap::from([(input, value.to_string())])
    }

    pub async fn submit(
        &self,
        key: &IdempotencyKey,
        parameters: &BTreeMap<String, String>,
    ) -> Result<WorkflowRef, TriggerError> {
        let result = self.bounded(self.engine.submit(key, parameters)).await;
        match &result {
            Ok(workflow_ref) => {
                tracing::info!(key = %key.short(), workflow_ref = %workflow_ref, engine = self.engine.name(), "workflow submitted")
            }
            Err(e) => tracing::warn!(key = %key.short(), engine = self.engine.name(), error = %e, "workflow submission failed"),
        }
        result
    }

    pub async fn poll(&self, workflow_ref: &WorkflowRef) -> Result<RunStatus, TriggerError> {
        self.bounded(self.engine.poll(workflow_ref)).await
    }

    pub async fn list_runs(&self) -> Result<Vec<EngineRun>, TriggerError> {
        self.bounded(self.engine.list_runs()).await
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, TriggerError>>,
    ) -> Result<T, TriggerError> {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| TriggerError::Timeout(self.call_timeout))?
    }
}
