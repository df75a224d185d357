// memory.rs - In-process workflow engine.
//
// Runs never execute anything; their status only moves when a test (or the
// poll script) says so. Submission is idempotent on the key, like engines
// with a native idempotent-submit API.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use relay_core::IdempotencyKey;
use tokio::sync::mpsc::UnboundedSender;

use crate::engine::{EngineRun, RunStatus, StatusNotice, WorkflowEngine, WorkflowRef};
use crate::error::TriggerError;

struct MemRun {
    key: IdempotencyKey,
    parameters: BTreeMap<String, String>,
    status: RunStatus,
    /// Statuses handed out by successive polls before settling.
    script: VecDeque<RunStatus>,
}

#[derive(Default)]
struct Inner {
    runs: BTreeMap<WorkflowRef, MemRun>,
    by_key: HashMap<IdempotencyKey, WorkflowRef>,
    submit_failures: VecDeque<TriggerError>,
    poll_script: Vec<RunStatus>,
    next_id: u64,
}

#[derive(Default)]
pub struct MemoryWorkflowEngine {
    inner: Mutex<Inner>,
    idempotent: bool,
    submit_calls: AtomicU64,
    notifier: Mutex<Option<UnboundedSender<StatusNotice>>>,
}

impl MemoryWorkflowEngine {
    /// An engine that deduplicates submissions by key.
    pub fn new() -> Self {
        Self {
            idempotent: true,
            ..Self::default()
        }
    }

    /// An engine without idempotent submission: every call starts a run.
    pub fn without_idempotent_submit() -> Self {
        Self::default()
    }

    /// Each new run reports these statuses on successive polls, then keeps
    /// reporting the last one.
    pub fn with_poll_script(self, script: impl IntoIterator<Item = RunStatus>) -> Self {
        self.lock().poll_script = script.into_iter().collect();
        self
    }

    /// Make the next submit calls fail with these errors, in order.
    pub fn fail_next_submits(&self, errors: impl IntoIterator<Item = TriggerError>) {
        self.lock().submit_failures.extend(errors);
    }

    /// Push status changes made through [`complete`](Self::complete)
    /// to this channel (callback mode).
    pub fn notify_to(&self, sender: UnboundedSender<StatusNotice>) {
        *self.notifier.lock().unwrap_or_else(|e| e.into_inner()) = Some(sender);
    }

    /// Move a run to a new status, as the real engine would.
    pub fn complete(&self, workflow_ref: &WorkflowRef, status: RunStatus) -> Result<(), TriggerError> {
        {
            let mut inner = self.lock();
            let run = inner
                .runs
                .get_mut(workflow_ref)
                .ok_or_else(|| TriggerError::UnknownRun(workflow_ref.clone()))?;
            run.status = status.clone();
            run.script.clear();
        }
        if let Some(tx) = self.notifier.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            let _ = tx.send(StatusNotice {
                workflow_ref: workflow_ref.clone(),
                status,
            });
        }
        Ok(())
    }

    /// Number of submit calls received, including failed and deduplicated ones.
    pub fn submit_calls(&self) -> u64 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    /// Number of distinct runs created.
    pub fn run_count(&self) -> usize {
        self.lock().runs.len()
    }

    /// Parameters a run was started with.
    pub fn parameters_of(&self, workflow_ref: &WorkflowRef) -> Option<BTreeMap<String, String>> {
        self.lock().runs.get(workflow_ref).map(|r| r.parameters.clone())
    }

    /// Handle of the run started for `key`, if any.
    pub fn run_for_key(&self, key: &IdempotencyKey) -> Option<WorkflowRef> {
        self.lock().by_key.get(key).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl WorkflowEngine for MemoryWorkflowEngine {
    async fn submit(
        &self,
        key: &IdempotencyKey,
        parameters: &BTreeMap<String, String>,
    ) -> Result<WorkflowRef, TriggerError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.lock();
        if let Some(err) = inner.submit_failures.pop_front() {
            return Err(err);
        }
        if self.idempotent {
            if let Some(existing) = inner.by_key.get(key) {
                let existing = existing.clone();
                // A failed run may be resubmitted under the same key.
                let failed = matches!(
                    inner.runs.get(&existing).map(|r| &r.status),
                    Some(RunStatus::Failed { .. })
                );
                if !failed {
                    return Ok(existing);
                }
            }
        }

        inner.next_id += 1;
        let workflow_ref = WorkflowRef::new(format!("mem-{:04}", inner.next_id));
        let script: VecDeque<RunStatus> = inner.poll_script.iter().cloned().collect();
        inner.runs.insert(
            workflow_ref.clone(),
            MemRun {
                key: key.clone(),
                parameters: parameters.clone(),
                status: RunStatus::Queued,
                script,
            },
        );
        inner.by_key.insert(key.clone(), workflow_ref.clone());
        Ok(workflow_ref)
    }

    async fn poll(&self, workflow_ref: &WorkflowRef) -> Result<RunStatus, TriggerError> {
        let mut inner = self.lock();
        let run = inner
            .runs
            .get_mut(workflow_ref)
            .ok_or_else(|| TriggerError::UnknownRun(workflow_ref.clone()))?;
        if let Some(next) = run.script.pop_front() {
            run.status = next;
        }
        Ok(run.status.clone())
    }

    async fn list_runs(&self) -> Result<Vec<EngineRun>, TriggerError> {
        Ok(self
            .lock()
            .runs
            .iter()
            .map(|(workflow_ref, run)| EngineRun {
                workflow_ref: workflow_ref.clone(),
                idempotency_key: Some(run.key.clone()),
                status: run.status.clone(),
            })
            .collect())
    }

    fn supports_idempotent_submit(&self) -> bool {
        self.idempotent
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{EventKind, ResourceTopic};

    fn key(value: &str) -> IdempotencyKey {
        let topic = ResourceTopic {
            class: "parameter".into(),
            kind: EventKind::Update,
            resource_id: "01234".into(),
        };
        IdempotencyKey::derive(&topic, "MajorRadius", value, 0)
    }

    fn params() -> BTreeMap<String, String> {
        BTreeMap::from([("MajorRadius".to_string(), "8.5".to_string())])
    }

    #[tokio::test]
    async fn idempotent_submit_returns_existing_run() {
        let engine = MemoryWorkflowEngine::new();
        let a = engine.submit(&key("8.5"), &params()).await.unwrap();
        let b = engine.submit(&key("8.5"), &params()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(engine.run_count(), 1);
        assert_eq!(engine.submit_calls(), 2);

        let c = engine.submit(&key("9.0"), &params()).await.unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn non_idempotent_engine_starts_every_time() {
        let engine = MemoryWorkflowEngine::without_idempotent_submit();
        engine.submit(&key("8.5"), &params()).await.unwrap();
        engine.submit(&key("8.5"), &params()).await.unwrap();
        assert_eq!(engine.run_count(), 2);
        assert!(!engine.supports_idempotent_submit());
    }

    #[tokio::test]
    async fn poll_script_advances_then_settles() {
        let engine =
            MemoryWorkflowEngine::new().with_poll_script([RunStatus::Running, RunStatus::Succeeded]);
        let r = engine.submit(&key("8.5"), &params()).await.unwrap();
        assert_eq!(engine.poll(&r).await.unwrap(), RunStatus::Running);
        assert_eq!(engine.poll(&r).await.unwrap(), RunStatus::Succeeded);
        assert_eq!(engine.poll(&r).await.unwrap(), RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn complete_pushes_notice() {
        let engine = MemoryWorkflowEngine::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        engine.notify_to(tx);
        let r = engine.submit(&key("8.5"), &params()).await.unwrap();
        engine.complete(&r, RunStatus::Running).unwrap();
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.workflow_ref, r);
        assert_eq!(notice.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn scripted_submit_failures() {
        let engine = MemoryWorkflowEngine::new();
        engine.fail_next_submits([TriggerError::Unavailable("503".into())]);
        assert!(engine.submit(&key("8.5"), &params()).await.unwrap_err().is_transient());
        assert!(engine.submit(&key("8.5"), &params()).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_run_poll() {
        let engine = MemoryWorkflowEngine::new();
        let err = engine.poll(&WorkflowRef::new("nope")).await.unwrap_err();
        assert!(matches!(err, TriggerError::UnknownRun(_)));
    }

    #[tokio::test]
    async fn list_runs_reports_keys() {
        let engine = MemoryWorkflowEngine::new();
        let r = engine.submit(&key("8.5"), &params()).await.unwrap();
        let runs = engine.list_runs().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].workflow_ref, r);
        assert_eq!(runs[0].idempotency_key, Some(key("8.5")));
        assert_eq!(engine.parameters_of(&r), Some(params()));
    }
}
