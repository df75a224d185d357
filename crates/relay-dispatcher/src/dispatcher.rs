// dispatcher.rs - The per-delivery pipeline.
//
// One worker drives a delivery end to end: parse, apply metadata, claim the
// idempotency key, submit. The delivery is acked only after every event it
// carried has resolved. A worker aborted midway drops its delivery unsettled
// so the broker hands it out again.
//
// Completion statuses, whether pushed by the engine or polled, go through
// record_status(). A status that fails a run is followed by
// resubmit_failed(), which retries within budget or gives up.

use std::sync::Arc;

use chrono::Utc;
use relay_core::{IdempotencyKey, ParameterUpdateEvent, RetryPolicy, TopicParser};
use relay_metadata::{MetadataClient, MetadataMutation};
use relay_registry::{NotificationHub, RegistryError, RelayEvent, RunRegistry, RunSeed, RunState, WorkflowRun};
use relay_workflow::{RunStatus, WorkflowRef, WorkflowTrigger};
use serde::Serialize;

use crate::broker::Delivery;
use crate::error::DispatchError;

/// Where one event got to in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Parsed,
    MetadataApplying,
    MetadataApplied,
    TriggerChecking,
    Triggered,
    /// Another delivery already owns the key.
    Skipped,
    Completed,
    Failed,
}

/// The stage trail of one event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventOutcome {
    pub idempotency_key: IdempotencyKey,
    pub parameter_name: String,
    pub stages: Vec<Stage>,
    /// Registry state of the key's run when the event finished.
    pub run_state: Option<RunState>,
    pub error: Option<String>,
}

impl EventOutcome {
    fn new(event: &ParameterUpdateEvent) -> Self {
        Self {
            idempotency_key: event.idempotency_key.clone(),
            parameter_name: event.parameter_name.clone(),
            stages: vec![Stage::Received, Stage::Parsed],
            run_state: None,
            error: None,
        }
    }

    fn enter(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    fn failed(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.stages.push(Stage::Failed);
        self
    }

    pub fn last_stage(&self) -> Option<Stage> {
        self.stages.last().copied()
    }

    pub fn reached(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    pub fn skipped(&self) -> bool {
        self.reached(Stage::Skipped)
    }
}

/// What recording one engine status did to its run.
#[derive(Debug, Clone)]
pub enum StatusChange {
    /// Unknown or superseded ref, a repeat, or a transition no longer allowed.
    Ignored(Option<WorkflowRun>),
    Moved(WorkflowRun),
    /// The engine failed the run; a resubmission decision is due.
    Failed(WorkflowRun),
}

impl StatusChange {
    pub fn into_run(self) -> Option<WorkflowRun> {
        match self {
            StatusChange::Ignored(run) => run,
            StatusChange::Moved(run) | StatusChange::Failed(run) => Some(run),
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReport {
    pub topic: String,
    pub redelivered: bool,
    /// Parse error text when the message was dropped.
    pub dropped: Option<String>,
    pub events: Vec<EventOutcome>,
}

impl DispatchReport {
    pub fn is_dropped(&self) -> bool {
        self.dropped.is_some()
    }
}

pub struct Dispatcher {
    parser: TopicParser,
    metadata: MetadataClient,
    trigger: WorkflowTrigger,
    registry: Arc<RunRegistry>,
    hub: Arc<NotificationHub>,
    /// Backoff between resubmissions of a failed run.
    resubmit: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        parser: TopicParser,
        metadata: MetadataClient,
        trigger: WorkflowTrigger,
        registry: Arc<RunRegistry>,
        hub: Arc<NotificationHub>,
    ) -> Self {
        Self {
            parser,
            metadata,
            trigger,
            registry,
            hub,
            resubmit: RetryPolicy::default(),
        }
    }

    pub fn with_resubmit_backoff(mut self, policy: RetryPolicy) -> Self {
        self.resubmit = policy;
        self
    }

    pub fn parser(&self) -> &TopicParser {
        &self.parser
    }

    pub fn metadata(&self) -> &MetadataClient {
        &self.metadata
    }

    pub fn trigger(&self) -> &WorkflowTrigger {
        &self.trigger
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    /// Drive one delivery through the pipeline and ack it.
    pub async fn process(&self, delivery: Delivery) -> DispatchReport {
        let mut report = DispatchReport {
            topic: delivery.topic.clone(),
            redelivered: delivery.redelivered,
            dropped: None,
            events: Vec::new(),
        };

        match self.parser.parse(&delivery.topic, &delivery.payload, Utc::now()) {
            Ok(events) => {
                for event in events {
                    report.events.push(self.handle_event(event).await);
                }
            }
            Err(e) => {
                tracing::warn!(topic = %delivery.topic, class = %e.class(), error = %e, "dropping message");
                self.hub
                    .emit(RelayEvent::event_dropped(&delivery.topic, e.class(), e.to_string()));
                report.dropped = Some(e.to_string());
            }
        }

        delivery.ack();
        report
    }

    async fn handle_event(&self, event: ParameterUpdateEvent) -> EventOutcome {
        let key = event.idempotency_key.clone();
        let mut outcome = EventOutcome::new(&event);

        outcome.enter(Stage::MetadataApplying);
        match self.metadata.apply(&MetadataMutation::from_event(&event)).await {
            Ok((_, receipt)) => {
                tracing::debug!(key = %key.short(), ack = ?receipt.ack, attempts = receipt.attempts, "metadata applied");
                outcome.enter(Stage::MetadataApplied);
            }
            Err(e) => {
                tracing::error!(key = %key.short(), resource_id = event.resource_id(), error = %e, "metadata update failed");
                self.hub.emit(RelayEvent::metadata_failed(
                    &key,
                    event.resource_id(),
                    &event.parameter_name,
                    e.to_string(),
                ));
                return outcome.failed(e.to_string());
            }
        }

        outcome.enter(Stage::TriggerChecking);
        let parameters = self
            .trigger
            .workflow_parameters(&event.parameter_name, &event.parameter_value);
        if !self.registry.try_begin(RunSeed::from_event(&event, parameters)) {
            tracing::info!(key = %key.short(), resource_id = event.resource_id(), "duplicate suppressed");
            self.hub
                .emit(RelayEvent::duplicate_suppressed(&key, event.resource_id()));
            outcome.enter(Stage::Skipped);
            outcome.enter(Stage::Completed);
            outcome.run_state = self.registry.get(&key).map(|r| r.state);
            return outcome;
        }

        outcome.enter(Stage::Triggered);
        match self.submit_run(&key).await {
            Ok(run) => {
                outcome.run_state = Some(run.state);
                if run.state == RunState::Abandoned {
                    let reason = run.last_error.unwrap_or_else(|| "run abandoned".to_string());
                    return outcome.failed(reason);
                }
                outcome.enter(Stage::Completed);
                outcome
            }
            Err(e) => {
                tracing::error!(key = %key.short(), error = %e, "submission bookkeeping failed");
                outcome.run_state = self.registry.get(&key).map(|r| r.state);
                outcome.failed(e.to_string())
            }
        }
    }

    /// Submit a Pending run, resubmitting after transient failures while the
    /// budget lasts. Returns the run as it stands afterwards.
    pub(crate) async fn submit_run(&self, key: &IdempotencyKey) -> Result<WorkflowRun, DispatchError> {
        loop {
            let run = self.current(key)?;
            if run.state != RunState::Pending {
                return Ok(run);
            }

            match self.trigger.submit(key, &run.workflow_parameters).await {
                Ok(workflow_ref) => {
                    let run = self.registry.record_submission(key, workflow_ref.clone())?;
                    self.hub.emit(RelayEvent::run_submitted(&run, &workflow_ref));
                    return Ok(run);
                }
                Err(e) => {
                    let failed = self.registry.fail(key, &e.to_string())?;
                    self.hub
                        .emit(RelayEvent::run_state_changed(&failed, RunState::Pending));
                    if !e.is_transient() {
                        return self.give_up(key, &failed);
                    }
                    if let Some(settled) = self.requeue(key, &failed).await? {
                        return Ok(settled);
                    }
                }
            }
        }
    }

    /// Apply an engine status to the run that owns `workflow_ref`, then
    /// resubmit or abandon it if the status failed it.
    ///
    /// Statuses for unknown or superseded handles, repeats, and anything
    /// arriving after a terminal state are ignored.
    pub async fn apply_status(
        &self,
        workflow_ref: &WorkflowRef,
        status: RunStatus,
    ) -> Result<Option<WorkflowRun>, DispatchError> {
        match self.record_status(workflow_ref, status)? {
            StatusChange::Failed(failed) => self.resubmit_failed(&failed).await.map(Some),
            change => Ok(change.into_run()),
        }
    }

    /// The state-transition half of [`apply_status`](Self::apply_status).
    ///
    /// Touches only the registry, so it never waits on the engine. A
    /// `StatusChange::Failed` result still needs
    /// [`resubmit_failed`](Self::resubmit_failed).
    pub fn record_status(&self, workflow_ref: &WorkflowRef, status: RunStatus) -> Result<StatusChange, DispatchError> {
        let Some(run) = self.registry.lookup_by_ref(workflow_ref) else {
            tracing::debug!(%workflow_ref, %status, "status for unknown or superseded run ignored");
            return Ok(StatusChange::Ignored(None));
        };
        let key = run.idempotency_key.clone();
        let next = match &status {
            RunStatus::Queued => return Ok(StatusChange::Ignored(Some(run))),
            RunStatus::Running => RunState::Running,
            RunStatus::Succeeded => RunState::Succeeded,
            RunStatus::Failed { .. } => RunState::Failed,
        };
        if run.state == next || !run.state.can_transition_to(next) {
            return Ok(StatusChange::Ignored(Some(run)));
        }

        let from = run.state;
        let updated = match status {
            RunStatus::Failed { reason } => self.registry.fail(&key, &reason),
            _ => self.registry.transition(&key, next),
        };
        let updated = match updated {
            Ok(run) => run,
            Err(RegistryError::InvalidTransition { .. }) => {
                tracing::debug!(key = %key.short(), %workflow_ref, "status lost a race, ignored");
                return Ok(StatusChange::Ignored(self.registry.get(&key)));
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!(key = %key.short(), %workflow_ref, from = %from, to = %updated.state, "run state changed");
        self.hub.emit(RelayEvent::run_state_changed(&updated, from));

        if updated.state == RunState::Failed {
            Ok(StatusChange::Failed(updated))
        } else {
            Ok(StatusChange::Moved(updated))
        }
    }

    /// Resubmit a run the engine failed, after the backoff delay, or abandon
    /// it when the budget is spent.
    pub async fn resubmit_failed(&self, failed: &WorkflowRun) -> Result<WorkflowRun, DispatchError> {
        let key = &failed.idempotency_key;
        if let Some(settled) = self.requeue(key, failed).await? {
            return Ok(settled);
        }
        self.submit_run(key).await
    }

    /// Operator override: reset a Failed or Abandoned run and submit it again.
    pub async fn operator_retry(&self, key: &IdempotencyKey) -> Result<WorkflowRun, DispatchError> {
        let from = self.current(key)?.state;
        let reset = self.registry.operator_retry(key)?;
        self.hub.emit(RelayEvent::run_state_changed(&reset, from));
        self.submit_run(key).await
    }

    /// Put a Failed run back to Pending after the backoff delay.
    ///
    /// Returns `None` when the caller should submit again, or the settled run
    /// when it was abandoned or moved on by someone else meanwhile.
    async fn requeue(
        &self,
        key: &IdempotencyKey,
        failed: &WorkflowRun,
    ) -> Result<Option<WorkflowRun>, DispatchError> {
        if !self.registry.has_budget(failed) {
            return self.give_up(key, failed).map(Some);
        }
        let delay = self.resubmit.backoff(failed.attempts);
        tracing::info!(key = %key.short(), attempts = failed.attempts, ?delay, "resubmitting failed run");
        tokio::time::sleep(delay).await;

        match self.registry.transition(key, RunState::Pending) {
            Ok(_) => Ok(None),
            Err(RegistryError::BudgetExhausted { .. }) => self.give_up(key, failed).map(Some),
            Err(RegistryError::InvalidTransition { .. }) => self.current(key).map(Some),
            Err(e) => Err(e.into()),
        }
    }

    /// Abandon a run and escalate. Only the caller whose transition succeeds
    /// emits the escalation.
    pub(crate) fn give_up(&self, key: &IdempotencyKey, failed: &WorkflowRun) -> Result<WorkflowRun, DispatchError> {
        let reason = format!(
            "gave up after {} submission(s): {}",
            failed.attempts,
            failed.last_error.as_deref().unwrap_or("unknown error")
        );
        self.abandon(key, &reason)
    }

    pub(crate) fn abandon(&self, key: &IdempotencyKey, reason: &str) -> Result<WorkflowRun, DispatchError> {
        match self.registry.abandon(key, reason) {
            Ok(run) => {
                self.hub.emit(RelayEvent::run_abandoned(&run));
                Ok(run)
            }
            Err(RegistryError::InvalidTransition { .. }) => self.current(key),
            Err(e) => Err(e.into()),
        }
    }

    fn current(&self, key: &IdempotencyKey) -> Result<WorkflowRun, DispatchError> {
        self.registry
            .get(key)
            .ok_or_else(|| RegistryError::NotFound(key.clone()).into())
    }
}
