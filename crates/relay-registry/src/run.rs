// run.rs - WorkflowRun: one workflow submission lifecycle.
//
// The state machine enforces a valid lifecycle:
//   Pending → Submitted → Running → Succeeded
//                                 → Failed
//   Pending → Failed      (submission failed)
//   Submitted → Failed    (engine failed the run before it started)
//   Submitted → Succeeded (completion seen without a Running report)
//   Failed → Pending      (resubmission; budget checked by the registry)
//   Pending | Submitted | Running | Failed → Abandoned   (terminal)

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use relay_core::{IdempotencyKey, ParameterUpdateEvent};
use relay_workflow::WorkflowRef;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// The lifecycle state of a WorkflowRun.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Recorded, not yet handed to the engine.
    Pending,

    /// The engine accepted the run.
    Submitted,

    Running,

    Succeeded,

    /// The submission or the run failed. May be resubmitted.
    Failed,

    /// Given up on. Terminal; frees the key for a new run.
    Abandoned,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Pending => "pending",
            RunState::Submitted => "submitted",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunState::Pending),
            "submitted" => Ok(RunState::Submitted),
            "running" => Ok(RunState::Running),
            "succeeded" => Ok(RunState::Succeeded),
            "failed" => Ok(RunState::Failed),
            "abandoned" => Ok(RunState::Abandoned),
            other => Err(format!("unknown run state '{other}'")),
        }
    }
}

impl RunState {
    /// Check whether transitioning from this state to `next` is valid.
    ///
    /// `Failed → Pending` passes here; whether the retry budget allows it
    /// is decided by the registry.
    pub fn can_transition_to(self, next: RunState) -> bool {
        if next == RunState::Abandoned {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (RunState::Pending, RunState::Submitted)
                | (RunState::Submitted, RunState::Running)
                | (RunState::Running, RunState::Succeeded)
                | (RunState::Running, RunState::Failed)
                | (RunState::Pending, RunState::Failed)
                | (RunState::Submitted, RunState::Failed)
                // The engine may report completion without a Running sighting.
                | (RunState::Submitted, RunState::Succeeded)
                | (RunState::Failed, RunState::Pending)
        )
    }

    /// Succeeded and Abandoned runs never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Abandoned)
    }

    /// The engine holds (or may hold) a live run in these states.
    pub fn is_in_flight(self) -> bool {
        matches!(self, RunState::Submitted | RunState::Running)
    }
}

/// What the registry needs to start, resubmit and reconcile a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSeed {
    pub idempotency_key: IdempotencyKey,
    pub resource_id: String,
    pub parameter_name: String,
    pub parameter_value: String,
    /// Inputs handed to the workflow engine.
    pub workflow_parameters: BTreeMap<String, String>,
}

impl RunSeed {
    pub fn from_event(event: &ParameterUpdateEvent, workflow_parameters: BTreeMap<String, String>) -> Self {
        Self {
            idempotency_key: event.idempotency_key.clone(),
            resource_id: event.resource_id().to_string(),
            parameter_name: event.parameter_name.clone(),
            parameter_value: event.parameter_value.clone(),
            workflow_parameters,
        }
    }
}

/// A WorkflowRun: the registry's record of one logical workflow submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub idempotency_key: IdempotencyKey,

    pub resource_id: String,
    pub parameter_name: String,
    pub parameter_value: String,

    #[serde(default)]
    pub workflow_parameters: BTreeMap<String, String>,

    pub state: RunState,

    /// Submissions made so far, including failed ones.
    pub attempts: u32,

    /// Engine handle of the latest submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_ref: Option<WorkflowRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// Create a new WorkflowRun in the Pending state.
    pub fn new(seed: RunSeed) -> Self {
        let now = Utc::now();
        Self {
            idempotency_key: seed.idempotency_key,
            resource_id: seed.resource_id,
            parameter_name: seed.parameter_name,
            parameter_value: seed.parameter_value,
            workflow_parameters: seed.workflow_parameters,
            state: RunState::Pending,
            attempts: 0,
            workflow_ref: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn seed(&self) -> RunSeed {
        RunSeed {
            idempotency_key: self.idempotency_key.clone(),
            resource_id: self.resource_id.clone(),
            parameter_name: self.parameter_name.clone(),
            parameter_value: self.parameter_value.clone(),
            workflow_parameters: self.workflow_parameters.clone(),
        }
    }

    /// Transition to a new state. Returns an error if the transition is invalid.
    ///
    /// Leaving Pending for Submitted or Failed counts as one submission.
    pub fn transition(&mut self, next: RunState) -> Result<(), RegistryError> {
        if !self.state.can_transition_to(next) {
            return Err(RegistryError::InvalidTransition {
                key: self.idempotency_key.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        if self.state == RunState::Pending && matches!(next, RunState::Submitted | RunState::Failed) {
            self.attempts += 1;
        }
        if next == RunState::Pending {
            self.workflow_ref = None;
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{EventKind, ResourceTopic};

    fn seed(value: &str) -> RunSeed {
        let topic = ResourceTopic {
            class: "parameter".into(),
            kind: EventKind::Update,
            resource_id: "01234".into(),
        };
        RunSeed {
            idempotency_key: IdempotencyKey::derive(&topic, "MajorRadius", value, 0),
            resource_id: "01234".into(),
            parameter_name: "MajorRadius".into(),
            parameter_value: value.into(),
            workflow_parameters: BTreeMap::from([("MajorRadius".to_string(), value.to_string())]),
        }
    }

    #[test]
    fn new_run_starts_pending() {
        let run = WorkflowRun::new(seed("8.5"));
        assert_eq!(run.state, RunState::Pending);
        assert_eq!(run.attempts, 0);
        assert!(run.workflow_ref.is_none());
        assert_eq!(run.seed(), seed("8.5"));
    }

    #[test]
    fn happy_path_transitions() {
        let mut run = WorkflowRun::new(seed("8.5"));
        run.transition(RunState::Submitted).unwrap();
        run.transition(RunState::Running).unwrap();
        run.transition(RunState::Succeeded).unwrap();
        assert_eq!(run.attempts, 1);
        assert!(run.state.is_terminal());
    }

    #[test]
    fn invalid_transition_returns_error() {
        let mut run = WorkflowRun::new(seed("8.5"));
        // Pending cannot jump to Running without a submission.
        let result = run.transition(RunState::Running);
        assert!(matches!(result, Err(RegistryError::InvalidTransition { .. })));
    }

    #[test]
    fn abandoned_is_terminal() {
        for from in [RunState::Pending, RunState::Submitted, RunState::Running, RunState::Failed] {
            assert!(from.can_transition_to(RunState::Abandoned), "{from}");
        }
        for next in [
            RunState::Pending,
            RunState::Submitted,
            RunState::Running,
            RunState::Succeeded,
            RunState::Failed,
            RunState::Abandoned,
        ] {
            assert!(!RunState::Abandoned.can_transition_to(next), "{next}");
            assert!(!RunState::Succeeded.can_transition_to(next), "{next}");
        }
    }

    #[test]
    fn resubmission_counts_attempts_and_clears_ref() {
        let mut run = WorkflowRun::new(seed("8.5"));
        run.transition(RunState::Failed).unwrap();
        assert_eq!(run.attempts, 1);
        run.transition(RunState::Pending).unwrap();
        run.transition(RunState::Submitted).unwrap();
        run.workflow_ref = Some(WorkflowRef::new("inv-1"));
        run.transition(RunState::Failed).unwrap();
        assert_eq!(run.attempts, 2);
        run.transition(RunState::Pending).unwrap();
        assert!(run.workflow_ref.is_none());
    }

    #[test]
    fn state_text_round_trip() {
        for state in [RunState::Pending, RunState::Running, RunState::Abandoned] {
            assert_eq!(state.to_string().parse::<RunState>().unwrap(), state);
        }
        assert!("done".parse::<RunState>().is_err());
    }

    #[test]
    fn optional_fields_omitted_from_json() {
        let run = WorkflowRun::new(seed("8.5"));
        let json = serde_json::to_string_pretty(&run).unwrap();
        assert!(!json.contains("workflow_ref"));
        assert!(!json.contains("last_error"));
        assert!(json.contains("\"state\": \"pending\""));
        let restored: WorkflowRun = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, run);
    }
}
