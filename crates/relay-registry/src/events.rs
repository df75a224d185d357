// events.rs - Outbound notifications.
//
// The relay emits a RelayEvent whenever something operators need to know
// about happens: an event was dropped, metadata could not be written, a run
// was submitted, changed state, or was abandoned. Escalations (dropped,
// metadata failure, abandonment) are always emitted exactly once per cause.
//
// Sinks are synchronous and must not block; sinks that talk to the network
// hand the notification to a task through a channel.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use relay_core::{ErrorClass, IdempotencyKey};
use relay_workflow::WorkflowRef;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::run::{RunState, WorkflowRun};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum RelayEvent {
    /// A message was discarded without side effects.
    EventDropped {
        topic: String,
        class: ErrorClass,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The metadata write failed permanently or ran out of retries.
    MetadataFailed {
        idempotency_key: IdempotencyKey,
        resource_id: String,
        parameter_name: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// The engine accepted a submission.
    RunSubmitted {
        idempotency_key: IdempotencyKey,
        resource_id: String,
        workflow_ref: WorkflowRef,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    RunStateChanged {
        idempotency_key: IdempotencyKey,
        resource_id: String,
        from_state: RunState,
        to_state: RunState,
        timestamp: DateTime<Utc>,
    },

    /// The relay gave up on a run.
    RunAbandoned {
        idempotency_key: IdempotencyKey,
        resource_id: String,
        attempts: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A redelivered or repeated event matched an existing run.
    DuplicateSuppressed {
        idempotency_key: IdempotencyKey,
        resource_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl RelayEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            RelayEvent::EventDropped { .. } => "event_dropped",
            RelayEvent::MetadataFailed { .. } => "metadata_failed",
            RelayEvent::RunSubmitted { .. } => "run_submitted",
            RelayEvent::RunStateChanged { .. } => "run_state_changed",
            RelayEvent::RunAbandoned { .. } => "run_abandoned",
            RelayEvent::DuplicateSuppressed { .. } => "duplicate_suppressed",
        }
    }

    /// Escalations must reach an operator.
    pub fn is_escalation(&self) -> bool {
        matches!(
            self,
            RelayEvent::EventDropped { .. } | RelayEvent::MetadataFailed { .. } | RelayEvent::RunAbandoned { .. }
        )
    }

    /// The resource the event concerns, when it got far enough to know.
    pub fn resource_id(&self) -> Option<&str> {
        match self {
            RelayEvent::EventDropped { .. } => None,
            RelayEvent::MetadataFailed { resource_id, .. }
            | RelayEvent::RunSubmitted { resource_id, .. }
            | RelayEvent::RunStateChanged { resource_id, .. }
            | RelayEvent::RunAbandoned { resource_id, .. }
            | RelayEvent::DuplicateSuppressed { resource_id, .. } => Some(resource_id),
        }
    }

    pub fn event_dropped(topic: &str, class: ErrorClass, reason: impl Into<String>) -> Self {
        RelayEvent::EventDropped {
            topic: topic.to_string(),
            class,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn metadata_failed(key: &IdempotencyKey, resource_id: &str, parameter_name: &str, error: impl Into<String>) -> Self {
        RelayEvent::MetadataFailed {
            idempotency_key: key.clone(),
            resource_id: resource_id.to_string(),
            parameter_name: parameter_name.to_string(),
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn run_submitted(run: &WorkflowRun, workflow_ref: &WorkflowRef) -> Self {
        RelayEvent::RunSubmitted {
            idempotency_key: run.idempotency_key.clone(),
            resource_id: run.resource_id.clone(),
            workflow_ref: workflow_ref.clone(),
            attempt: run.attempts,
            timestamp: Utc::now(),
        }
    }

    pub fn run_state_changed(run: &WorkflowRun, from: RunState) -> Self {
        RelayEvent::RunStateChanged {
            idempotency_key: run.idempotency_key.clone(),
            resource_id: run.resource_id.clone(),
            from_state: from,
            to_state: run.state,
            timestamp: Utc::now(),
        }
    }

    pub fn run_abandoned(run: &WorkflowRun) -> Self {
        RelayEvent::RunAbandoned {
            idempotency_key: run.idempotency_key.clone(),
            resource_id: run.resource_id.clone(),
            attempts: run.attempts,
            reason: run.last_error.clone().unwrap_or_else(|| "abandoned".to_string()),
            timestamp: Utc::now(),
        }
    }

    pub fn duplicate_suppressed(key: &IdempotencyKey, resource_id: &str) -> Self {
        RelayEvent::DuplicateSuppressed {
            idempotency_key: key.clone(),
            resource_id: resource_id.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// A RelayEvent with a unique id, as delivered to sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    #[serde(flatten)]
    pub event: RelayEvent,
}

impl Notification {
    pub fn new(event: RelayEvent) -> Self {
        Self { id: Uuid::new_v4(), event }
    }
}

/// Receives notifications. Errors are logged but don't stop the relay.
pub trait NotificationSink: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<(), RegistryError>;
}

/// Appends notifications as JSONL to a file.
pub struct LogSink {
    path: PathBuf,
}

impl LogSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl NotificationSink for LogSink {
    fn send(&self, notification: &Notification) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| RegistryError::IoError {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| RegistryError::IoError {
                path: self.path.display().to_string(),
                source,
            })?;

        let json = serde_json::to_string(notification)?;
        writeln!(file, "{}", json).map_err(|source| RegistryError::IoError {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(())
    }
}

/// Keeps notifications in memory. Used by tests and the admin API.
#[derive(Default)]
pub struct MemorySink {
    received: Mutex<Vec<Notification>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.received.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|n| n.event.event_type() == event_type)
            .count()
    }
}

impl NotificationSink for MemorySink {
    fn send(&self, notification: &Notification) -> Result<(), RegistryError> {
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification.clone());
        Ok(())
    }
}

impl<T: NotificationSink + ?Sized> NotificationSink for std::sync::Arc<T> {
    fn send(&self, notification: &Notification) -> Result<(), RegistryError> {
        (**self).send(notification)
    }
}

/// Fans notifications out to every sink.
///
/// Errors from individual sinks are logged and don't prevent other sinks
/// from receiving the notification.
#[derive(Default)]
pub struct NotificationHub {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&mut self, sink: Box<dyn NotificationSink>) {
        self.sinks.push(sink);
    }

    pub fn with_sink(mut self, sink: impl NotificationSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Wrap `event` in a notification and deliver it.
    pub fn emit(&self, event: RelayEvent) -> Notification {
        let notification = Notification::new(event);
        if notification.event.is_escalation() {
            tracing::warn!(
                id = %notification.id,
                event_type = notification.event.event_type(),
                resource_id = notification.event.resource_id().unwrap_or("-"),
                "escalation"
            );
        }
        for sink in &self.sinks {
            if let Err(e) = sink.send(&notification) {
                tracing::warn!("notification sink error: {}", e);
            }
        }
        notification
    }
}
