//! # relay-registry
//!
//! Tracks workflow runs keyed by idempotency key and fans out outbound
//! notifications.
//!
//! A [`WorkflowRun`] moves through a validated lifecycle; the
//! [`RunRegistry`] guarantees at most one non-abandoned run per key, which
//! is what turns at-least-once delivery into at-most-once submission.
//!
//! ## Key components
//!
//! - [`WorkflowRun`] / [`RunState`]: the run state machine (Pending →
//!   Submitted → Running → Succeeded | Failed, or Abandoned)
//! - [`RunRegistry`]: concurrent per-key registry with optional write-through
//! - [`RunStore`]: JSON file-based persistence, one file per run
//! - [`RelayEvent`] / [`NotificationHub`]: escalations and lifecycle events
//!   delivered to [`NotificationSink`]s

pub mod error;
pub mod events;
pub mod registry;
pub mod run;
pub mod store;

pub use error::RegistryError;
pub use events::{LogSink, MemorySink, Notification, NotificationHub, NotificationSink, RelayEvent};
pub use registry::RunRegistry;
pub use run::{RunSeed, RunState, WorkflowRun};
pub use store::RunStore;
