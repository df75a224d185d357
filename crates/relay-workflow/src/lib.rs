//! # relay-workflow
//!
//! Submits simulation workflow runs and tracks their completion.
//!
//! The core abstraction is the [`WorkflowEngine`] trait. Engines differ in
//! whether they push completion notices or must be polled, and in whether
//! they accept an idempotency key on submission; the trait covers both.
//! The engine adapters never deduplicate: that is the run registry's job.
//!
//! - [`MemoryWorkflowEngine`]: deterministic in-process engine
//! - [`GalaxyEngine`]: Galaxy workflow invocations over HTTP
//! - [`WorkflowTrigger`]: per-call deadline and parameter aliasing

pub mod engine;
pub mod error;
pub mod galaxy;
pub mod memory;
pub mod trigger;

pub use engine::{EngineRun, RunStatus, StatusNotice, WorkflowEngine, WorkflowRef};
pub use error::TriggerError;
pub use galaxy::{GalaxyConfig, GalaxyEngine};
pub use memory::MemoryWorkflowEngine;
pub use trigger::WorkflowTrigger;
