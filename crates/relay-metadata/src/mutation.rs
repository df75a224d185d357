// mutation.rs - Triples and the upserts that write them.

use chrono::{DateTime, Utc};
use relay_core::ParameterUpdateEvent;
use serde::{Deserialize, Serialize};

/// A subject/predicate/object fact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Triple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

/// One upsert against the triplestore.
///
/// `(subject, predicate)` is functional: an upsert replaces any previous
/// object for the pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataMutation {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    /// Set once the store has committed the write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
}

impl MetadataMutation {
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            applied_at: None,
        }
    }

    /// `(resource_id, parameter_name, parameter_value)`.
    pub fn from_event(event: &ParameterUpdateEvent) -> Self {
        Self::new(
            event.resource_id(),
            event.parameter_name.as_str(),
            event.parameter_value.as_str(),
        )
    }

    pub fn triple(&self) -> Triple {
        Triple {
            subject: self.subject.clone(),
            predicate: self.predicate.clone(),
            object: self.object.clone(),
        }
    }
}

/// What the store did with an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ack {
    /// The triple was written (new, or replacing a different object).
    Applied,
    /// The exact triple was already present.
    Unchanged,
}
