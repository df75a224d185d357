// event.rs - Parameter update events and their idempotency keys.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hasher;

/// The kinds of event the relay understands.
///
/// The action segment of a topic selects the kind. Anything not listed here
/// is rejected at parse time instead of being passed along untyped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A parameter value changed and downstream simulations should rerun.
    Update,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Update => "update",
        }
    }

    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "update" => Some(EventKind::Update),
            _ => None,
        }
    }
}

/// A parsed topic: `/{class}/{action}/{resource_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceTopic {
    pub class: String,
    pub kind: EventKind,
    pub resource_id: String,
}

impl fmt::Display for ResourceTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}/{}", self.class, self.kind.as_str(), self.resource_id)
    }
}

/// Deterministic identifier for "the same logical change".
///
/// Two deliveries of the same topic, parameter and value inside one
/// coalescing window share a key, so at most one workflow run is started
/// for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derive a key. `window_index` is `received_at / coalescing_window`.
    pub fn derive(topic: &ResourceTopic, name: &str, value: &str, window_index: i64) -> Self {
        let topic = topic.to_string();
        let window = window_index.to_string();
        Self(hasher::hash_fields(&[&topic, name, value, &window]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines and CLI tables.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IdempotencyKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if hasher::is_hex_digest(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(format!("not an idempotency key: {s:?}"))
        }
    }
}

/// One inbound parameter change, immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterUpdateEvent {
    pub topic: ResourceTopic,
    pub parameter_name: String,
    pub parameter_value: String,
    pub received_at: DateTime<Utc>,
    pub idempotency_key: IdempotencyKey,
}

impl ParameterUpdateEvent {
    pub fn resource_id(&self) -> &str {
        &self.topic.resource_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(id: &str) -> ResourceTopic {
        ResourceTopic {
            class: "parameter".into(),
            kind: EventKind::Update,
            resource_id: id.into(),
        }
    }

    #[test]
    fn topic_display_is_canonical() {
        assert_eq!(topic("01234").to_string(), "/parameter/update/01234");
    }

    #[test]
    fn key_depends_on_every_input() {
        let base = IdempotencyKey::derive(&topic("1"), "MajorRadius", "8.5", 10);
        assert_eq!(base, IdempotencyKey::derive(&topic("1"), "MajorRadius", "8.5", 10));
        assert_ne!(base, IdempotencyKey::derive(&topic("2"), "MajorRadius", "8.5", 10));
        assert_ne!(base, IdempotencyKey::derive(&topic("1"), "Elongation", "8.5", 10));
        assert_ne!(base, IdempotencyKey::derive(&topic("1"), "MajorRadius", "8.6", 10));
        assert_ne!(base, IdempotencyKey::derive(&topic("1"), "MajorRadius", "8.5", 11));
    }

    #[test]
    fn newline_in_name_or_value_gives_distinct_keys() {
        let a = IdempotencyKey::derive(&topic("01234"), "x\ny", "z", 0);
        let b = IdempotencyKey::derive(&topic("01234"), "x", "y\nz", 0);
        assert_ne!(a, b);
    }

    #[test]
    fn key_round_trips_through_from_str() {
        let key = IdempotencyKey::derive(&topic("1"), "a", "b", 0);
        let parsed: IdempotencyKey = key.as_str().parse().unwrap();
        assert_eq!(parsed, key);
        assert_eq!(key.short().len(), 12);
        assert!("nope".parse::<IdempotencyKey>().is_err());
    }

    #[test]
    fn unknown_action_has_no_kind() {
        assert_eq!(EventKind::from_segment("update"), Some(EventKind::Update));
        assert_eq!(EventKind::from_segment("delete"), None);
    }
}
