// parser.rs - Topic and payload decoding.
//
// Topics follow `/{class}/{action}/{resource_id}` (the leading slash is
// optional). Payloads are flat JSON objects; each key becomes one event.
// Parsing is pure: the ingestion timestamp is an input, not read from the
// clock, so the same bytes always produce the same events.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ParseError;
use crate::event::{EventKind, IdempotencyKey, ParameterUpdateEvent, ResourceTopic};

/// Parser settings, read from the `[parser]` table of relay.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Resource classes accepted in the first topic segment.
    #[serde(default = "default_resource_classes")]
    pub resource_classes: BTreeSet<String>,

    /// Width of the window inside which identical updates share a key.
    #[serde(default = "default_coalescing_window_secs")]
    pub coalescing_window_secs: u64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            resource_classes: default_resource_classes(),
            coalescing_window_secs: default_coalescing_window_secs(),
        }
    }
}

fn default_resource_classes() -> BTreeSet<String> {
    BTreeSet::from(["parameter".to_string()])
}

fn default_coalescing_window_secs() -> u64 {
    300
}

/// Decodes broker messages into [`ParameterUpdateEvent`]s.
#[derive(Debug, Clone)]
pub struct TopicParser {
    config: ParserConfig,
}

impl TopicParser {
    pub fn new(config: ParserConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Parse one broker message.
    ///
    /// Returns one event per payload key, ordered by parameter name.
    pub fn parse(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Vec<ParameterUpdateEvent>, ParseError> {
        let resource = self.parse_topic(topic)?;
        let fields = parse_payload(topic, payload)?;
        let window = self.window_index(received_at);

        Ok(fields
            .into_iter()
            .map(|(name, value)| {
                let idempotency_key = IdempotencyKey::derive(&resource, &name, &value, window);
                ParameterUpdateEvent {
                    topic: resource.clone(),
                    parameter_name: name,
                    parameter_value: value,
                    received_at,
                    idempotency_key,
                }
            })
            .collect())
    }

    /// Parse only the topic string.
    pub fn parse_topic(&self, topic: &str) -> Result<ResourceTopic, ParseError> {
        let malformed = |reason: &str| ParseError::MalformedTopic {
            topic: topic.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = topic.strip_prefix('/').unwrap_or(topic);
        let segments: Vec<&str> = trimmed.split('/').collect();
        if segments.len() != 3 {
            return Err(malformed("expected /{class}/{action}/{resource_id}"));
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(malformed("empty topic segment"));
        }
        if segments.iter().any(|s| s.contains(['+', '#'])) {
            return Err(malformed("wildcards are not allowed in a message topic"));
        }

        let (class, action, resource_id) = (segments[0], segments[1], segments[2]);
        if !self.config.resource_classes.contains(class) {
            return Err(ParseError::UnknownResourceClass {
                topic: topic.to_string(),
                class: class.to_string(),
            });
        }
        let kind = EventKind::from_segment(action)
            .ok_or_else(|| malformed(&format!("unknown action {action:?}")))?;

        Ok(ResourceTopic {
            class: class.to_string(),
            kind,
            resource_id: resource_id.to_string(),
        })
    }

    fn window_index(&self, received_at: DateTime<Utc>) -> i64 {
        let window = self.config.coalescing_window_secs.max(1) as i64;
        received_at.timestamp().div_euclid(window)
    }
}

/// Decode a payload into `(name, value)` pairs sorted by name.
fn parse_payload(topic: &str, payload: &[u8]) -> Result<Vec<(String, String)>, ParseError> {
    let malformed = |reason: String| ParseError::MalformedPayload {
        topic: topic.to_string(),
        reason,
    };

    let value: Value =
        serde_json::from_slice(payload).map_err(|e| malformed(format!("invalid JSON: {e}")))?;
    let Value::Object(map) = value else {
        return Err(malformed("payload must be a JSON object".into()));
    };
    if map.is_empty() {
        return Err(malformed("payload has no parameters".into()));
    }

    let mut fields = Vec::with_capacity(map.len());
    for (name, value) in map {
        if name.trim().is_empty() {
            return Err(malformed("empty parameter name".into()));
        }
        let value = match value {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null | Value::Array(_) | Value::Object(_) => {
                return Err(malformed(format!("parameter {name:?} is not a scalar")));
            }
        };
        fields.push((name, value));
    }
    fields.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(fields)
}
