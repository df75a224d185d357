//! # relay-core
//!
//! Event model and topic parsing for the parameter relay.
//!
//! Broker messages arrive as a topic string plus a JSON payload. The
//! [`TopicParser`] turns them into [`ParameterUpdateEvent`]s, each carrying
//! an [`IdempotencyKey`] that the rest of the relay uses to deduplicate
//! workflow runs.
//!
//! ## Key components
//!
//! - [`TopicParser`]: pure topic + payload decoding
//! - [`ParameterUpdateEvent`]: one decoded parameter change
//! - [`IdempotencyKey`]: SHA-256 over topic, name, value and coalescing window
//! - [`topic_matches`]: MQTT-style topic filter matching (`+`, `#`)
//! - [`RetryPolicy`]: bounded exponential backoff shared by the dependency clients
//! - [`ErrorClass`]: the relay-wide error taxonomy

pub mod error;
pub mod event;
pub mod hasher;
pub mod parser;
pub mod retry;
pub mod topic_filter;

pub use error::{ErrorClass, ParseError};
pub use event::{EventKind, IdempotencyKey, ParameterUpdateEvent, ResourceTopic};
pub use parser::{ParserConfig, TopicParser};
pub use retry::{Attempted, Exhausted, RetryPolicy};
pub use topic_filter::topic_matches;
