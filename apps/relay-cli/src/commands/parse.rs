// parse.rs - Offline decoding of a topic and payload.
//
// Runs the same parser the relay uses, so operators can check what a
// message would turn into (and which idempotency keys it gets) without a
// broker or engine.

use chrono::{DateTime, Utc};
use relay_core::{ParameterUpdateEvent, TopicParser};
use relay_dispatcher::RelayConfig;

pub fn execute(
    config: &RelayConfig,
    topic: &str,
    payload: &str,
    at: Option<DateTime<Utc>>,
) -> anyhow::Result<()> {
    let events = decode(config, topic, payload, at.unwrap_or_else(Utc::now))?;
    println!("{}", serde_json::to_string_pretty(&events)?);
    Ok(())
}

fn decode(
    config: &RelayConfig,
    topic: &str,
    payload: &str,
    at: DateTime<Utc>,
) -> anyhow::Result<Vec<ParameterUpdateEvent>> {
    let parser = TopicParser::new(config.parser.clone());
    Ok(parser.parse(topic, payload.as_bytes(), at)?)
}
