// publish.rs - Send a parameter update through the configured MQTT broker.

use std::time::Duration;

use anyhow::Context;
use relay_dispatcher::{Broker, MqttBroker, RelayConfig};
use serde_json::{Map, Value};
use tokio::sync::watch;

/// Time given to the event loop to hand the message to the broker.
const FLUSH_DELAY: Duration = Duration::from_millis(500);

pub fn execute(
    config: &RelayConfig,
    class: &str,
    resource_id: &str,
    params: &[String],
) -> anyhow::Result<()> {
    let topic = format!("/{class}/update/{resource_id}");
    let payload = serde_json::to_vec(&build_payload(params)?)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (broker, event_loop) = MqttBroker::connect(&config.broker, stop_rx);
        broker
            .publish(&topic, &payload)
            .await
            .with_context(|| format!("failed to publish to {topic}"))?;
        tokio::time::sleep(FLUSH_DELAY).await;
        let _ = stop_tx.send(true);
        event_loop.await?;
        println!("Published to {topic}: {}", String::from_utf8_lossy(&payload));
        Ok(())
    })
}

/// `NAME=VALUE` pairs to a flat JSON object. Numeric values stay numbers.
fn build_payload(params: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut payload = Map::new();
    for param in params {
        let (name, value) = param
            .split_once('=')
            .filter(|(name, _)| !name.is_empty())
            .with_context(|| format!("expected NAME=VALUE, got {param:?}"))?;
        let value = match serde_json::from_str::<Value>(value) {
            Ok(number @ Value::Number(_)) => number,
            _ => Value::String(value.to_string()),
        };
        payload.insert(name.to_string(), value);
    }
    Ok(payload)
}
