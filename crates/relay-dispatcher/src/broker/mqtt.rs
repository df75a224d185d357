// broker/mqtt.rs - MQTT broker connection (rumqttc).
//
// QoS 1 with manual acks: a PUBACK is only sent once the relay settles the
// delivery, so an unsettled message is redelivered by the broker after a
// reconnect. The session is persistent (clean_session = false) so the
// broker keeps subscriptions and unacked messages across reconnects.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_core::topic_filter::is_valid_filter;
use relay_core::topic_matches;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS, Transport};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{Broker, Delivery, Settle, Settlement, Subscription};
use crate::config::{BrokerConfig, BrokerTransport};
use crate::error::BrokerError;

type Routes = Arc<Mutex<Vec<(String, mpsc::UnboundedSender<Delivery>)>>>;

pub struct MqttBroker {
    client: AsyncClient,
    routes: Routes,
}

struct MqttSettle {
    client: AsyncClient,
    publish: Publish,
}

impl Settle for MqttSettle {
    fn settle(self: Box<Self>, settlement: Settlement) {
        match settlement {
            Settlement::Ack => {
                if let Err(e) = self.client.try_ack(&self.publish) {
                    tracing::warn!(topic = %self.publish.topic, error = %e, "failed to ack MQTT message");
                }
            }
            // MQTT 3.1.1 has no negative ack; withholding the PUBACK gets
            // the message redelivered after the next reconnect.
            Settlement::Nack => {
                tracing::debug!(topic = %self.publish.topic, "MQTT message left unacked for redelivery");
            }
        }
    }
}

/// Build client options from the `[broker]` table.
pub fn mqtt_options(config: &BrokerConfig) -> MqttOptions {
    let mut options = match config.transport {
        BrokerTransport::Tcp => MqttOptions::new(&config.client_id, &config.host, config.port),
        BrokerTransport::Websocket => {
            let url = format!("ws://{}:{}{}", config.host, config.port, config.ws_path);
            let mut options = MqttOptions::new(&config.client_id, url, config.port);
            options.set_transport(Transport::Ws);
            options
        }
    };
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(false);
    options.set_manual_acks(true);
    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.clone().unwrap_or_default());
    }
    options
}

impl MqttBroker {
    /// Create the client and spawn its event loop. The loop stops when
    /// `shutdown` flips to true.
    pub fn connect(config: &BrokerConfig, shutdown: watch::Receiver<bool>) -> (Self, JoinHandle<()>) {
        let (client, eventloop) = AsyncClient::new(mqtt_options(config), 64);
        let routes: Routes = Arc::new(Mutex::new(Vec::new()));
        tracing::info!(host = %config.host, port = config.port, transport = ?config.transport, "connecting to MQTT broker");
        let handle = tokio::spawn(drive(eventloop, client.clone(), routes.clone(), shutdown));
        (Self { client, routes }, handle)
    }
}

async fn drive(mut eventloop: EventLoop, client: AsyncClient, routes: Routes, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            polled = eventloop.poll() => match polled {
                Ok(Event::Incoming(Packet::Publish(publish))) => dispatch(&client, &routes, publish),
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    tracing::info!(session_present = ack.session_present, "MQTT connected");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "MQTT connection error, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
        }
    }
    if let Err(e) = client.disconnect().await {
        tracing::debug!(error = %e, "MQTT disconnect failed");
    }
    tracing::info!("MQTT event loop stopped");
}

/// Route to the first matching subscription. `RelayConfig::validate` rejects
/// overlapping filters, so at most one matches.
fn dispatch(client: &AsyncClient, routes: &Routes, publish: Publish) {
    let topic = publish.topic.clone();
    let tx = routes
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .find(|(filter, _)| topic_matches(filter, &topic))
        .map(|(_, tx)| tx.clone());

    let Some(tx) = tx else {
        // Nobody wants it; ack so the broker does not redeliver forever.
        tracing::debug!(%topic, "no subscription for MQTT message");
        if let Err(e) = client.try_ack(&publish) {
            tracing::warn!(%topic, error = %e, "failed to ack unrouted MQTT message");
        }
        return;
    };

    let delivery = Delivery::new(
        topic,
        publish.payload.to_vec(),
        publish.dup,
        Box::new(MqttSettle {
            client: client.clone(),
            publish,
        }),
    );
    if tx.send(delivery).is_err() {
        tracing::debug!("subscription receiver dropped; MQTT message left unacked");
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn subscribe(&self, filter: &str) -> Result<Subscription, BrokerError> {
        if !is_valid_filter(filter) {
            return Err(BrokerError::InvalidFilter(filter.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
            routes.retain(|(f, _)| f != filter);
            routes.push((filter.to_string(), tx));
        }
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Subscription::new(filter, rx))
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError> {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(f, _)| f != filter);
        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    fn name(&self) -> &str {
        "mqtt"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(transport: BrokerTransport) -> BrokerConfig {
        BrokerConfig {
            transport,
            host: "broker.local".into(),
            port: 80,
            username: Some("relay".into()),
            password: Some("secret".into()),
            ..BrokerConfig::default()
        }
    }

    #[test]
    fn websocket_options_use_ws_url() {
        let options = mqtt_options(&config(BrokerTransport::Websocket));
        assert_eq!(options.broker_address(), ("ws://broker.local:80/ws".to_string(), 80));
        assert!(!options.clean_session());
        assert!(options.manual_acks());
        assert_eq!(
            options.credentials(),
            Some(("relay".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn tcp_options_use_plain_host() {
        let options = mqtt_options(&config(BrokerTransport::Tcp));
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 80));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
    }
}
