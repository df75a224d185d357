// broker/mod.rs - The Broker seam.
//
// A broker hands out deliveries for subscribed topic filters and takes
// them back as acks or nacks. Delivery is at-least-once: a delivery that is
// dropped without being settled is redelivered later (by the MQTT broker
// after a reconnect, or by MemoryBroker::redeliver_unacked).

pub mod memory;
#[cfg(feature = "mqtt")]
pub mod mqtt;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BrokerError;

pub use memory::MemoryBroker;
#[cfg(feature = "mqtt")]
pub use mqtt::MqttBroker;

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    /// Ask for redelivery.
    Nack,
}

/// Broker-specific settlement hook carried by each delivery.
pub trait Settle: Send {
    fn settle(self: Box<Self>, settlement: Settlement);
}

/// One message handed to the relay.
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Set when the broker has delivered this message before.
    pub redelivered: bool,
    settle: Option<Box<dyn Settle>>,
}

impl Delivery {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>, redelivered: bool, settle: Box<dyn Settle>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            redelivered,
            settle: Some(settle),
        }
    }

    /// A delivery with nothing to settle, e.g. a message injected by a test.
    pub fn detached(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            redelivered: false,
            settle: None,
        }
    }

    pub fn ack(mut self) {
        if let Some(s) = self.settle.take() {
            s.settle(Settlement::Ack);
        }
    }

    pub fn nack(mut self) {
        if let Some(s) = self.settle.take() {
            s.settle(Settlement::Nack);
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Deliveries for one topic filter.
pub struct Subscription {
    filter: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn new(filter: impl Into<String>, rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            filter: filter.into(),
            rx,
        }
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Next delivery, or None once the broker has closed the subscription.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn subscribe(&self, filter: &str) -> Result<Subscription, BrokerError>;

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError>;

    fn name(&self) -> &str;
}
