// broker/memory.rs - In-process broker with MQTT-style routing.
//
// Each published message is routed to every subscription whose filter
// matches. Deliveries stay in flight until acked; a nack requeues the
// message immediately, and redeliver_unacked() simulates a reconnect by
// requeueing everything still in flight.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use relay_core::topic_filter::is_valid_filter;
use relay_core::topic_matches;
use tokio::sync::mpsc;

use super::{Broker, Delivery, Settle, Settlement, Subscription};
use crate::error::BrokerError;

struct InFlight {
    filter: String,
    topic: String,
    payload: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    subscriptions: Vec<(String, mpsc::UnboundedSender<Delivery>)>,
    in_flight: BTreeMap<u64, InFlight>,
    published: Vec<(String, Vec<u8>)>,
    next_id: u64,
    acked: u64,
    nacked: u64,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

struct MemorySettle {
    inner: Arc<Mutex<Inner>>,
    id: u64,
}

impl Settle for MemorySettle {
    fn settle(self: Box<Self>, settlement: Settlement) {
        let mut inner = lock(&self.inner);
        let Some(msg) = inner.in_flight.remove(&self.id) else {
            return;
        };
        match settlement {
            Settlement::Ack => inner.acked += 1,
            Settlement::Nack => {
                inner.nacked += 1;
                route(&self.inner, &mut inner, &msg.filter, msg.topic, msg.payload, true);
            }
        }
    }
}

fn lock(inner: &Mutex<Inner>) -> std::sync::MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

/// Hand one message to the subscription for `filter`.
fn route(shared: &Arc<Mutex<Inner>>, inner: &mut Inner, filter: &str, topic: String, payload: Vec<u8>, redelivered: bool) {
    let Some(tx) = inner
        .subscriptions
        .iter()
        .find(|(f, _)| f == filter)
        .map(|(_, tx)| tx.clone())
    else {
        return;
    };
    inner.next_id += 1;
    let id = inner.next_id;
    inner.in_flight.insert(
        id,
        InFlight {
            filter: filter.to_string(),
            topic: topic.clone(),
            payload: payload.clone(),
        },
    );
    let settle = Box::new(MemorySettle {
        inner: shared.clone(),
        id,
    });
    if tx.send(Delivery::new(topic, payload, redelivered, settle)).is_err() {
        // The receiver is gone; keep the message in flight for redelivery.
        tracing::debug!(filter, "subscription receiver dropped");
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requeue every unsettled delivery, flagged as redelivered.
    /// Returns how many were requeued.
    pub fn redeliver_unacked(&self) -> usize {
        let mut inner = lock(&self.inner);
        let pending: Vec<InFlight> = std::mem::take(&mut inner.in_flight).into_values().collect();
        let count = pending.len();
        for msg in pending {
            route(&self.inner, &mut inner, &msg.filter, msg.topic, msg.payload, true);
        }
        count
    }

    pub fn acked(&self) -> u64 {
        lock(&self.inner).acked
    }

    pub fn nacked(&self) -> u64 {
        lock(&self.inner).nacked
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.inner).in_flight.len()
    }

    /// Messages published on topics matching `filter`, oldest first.
    pub fn published_matching(&self, filter: &str) -> Vec<(String, Vec<u8>)> {
        lock(&self.inner)
            .published
            .iter()
            .filter(|(topic, _)| topic_matches(filter, topic))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, filter: &str) -> Result<Subscription, BrokerError> {
        if !is_valid_filter(filter) {
            return Err(BrokerError::InvalidFilter(filter.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);
        inner.subscriptions.retain(|(f, _)| f != filter);
        inner.subscriptions.push((filter.to_string(), tx));
        Ok(Subscription::new(filter, rx))
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut inner = lock(&self.inner);
        inner.published.push((topic.to_string(), payload.to_vec()));
        let filters: Vec<String> = inner
            .subscriptions
            .iter()
            .filter(|(f, _)| topic_matches(f, topic))
            .map(|(f, _)| f.clone())
            .collect();
        for filter in filters {
            route(&self.inner, &mut inner, &filter, topic.to_string(), payload.to_vec(), false);
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError> {
        lock(&self.inner).subscriptions.retain(|(f, _)| f != filter);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
