// notify.rs - Republishing relay notifications on the broker.
//
// NotificationSink::send is synchronous, so BrokerSink only queues the
// notification; a publisher task does the async publish.

use std::sync::Arc;

use relay_registry::{Notification, NotificationSink, RegistryError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::broker::Broker;

/// Topic suffix for notifications that are not about one resource.
const RELAY_TOPIC_SUFFIX: &str = "relay";

pub struct BrokerSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotificationSink for BrokerSink {
    fn send(&self, notification: &Notification) -> Result<(), RegistryError> {
        self.tx
            .send(notification.clone())
            .map_err(|_| RegistryError::NotificationError("status publisher stopped".into()))
    }
}

/// `{prefix}/{resource_id}`, or `{prefix}/relay` for relay-wide events.
pub fn status_topic(prefix: &str, notification: &Notification) -> String {
    let suffix = notification.event.resource_id().unwrap_or(RELAY_TOPIC_SUFFIX);
    format!("{}/{}", prefix.trim_end_matches('/'), suffix)
}

/// Create the sink and spawn its publisher. The publisher drains what is
/// queued and exits once shutdown is signalled or every sink is dropped.
pub fn spawn_status_publisher(
    broker: Arc<dyn Broker>,
    prefix: impl Into<String>,
    mut shutdown: watch::Receiver<bool>,
) -> (BrokerSink, JoinHandle<()>) {
    let prefix = prefix.into();
    let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
    let handle = tokio::spawn(async move {
        loop {
            let notification = tokio::select! {
                biased;
                next = rx.recv() => match next {
                    Some(n) => n,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        // Flush what is already queued.
                        while let Ok(n) = rx.try_recv() {
                            publish(broker.as_ref(), &prefix, &n).await;
                        }
                        break;
                    }
                    continue;
                }
            };
            publish(broker.as_ref(), &prefix, &notification).await;
        }
        tracing::debug!("status publisher stopped");
    });
    (BrokerSink { tx }, handle)
}

async fn publish(broker: &dyn Broker, prefix: &str, notification: &Notification) {
    let topic = status_topic(prefix, notification);
    let payload = match serde_json::to_vec(notification) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode notification");
            return;
        }
    };
    if let Err(e) = broker.publish(&topic, &payload).await {
        tracing::warn!(%topic, error = %e, "failed to publish notification");
    }
}
