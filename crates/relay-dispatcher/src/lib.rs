//! # relay-dispatcher
//!
//! Owns the broker subscription and sequences everything downstream of it.
//!
//! For each delivery the [`Dispatcher`] parses the message, applies the
//! metadata mutation, claims the idempotency key in the run registry and
//! submits the workflow run. The message is acked only once that has
//! resolved, so a crash anywhere before the ack gets the message redelivered
//! and the registry turns the redelivery into a skipped duplicate.
//!
//! ## Key components
//!
//! - [`Broker`]: subscription seam, with [`MemoryBroker`] and (feature
//!   `mqtt`) `MqttBroker`
//! - [`Dispatcher`]: the per-delivery pipeline and the single
//!   [`apply_status`](Dispatcher::apply_status) entry point for completions
//! - [`Relay`]: lifecycle, worker pool, poller, reconciler and HTTP API
//! - [`RelayConfig`]: the `relay.toml` file
//!
//! ## Quick start
//!
//! ```no_run
//! use relay_dispatcher::{start_from_config, RelayConfig};
//!
//! # async fn run() -> Result<(), relay_dispatcher::DispatchError> {
//! let config = RelayConfig::load_or_default(std::path::Path::new("relay.toml"))?;
//! let relay = start_from_config(&config).await?;
//! relay.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await
//! # }
//! ```

pub mod broker;
pub mod completion;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod notify;
pub mod reconcile;
pub mod relay;

pub use broker::{Broker, Delivery, MemoryBroker, Settlement, Subscription};
#[cfg(feature = "mqtt")]
pub use broker::MqttBroker;
pub use completion::{completion_channel, poll_in_flight, CompletionSender};
pub use config::{CompletionMode, RelayConfig};
pub use dispatcher::{DispatchReport, Dispatcher, EventOutcome, Stage, StatusChange};
pub use error::{BrokerError, DispatchError};
pub use http::{router, ApiState};
pub use notify::BrokerSink;
pub use reconcile::{ReconcileReport, SweepSchedule};
pub use relay::{start_from_config, Relay, RelayOptions};
