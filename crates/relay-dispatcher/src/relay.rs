// relay.rs - Relay lifecycle: start, run, shut down.
//
// start() subscribes one loop per topic filter. All loops share one worker
// pool (a semaphore), so the number of concurrent deliveries does not grow
// with the number of subscriptions. Alongside run the completion consumer,
// the poller (poll mode), the background reconciler and the HTTP API.
//
// shutdown() unsubscribes, signals every loop, waits up to the grace period
// for in-flight deliveries and aborts the rest. An aborted delivery is
// dropped unacked, so the broker redelivers it. Infrastructure tasks (the
// MQTT event loop, the status publisher) stop last so in-flight acks and
// notifications still go out.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use relay_core::TopicParser;
use relay_metadata::{MemoryTripleStore, MetadataClient, MetadataStore, SparqlStore};
use relay_registry::{LogSink, NotificationHub, RunRegistry, RunStore};
use relay_workflow::{GalaxyEngine, MemoryWorkflowEngine, WorkflowEngine, WorkflowTrigger};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::broker::{Broker, MemoryBroker, Subscription};
use crate::completion::{completion_channel, consume_completions, run_poller, CompletionSender};
use crate::config::{BrokerKind, CompletionMode, EngineKind, MetadataBackend, RelayConfig};
use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::http::{self, ApiState};
use crate::notify::spawn_status_publisher;
use crate::reconcile::{run_reconciler, SweepSchedule};

/// Runtime knobs for [`Relay::start`].
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub topics: Vec<String>,
    pub workers: usize,
    pub shutdown_grace: Duration,
    pub completion: CompletionMode,
    pub poll_interval: Duration,
    pub sweep: SweepSchedule,
    pub reconcile_on_start: bool,
    /// Address for the HTTP API; `None` disables it.
    pub http_bind: Option<String>,
}

impl RelayOptions {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            topics: config.broker.topics.clone(),
            workers: config.dispatcher.workers.max(1),
            shutdown_grace: Duration::from_secs(config.dispatcher.shutdown_grace_secs),
            completion: config.workflow.completion,
            poll_interval: Duration::from_secs(config.workflow.poll_interval_secs.max(1)),
            sweep: SweepSchedule {
                every: Duration::from_secs(config.registry.sweep_interval_secs.max(1)),
                staleness: chrono_secs(config.registry.staleness_secs),
                retention: chrono_secs(config.registry.retention_secs),
            },
            reconcile_on_start: true,
            http_bind: config.http.enabled.then(|| config.http.bind.clone()),
        }
    }
}

impl Default for RelayOptions {
    /// Config defaults without the HTTP API.
    fn default() -> Self {
        Self {
            http_bind: None,
            ..Self::from_config(&RelayConfig::default())
        }
    }
}

fn chrono_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::from_std(Duration::from_secs(secs)).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// A running relay.
pub struct Relay {
    dispatcher: Arc<Dispatcher>,
    broker: Arc<dyn Broker>,
    completions: CompletionSender,
    topics: Vec<String>,
    grace: Duration,
    stop: watch::Sender<bool>,
    subscribers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    http_addr: Option<SocketAddr>,
    infra_stop: Option<watch::Sender<bool>>,
    infra: Vec<JoinHandle<()>>,
}

impl Relay {
    /// Reconcile (if enabled), then subscribe and spawn every loop.
    pub async fn start(
        dispatcher: Arc<Dispatcher>,
        broker: Arc<dyn Broker>,
        options: RelayOptions,
    ) -> Result<Self, DispatchError> {
        if options.reconcile_on_start {
            // The engine may be down at startup; the sweep still runs later.
            if let Err(e) = dispatcher.reconcile_with_engine().await {
                tracing::warn!(error = %e, "startup reconciliation skipped");
            }
        }

        let (stop, stop_rx) = watch::channel(false);
        let (completions, notices) = completion_channel();
        let mut background = vec![tokio::spawn(consume_completions(
            dispatcher.clone(),
            notices,
            stop_rx.clone(),
        ))];
        if options.completion == CompletionMode::Poll {
            background.push(tokio::spawn(run_poller(
                dispatcher.clone(),
                options.poll_interval,
                stop_rx.clone(),
            )));
        }
        background.push(tokio::spawn(run_reconciler(
            dispatcher.clone(),
            options.sweep,
            stop_rx.clone(),
        )));

        let mut http_addr = None;
        if let Some(bind) = &options.http_bind {
            let listener = TcpListener::bind(bind).await.map_err(|source| DispatchError::IoError {
                path: bind.clone(),
                source,
            })?;
            http_addr = listener.local_addr().ok();
            let state = ApiState {
                dispatcher: dispatcher.clone(),
                completions: completions.clone(),
            };
            let stop_rx = stop_rx.clone();
            background.push(tokio::spawn(async move {
                if let Err(e) = http::serve(listener, state, stop_rx).await {
                    tracing::error!(error = %e, "HTTP API stopped");
                }
            }));
        }

        let permits = Arc::new(Semaphore::new(options.workers.max(1)));
        let mut subscribers = Vec::new();
        for filter in &options.topics {
            let subscription = broker.subscribe(filter).await?;
            tracing::info!(filter = %filter, broker = broker.name(), "subscribed");
            subscribers.push(tokio::spawn(subscriber_loop(
                subscription,
                dispatcher.clone(),
                permits.clone(),
                stop_rx.clone(),
                options.shutdown_grace,
            )));
        }

        tracing::info!(
            topics = options.topics.len(),
            workers = options.workers,
            completion = ?options.completion,
            "relay started"
        );
        Ok(Self {
            dispatcher,
            broker,
            completions,
            topics: options.topics,
            grace: options.shutdown_grace,
            stop,
            subscribers,
            background,
            http_addr,
            infra_stop: None,
            infra: Vec::new(),
        })
    }

    /// Tasks that must outlive the workers, stopped through `stop` after
    /// the drain.
    pub fn with_infrastructure(mut self, stop: watch::Sender<bool>, tasks: Vec<JoinHandle<()>>) -> Self {
        self.infra_stop = Some(stop);
        self.infra.extend(tasks);
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Sender for pushed status notices.
    pub fn completions(&self) -> CompletionSender {
        self.completions.clone()
    }

    /// Where the HTTP API ended up listening.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Wait until `stop_signal` resolves, then shut down.
    pub async fn run_until<F>(self, stop_signal: F) -> Result<(), DispatchError>
    where
        F: std::future::Future<Output = ()>,
    {
        stop_signal.await;
        self.shutdown().await
    }

    /// Stop taking deliveries, drain in-flight work within the grace period,
    /// then stop everything else.
    pub async fn shutdown(self) -> Result<(), DispatchError> {
        tracing::info!(grace = ?self.grace, "relay shutting down");
        for filter in &self.topics {
            if let Err(e) = self.broker.unsubscribe(filter).await {
                tracing::warn!(filter = %filter, error = %e, "unsubscribe failed");
            }
        }
        let _ = self.stop.send(true);

        for handle in self.subscribers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "subscriber loop panicked");
            }
        }
        join_within(self.background, self.grace).await;

        if let Some(stop) = &self.infra_stop {
            let _ = stop.send(true);
        }
        join_within(self.infra, self.grace).await;
        tracing::info!("relay stopped");
        Ok(())
    }
}

async fn join_within(handles: Vec<JoinHandle<()>>, grace: Duration) {
    for mut handle in handles {
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            handle.abort();
        }
    }
}

async fn subscriber_loop(
    mut subscription: Subscription,
    dispatcher: Arc<Dispatcher>,
    permits: Arc<Semaphore>,
    mut stop: watch::Receiver<bool>,
    grace: Duration,
) {
    let filter = subscription.filter().to_string();
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(filter = %filter, error = %e, "delivery task failed");
                }
            }
            delivery = subscription.recv() => {
                let Some(delivery) = delivery else { break };
                let permit = tokio::select! {
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                    // Dropped unacked; the broker hands it out again.
                    _ = stop.changed() => break,
                };
                let dispatcher = dispatcher.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    let report = dispatcher.process(delivery).await;
                    tracing::debug!(
                        topic = %report.topic,
                        events = report.events.len(),
                        dropped = report.is_dropped(),
                        "delivery processed"
                    );
                });
            }
        }
    }

    if !tasks.is_empty() {
        let in_flight = tasks.len();
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(filter = %filter, in_flight, remaining = tasks.len(), "grace period over, aborting deliveries");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
    tracing::debug!(filter = %filter, "subscriber stopped");
}

/// Build every component from `config` and start the relay.
pub async fn start_from_config(config: &RelayConfig) -> Result<Relay, DispatchError> {
    let (infra_stop, infra_rx) = watch::channel(false);
    let mut infra = Vec::new();

    let broker: Arc<dyn Broker> = match config.broker.kind {
        BrokerKind::Memory => Arc::new(MemoryBroker::new()),
        #[cfg(feature = "mqtt")]
        BrokerKind::Mqtt => {
            let (broker, handle) = crate::broker::MqttBroker::connect(&config.broker, infra_rx.clone());
            infra.push(handle);
            Arc::new(broker)
        }
        #[cfg(not(feature = "mqtt"))]
        BrokerKind::Mqtt => {
            return Err(DispatchError::Config(
                "broker.kind = \"mqtt\" needs the `mqtt` feature".into(),
            ))
        }
    };

    let mut hub = NotificationHub::new();
    if let Some(path) = &config.notifications.log_path {
        hub.add_sink(Box::new(LogSink::new(path)));
    }
    if config.notifications.publish_status {
        let (sink, handle) = spawn_status_publisher(
            broker.clone(),
            config.notifications.status_topic_prefix.clone(),
            infra_rx.clone(),
        );
        hub.add_sink(Box::new(sink));
        infra.push(handle);
    }

    let store: Arc<dyn MetadataStore> = match config.metadata.backend {
        MetadataBackend::Memory => Arc::new(MemoryTripleStore::new()),
        MetadataBackend::Sparql => {
            let sparql = config
                .metadata
                .sparql
                .clone()
                .ok_or_else(|| DispatchError::Config("missing [metadata.sparql]".into()))?;
            Arc::new(SparqlStore::new(sparql)?)
        }
    };
    let metadata = MetadataClient::new(
        store,
        config.metadata.retry.clone(),
        Duration::from_millis(config.metadata.call_timeout_ms),
    );

    let mut memory_engine = None;
    let engine: Arc<dyn WorkflowEngine> = match config.workflow.engine {
        EngineKind::Memory => {
            let engine = Arc::new(MemoryWorkflowEngine::new());
            memory_engine = Some(engine.clone());
            engine
        }
        EngineKind::Galaxy => {
            let galaxy = config
                .workflow
                .galaxy
                .clone()
                .ok_or_else(|| DispatchError::Config("missing [workflow.galaxy]".into()))?;
            Arc::new(GalaxyEngine::new(galaxy)?)
        }
    };
    let trigger = WorkflowTrigger::new(engine, Duration::from_millis(config.workflow.call_timeout_ms))
        .with_parameter_map(config.workflow.parameter_map.clone());

    let registry = match &config.registry.state_dir {
        Some(dir) => load_registry(dir, config.registry.max_submissions)?,
        None => RunRegistry::new(config.registry.max_submissions),
    };

    let dispatcher = Dispatcher::new(
        TopicParser::new(config.parser.clone()),
        metadata,
        trigger,
        Arc::new(registry),
        Arc::new(hub),
    )
    .with_resubmit_backoff(config.workflow.retry.clone());

    let relay = Relay::start(Arc::new(dispatcher), broker, RelayOptions::from_config(config))
        .await?
        .with_infrastructure(infra_stop, infra);

    if let (Some(engine), CompletionMode::Push) = (memory_engine, config.workflow.completion) {
        engine.notify_to(relay.completions().sender());
    }
    Ok(relay)
}

fn load_registry(dir: &Path, max_submissions: u32) -> Result<RunRegistry, DispatchError> {
    let store = RunStore::new(dir)?;
    Ok(RunRegistry::load(store, max_submissions)?)
}
