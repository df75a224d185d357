// relay_flow.rs - End-to-end relay scenarios over the in-memory broker.
//
// Each test wires a real Relay (subscriber loops, worker pool, completion
// consumer) to the in-memory broker, triplestore and workflow engine, then
// drives it by publishing broker messages and completing engine runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::{IdempotencyKey, ParserConfig, RetryPolicy, TopicParser};
use relay_dispatcher::notify::spawn_status_publisher;
use relay_dispatcher::{Broker, CompletionMode, Delivery, Dispatcher, MemoryBroker, Relay, RelayOptions, Stage};
use relay_metadata::{MemoryTripleStore, MetadataClient, MetadataError, MetadataStore};
use relay_registry::{MemorySink, NotificationHub, RelayEvent, RunRegistry, RunState, RunStore};
use relay_workflow::{
    EngineRun, MemoryWorkflowEngine, RunStatus, TriggerError, WorkflowEngine, WorkflowRef, WorkflowTrigger,
};
use tempfile::TempDir;
use tokio::sync::watch;

const TOPIC: &str = "/parameter/update/01234";
const PAYLOAD: &[u8] = br#"{"MajorRadius":"8.5"}"#;

struct Harness {
    broker: MemoryBroker,
    store: Arc<MemoryTripleStore>,
    sink: Arc<MemorySink>,
    dispatcher: Arc<Dispatcher>,
}

fn parser() -> TopicParser {
    // One window for the whole test run, so redeliveries always share a key.
    TopicParser::new(ParserConfig {
        coalescing_window_secs: 1_000_000_000,
        ..ParserConfig::default()
    })
}

fn harness(engine: Arc<dyn WorkflowEngine>, registry: Arc<RunRegistry>) -> Harness {
    harness_with_hub(engine, registry, NotificationHub::new())
}

fn harness_with_hub(engine: Arc<dyn WorkflowEngine>, registry: Arc<RunRegistry>, hub: NotificationHub) -> Harness {
    let store = Arc::new(MemoryTripleStore::new());
    let sink = Arc::new(MemorySink::new());
    let dispatcher = Dispatcher::new(
        parser(),
        MetadataClient::new(store.clone(), RetryPolicy::immediate(3), Duration::from_secs(1)),
        WorkflowTrigger::new(engine, Duration::from_secs(30)),
        registry,
        Arc::new(hub.with_sink(sink.clone())),
    )
    .with_resubmit_backoff(RetryPolicy::immediate(1));
    Harness {
        broker: MemoryBroker::new(),
        store,
        sink,
        dispatcher: Arc::new(dispatcher),
    }
}

fn options() -> RelayOptions {
    RelayOptions {
        workers: 4,
        completion: CompletionMode::Push,
        reconcile_on_start: false,
        shutdown_grace: Duration::from_secs(1),
        ..RelayOptions::default()
    }
}

async fn start(h: &Harness, options: RelayOptions) -> Relay {
    Relay::start(h.dispatcher.clone(), Arc::new(h.broker.clone()), options)
        .await
        .unwrap()
}

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn only_run(h: &Harness) -> relay_registry::WorkflowRun {
    let runs = h.dispatcher.registry().list();
    assert_eq!(runs.len(), 1, "expected exactly one run");
    runs.into_iter().next().unwrap()
}

#[tokio::test]
async fn documented_update_runs_to_success() {
    let engine = Arc::new(MemoryWorkflowEngine::new());
    let h = harness(engine.clone(), Arc::new(RunRegistry::new(3)));
    let relay = start(&h, options()).await;
    engine.notify_to(relay.completions().sender());

    h.broker.publish(TOPIC, PAYLOAD).await.unwrap();
    wait_for("ack", || h.broker.acked() == 1).await;

    // One triple, written once.
    assert_eq!(h.store.get("01234", "MajorRadius").await.unwrap().as_deref(), Some("8.5"));
    assert_eq!(h.store.writes(), 1);

    let run = only_run(&h);
    assert_eq!(run.state, RunState::Submitted);
    let workflow_ref = run.workflow_ref.clone().unwrap();
    assert_eq!(
        engine.parameters_of(&workflow_ref).unwrap(),
        BTreeMap::from([("MajorRadius".to_string(), "8.5".to_string())])
    );

    engine.complete(&workflow_ref, RunStatus::Running).unwrap();
    engine.complete(&workflow_ref, RunStatus::Succeeded).unwrap();
    wait_for("success", || only_run(&h).state == RunState::Succeeded).await;

    let transitions: Vec<(RunState, RunState)> = h
        .sink
        .notifications()
        .into_iter()
        .filter_map(|n| match n.event {
            RelayEvent::RunStateChanged { from_state, to_state, .. } => Some((from_state, to_state)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (RunState::Submitted, RunState::Running),
            (RunState::Running, RunState::Succeeded),
        ]
    );
    assert_eq!(h.sink.count("run_submitted"), 1);

    relay.shutdown().await.unwrap();
    assert_eq!(h.broker.in_flight(), 0);
}

#[tokio::test]
async fn repeated_delivery_is_skipped() {
    let engine = Arc::new(MemoryWorkflowEngine::new());
    let h = harness(engine.clone(), Arc::new(RunRegistry::new(3)));
    let relay = start(&h, options()).await;

    h.broker.publish(TOPIC, PAYLOAD).await.unwrap();
    wait_for("first ack", || h.broker.acked() == 1).await;
    h.broker.publish(TOPIC, PAYLOAD).await.unwrap();
    wait_for("second ack", || h.broker.acked() == 2).await;

    assert_eq!(engine.submit_calls(), 1);
    assert_eq!(h.dispatcher.registry().len(), 1);
    assert_eq!(h.sink.count("duplicate_suppressed"), 1);
    // Metadata upserts are idempotent: the second apply changed nothing.
    assert_eq!(h.store.writes(), 1);

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_duplicates_submit_once() {
    // An engine that would happily start a second run.
    let engine = Arc::new(MemoryWorkflowEngine::without_idempotent_submit());
    let h = harness(engine.clone(), Arc::new(RunRegistry::new(3)));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let dispatcher = h.dispatcher.clone();
        handles.push(tokio::spawn(async move {
            dispatcher.process(Delivery::detached(TOPIC, PAYLOAD.to_vec())).await
        }));
    }
    let mut skipped = 0;
    for handle in handles {
        let report = handle.await.unwrap();
        if report.events[0].skipped() {
            skipped += 1;
        }
    }

    assert_eq!(engine.submit_calls(), 1);
    assert_eq!(engine.run_count(), 1);
    assert_eq!(skipped, 15);
}

#[tokio::test]
async fn transient_failures_within_budget_complete() {
    let engine = Arc::new(MemoryWorkflowEngine::new());
    engine.fail_next_submits([
        TriggerError::Unavailable("502 bad gateway".into()),
        TriggerError::Timeout(Duration::from_secs(15)),
    ]);
    let h = harness(engine.clone(), Arc::new(RunRegistry::new(3)));
    h.store
        .fail_next([MetadataError::Unavailable("fuseki restarting".into())]);

    let report = h
        .dispatcher
        .process(Delivery::detached(TOPIC, PAYLOAD.to_vec()))
        .await;

    let outcome = &report.events[0];
    assert_eq!(outcome.last_stage(), Some(Stage::Completed));
    assert_eq!(outcome.run_state, Some(RunState::Submitted));
    let run = only_run(&h);
    assert_eq!(run.attempts, 3);
    assert!(run.last_error.is_none());
    assert_eq!(engine.submit_calls(), 3);
    assert_eq!(h.store.upsert_calls(), 2);
    assert_eq!(h.sink.count("run_abandoned"), 0);
}

#[tokio::test]
async fn exhausted_budget_abandons_with_one_escalation() {
    let engine = Arc::new(MemoryWorkflowEngine::new());
    engine.fail_next_submits((0..3).map(|_| TriggerError::Unavailable("engine down".into())));

    let status_broker = MemoryBroker::new();
    let (stop_tx, stop_rx) = watch::channel(false);
    let (broker_sink, publisher) =
        spawn_status_publisher(Arc::new(status_broker.clone()), "/parameter/status", stop_rx);
    let h = harness_with_hub(
        engine.clone(),
        Arc::new(RunRegistry::new(3)),
        NotificationHub::new().with_sink(broker_sink),
    );

    let report = h
        .dispatcher
        .process(Delivery::detached(TOPIC, PAYLOAD.to_vec()))
        .await;

    assert_eq!(report.events[0].last_stage(), Some(Stage::Failed));
    let run = only_run(&h);
    assert_eq!(run.state, RunState::Abandoned);
    assert_eq!(run.attempts, 3);
    assert_eq!(engine.submit_calls(), 3);
    assert_eq!(h.sink.count("run_abandoned"), 1);

    // Sweeps and late statuses do not escalate again.
    let swept = h.dispatcher.sweep(
        chrono::Utc::now() + chrono::Duration::days(1),
        chrono::Duration::hours(1),
        chrono::Duration::days(30),
    );
    assert_eq!(swept.abandoned, 0);
    assert!(h
        .dispatcher
        .apply_status(&WorkflowRef::new("mem-0001"), RunStatus::Failed { reason: "late".into() })
        .await
        .unwrap()
        .is_none());
    assert_eq!(h.sink.count("run_abandoned"), 1);

    stop_tx.send(true).unwrap();
    publisher.await.unwrap();
    let abandoned: Vec<_> = status_broker
        .published_matching("/parameter/status/01234")
        .into_iter()
        .filter(|(_, body)| String::from_utf8_lossy(body).contains("\"run_abandoned\""))
        .collect();
    assert_eq!(abandoned.len(), 1);
}

#[tokio::test]
async fn bad_messages_are_dropped_and_acked() {
    let engine = Arc::new(MemoryWorkflowEngine::new());
    let h = harness(engine.clone(), Arc::new(RunRegistry::new(3)));
    let relay = start(
        &h,
        RelayOptions {
            topics: vec!["/+/update/+".to_string()],
            ..options()
        },
    )
    .await;

    h.broker.publish("/geometry/update/7", br#"{"Thickness":"2"}"#).await.unwrap();
    h.broker.publish(TOPIC, b"[1, 2, 3]").await.unwrap();
    h.broker.publish(TOPIC, br#"{"MajorRadius":{"nested":true}}"#).await.unwrap();
    wait_for("three acks", || h.broker.acked() == 3).await;

    assert_eq!(h.sink.count("event_dropped"), 3);
    assert!(h.dispatcher.registry().is_empty());
    assert_eq!(engine.submit_calls(), 0);
    assert_eq!(h.store.upsert_calls(), 0);

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn multi_parameter_payload_fans_out() {
    let engine = Arc::new(MemoryWorkflowEngine::new());
    let h = harness(engine.clone(), Arc::new(RunRegistry::new(3)));

    let report = h
        .dispatcher
        .process(Delivery::detached(TOPIC, br#"{"MajorRadius":8.5,"Elongation":"1.7"}"#.to_vec()))
        .await;

    let names: Vec<&str> = report.events.iter().map(|e| e.parameter_name.as_str()).collect();
    assert_eq!(names, vec!["Elongation", "MajorRadius"]);
    assert_eq!(engine.run_count(), 2);
    assert_eq!(h.store.get("01234", "MajorRadius").await.unwrap().as_deref(), Some("8.5"));
}

/// Accepts submissions but never answers.
struct StuckEngine;

#[async_trait]
impl WorkflowEngine for StuckEngine {
    async fn submit(
        &self,
        _key: &IdempotencyKey,
        _parameters: &BTreeMap<String, String>,
    ) -> Result<WorkflowRef, TriggerError> {
        std::future::pending().await
    }

    async fn poll(&self, workflow_ref: &WorkflowRef) -> Result<RunStatus, TriggerError> {
        Err(TriggerError::UnknownRun(workflow_ref.clone()))
    }

    async fn list_runs(&self) -> Result<Vec<EngineRun>, TriggerError> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "stuck"
    }
}

#[tokio::test]
async fn interrupted_delivery_is_redelivered_after_restart() {
    let registry = Arc::new(RunRegistry::new(3));

    // First life: the engine hangs and shutdown aborts the delivery.
    let stuck = harness(Arc::new(StuckEngine), registry.clone());
    let relay = start(
        &stuck,
        RelayOptions {
            shutdown_grace: Duration::from_millis(50),
            ..options()
        },
    )
    .await;
    stuck.broker.publish(TOPIC, PAYLOAD).await.unwrap();
    wait_for("pending run", || registry.len() == 1).await;
    relay.shutdown().await.unwrap();

    assert_eq!(stuck.broker.acked(), 0);
    assert_eq!(stuck.broker.in_flight(), 1);
    assert_eq!(only_run(&stuck).state, RunState::Pending);

    // Second life: a healthy engine without key deduplication, same broker
    // and registry.
    let engine = Arc::new(MemoryWorkflowEngine::without_idempotent_submit());
    let mut healthy = harness(engine.clone(), registry.clone());
    healthy.broker = stuck.broker.clone();
    let relay = start(
        &healthy,
        RelayOptions {
            reconcile_on_start: true,
            ..options()
        },
    )
    .await;
    // The engine never saw the run, so reconciliation gives up on it...
    assert_eq!(only_run(&healthy).state, RunState::Abandoned);

    // ...and the redelivered message starts it afresh.
    assert_eq!(healthy.broker.redeliver_unacked(), 1);
    wait_for("ack", || healthy.broker.acked() == 1).await;
    let run = only_run(&healthy);
    assert_eq!(run.state, RunState::Submitted);
    assert_eq!(run.attempts, 1);
    assert_eq!(engine.submit_calls(), 1);

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn persisted_runs_survive_restart() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(MemoryWorkflowEngine::new());

    let first = harness(
        engine.clone(),
        Arc::new(RunRegistry::load(RunStore::new(dir.path()).unwrap(), 3).unwrap()),
    );
    first
        .dispatcher
        .process(Delivery::detached(TOPIC, PAYLOAD.to_vec()))
        .await;
    let before = only_run(&first);

    let second = harness(
        engine.clone(),
        Arc::new(RunRegistry::load(RunStore::new(dir.path()).unwrap(), 3).unwrap()),
    );
    assert_eq!(only_run(&second), before);

    let report = second
        .dispatcher
        .process(Delivery::detached(TOPIC, PAYLOAD.to_vec()))
        .await;
    assert!(report.events[0].skipped());
    assert_eq!(engine.submit_calls(), 1);

    // A completion for the restored handle still lands.
    let workflow_ref = before.workflow_ref.unwrap();
    second
        .dispatcher
        .apply_status(&workflow_ref, RunStatus::Succeeded)
        .await
        .unwrap();
    assert_eq!(only_run(&second).state, RunState::Succeeded);
}
