// completion.rs - Getting run completions into the dispatcher.
//
// Push mode: engine callbacks (HTTP, or an in-process engine) send
// StatusNotices into a channel drained by one consumer task. Notices are
// applied in arrival order.
// Poll mode: a poller asks the engine about every in-flight run on an
// interval.
// Both record the status through Dispatcher::record_status; resubmissions
// of failed runs run as separate tasks.

use std::sync::Arc;
use std::time::Duration;

use relay_registry::{RunState, WorkflowRun};
use relay_workflow::{StatusNotice, TriggerError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::dispatcher::{Dispatcher, StatusChange};
use crate::error::DispatchError;

/// Cloneable handle for pushing status notices.
#[derive(Clone)]
pub struct CompletionSender {
    tx: mpsc::UnboundedSender<StatusNotice>,
}

impl CompletionSender {
    pub fn send(&self, notice: StatusNotice) -> Result<(), DispatchError> {
        self.tx.send(notice).map_err(|_| DispatchError::ShuttingDown)
    }

    /// The raw channel end, for engines that push notices themselves.
    pub fn sender(&self) -> mpsc::UnboundedSender<StatusNotice> {
        self.tx.clone()
    }
}

pub fn completion_channel() -> (CompletionSender, mpsc::UnboundedReceiver<StatusNotice>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CompletionSender { tx }, rx)
}

/// Apply pushed notices until the channel closes or shutdown is signalled.
///
/// Transitions are applied inline, in arrival order. Resubmitting a failed
/// run waits out a backoff and calls the engine, so it runs as its own task
/// and never holds up notices for other runs.
pub async fn consume_completions(
    dispatcher: Arc<Dispatcher>,
    mut rx: mpsc::UnboundedReceiver<StatusNotice>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut resubmits = JoinSet::new();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(joined) = resubmits.join_next(), if !resubmits.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "resubmission task failed");
                }
            }
            notice = rx.recv() => {
                let Some(notice) = notice else { break };
                match dispatcher.record_status(&notice.workflow_ref, notice.status) {
                    Ok(StatusChange::Failed(failed)) => spawn_resubmit(&dispatcher, failed, &mut resubmits),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(workflow_ref = %notice.workflow_ref, error = %e, "failed to apply pushed status");
                    }
                }
            }
        }
    }
    // Bounded by the relay's shutdown grace; an aborted resubmission leaves
    // the run Failed for the reconciler.
    while resubmits.join_next().await.is_some() {}
    tracing::debug!("completion consumer stopped");
}

fn spawn_resubmit(dispatcher: &Arc<Dispatcher>, failed: WorkflowRun, tasks: &mut JoinSet<()>) {
    let dispatcher = dispatcher.clone();
    tasks.spawn(async move {
        if let Err(e) = dispatcher.resubmit_failed(&failed).await {
            tracing::error!(key = %failed.idempotency_key.short(), error = %e, "resubmission failed");
        }
    });
}

/// Poll every in-flight run once. Returns how many runs changed state.
///
/// Runs the engine failed are handed to `resubmits` rather than resubmitted
/// inline.
pub async fn poll_in_flight(dispatcher: &Arc<Dispatcher>, resubmits: &mut JoinSet<()>) -> usize {
    let in_flight: Vec<_> = dispatcher
        .registry()
        .list()
        .into_iter()
        .filter(|run| run.state.is_in_flight())
        .collect();

    let mut changed = 0;
    for run in in_flight {
        let Some(workflow_ref) = run.workflow_ref.clone() else {
            continue;
        };
        let key = run.idempotency_key.clone();
        match dispatcher.trigger().poll(&workflow_ref).await {
            Ok(status) => match dispatcher.record_status(&workflow_ref, status) {
                Ok(StatusChange::Moved(_)) => changed += 1,
                Ok(StatusChange::Failed(failed)) => {
                    changed += 1;
                    spawn_resubmit(dispatcher, failed, resubmits);
                }
                Ok(StatusChange::Ignored(_)) => {}
                Err(e) => tracing::error!(key = %key.short(), error = %e, "failed to apply polled status"),
            },
            Err(TriggerError::UnknownRun(_)) => {
                tracing::warn!(key = %key.short(), %workflow_ref, "engine has no record of run");
                match dispatcher.abandon(&key, "workflow engine has no record of the run") {
                    Ok(updated) if updated.state == RunState::Abandoned => changed += 1,
                    Ok(_) => {}
                    Err(e) => tracing::error!(key = %key.short(), error = %e, "failed to abandon run"),
                }
            }
            // Try again next round.
            Err(e) => tracing::warn!(key = %key.short(), %workflow_ref, error = %e, "poll failed"),
        }
    }
    changed
}

/// Run poll_in_flight on an interval until shutdown.
pub async fn run_poller(dispatcher: Arc<Dispatcher>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut resubmits = JoinSet::new();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(joined) = resubmits.join_next(), if !resubmits.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "resubmission task failed");
                }
            }
            _ = ticker.tick() => {
                let changed = poll_in_flight(&dispatcher, &mut resubmits).await;
                if changed > 0 {
                    tracing::debug!(changed, "poll round applied status changes");
                }
            }
        }
    }
    while resubmits.join_next().await.is_some() {}
    tracing::debug!("poller stopped");
}
