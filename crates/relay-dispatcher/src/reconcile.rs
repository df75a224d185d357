// reconcile.rs - Bringing the registry back in line with the outside world.
//
// On startup the engine's run list is authoritative for run status. The
// metadata store is authoritative for triples: a missing triple is
// re-applied, a differing one is left alone because it was written by a
// newer update. In the background, stale in-flight runs are abandoned and
// old terminal runs are garbage-collected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_core::IdempotencyKey;
use relay_metadata::MetadataMutation;
use relay_registry::{RelayEvent, RunState, WorkflowRun};
use relay_workflow::{EngineRun, RunStatus, TriggerError, WorkflowRef};
use serde::Serialize;
use tokio::sync::watch;

use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;

/// Counts from one reconciliation or sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Pending runs matched to an engine run submitted before a crash.
    pub adopted: usize,
    /// Runs whose state was updated from the engine.
    pub updated: usize,
    /// Runs submitted again.
    pub resubmitted: usize,
    pub abandoned: usize,
    /// Triples re-applied because the store had lost them.
    pub metadata_repaired: usize,
    /// Terminal runs removed.
    pub collected: usize,
}

impl Dispatcher {
    /// Compare every non-terminal run against the engine's run list.
    ///
    /// - Pending without a handle: adopt the engine's run for the key if it
    ///   has one. Otherwise submit again when the engine deduplicates on the
    ///   key, or abandon so the redelivered message can start over.
    /// - Submitted/Running: take the engine's status; abandon if the engine
    ///   does not know the run.
    /// - Failed: resubmit within budget, otherwise abandon.
    pub async fn reconcile_with_engine(&self) -> Result<ReconcileReport, DispatchError> {
        let engine_runs = self.trigger().list_runs().await?;
        let by_ref: HashMap<&WorkflowRef, &EngineRun> =
            engine_runs.iter().map(|r| (&r.workflow_ref, r)).collect();
        let mut by_key: HashMap<&IdempotencyKey, &EngineRun> = HashMap::new();
        for run in &engine_runs {
            if let Some(key) = &run.idempotency_key {
                // A failed earlier attempt must not shadow a live one.
                let replace = by_key
                    .get(key)
                    .map_or(true, |seen| matches!(seen.status, RunStatus::Failed { .. }));
                if replace {
                    by_key.insert(key, run);
                }
            }
        }

        let mut report = ReconcileReport::default();
        for run in self.registry().non_terminal() {
            let key = run.idempotency_key.clone();
            let before = run.state;
            let result = match run.state {
                RunState::Pending => self.reconcile_pending(&run, by_key.get(&key).copied(), &mut report).await,
                RunState::Submitted | RunState::Running => {
                    self.reconcile_in_flight(&run, &by_ref, &mut report).await
                }
                RunState::Failed => self.reconcile_failed(&run, &mut report).await,
                RunState::Succeeded | RunState::Abandoned => continue,
            };
            match result {
                Ok(after) => {
                    if after.state == RunState::Abandoned && before != RunState::Abandoned {
                        report.abandoned += 1;
                    }
                    if after.state != RunState::Abandoned && self.repair_metadata(&after).await {
                        report.metadata_repaired += 1;
                    }
                }
                Err(e) => tracing::error!(key = %key.short(), error = %e, "reconciliation failed for run"),
            }
        }

        tracing::info!(
            adopted = report.adopted,
            updated = report.updated,
            resubmitted = report.resubmitted,
            abandoned = report.abandoned,
            metadata_repaired = report.metadata_repaired,
            "reconciled with workflow engine"
        );
        Ok(report)
    }

    async fn reconcile_pending(
        &self,
        run: &WorkflowRun,
        engine_run: Option<&EngineRun>,
        report: &mut ReconcileReport,
    ) -> Result<WorkflowRun, DispatchError> {
        let key = &run.idempotency_key;
        match engine_run {
            Some(found) if !matches!(found.status, RunStatus::Failed { .. }) => {
                let adopted = self.registry().record_submission(key, found.workflow_ref.clone())?;
                self.hub()
                    .emit(RelayEvent::run_submitted(&adopted, &found.workflow_ref));
                tracing::info!(key = %key.short(), workflow_ref = %found.workflow_ref, "adopted engine run");
                report.adopted += 1;
                let updated = self.apply_status(&found.workflow_ref, found.status.clone()).await?;
                Ok(updated.unwrap_or(adopted))
            }
            // Resubmitting is safe: the engine hands back any run it
            // already holds for the key.
            _ if self.trigger().supports_idempotent_submit() => {
                tracing::info!(key = %key.short(), "resubmitting run interrupted before submission");
                report.resubmitted += 1;
                self.submit_run(key).await
            }
            _ => self.abandon(key, "interrupted before submission"),
        }
    }

    async fn reconcile_in_flight(
        &self,
        run: &WorkflowRun,
        by_ref: &HashMap<&WorkflowRef, &EngineRun>,
        report: &mut ReconcileReport,
    ) -> Result<WorkflowRun, DispatchError> {
        let key = &run.idempotency_key;
        let Some(workflow_ref) = run.workflow_ref.clone() else {
            return self.abandon(key, "in-flight run has no workflow handle");
        };

        // The run list may be truncated; ask directly before giving up.
        let status = match by_ref.get(&workflow_ref) {
            Some(found) => found.status.clone(),
            None => match self.trigger().poll(&workflow_ref).await {
                Ok(status) => status,
                Err(TriggerError::UnknownRun(_)) => {
                    return self.abandon(key, "workflow engine has no record of the run");
                }
                Err(e) => return Err(e.into()),
            },
        };

        let updated = self
            .apply_status(&workflow_ref, status)
            .await?
            .unwrap_or_else(|| run.clone());
        if updated.workflow_ref != run.workflow_ref {
            report.resubmitted += 1;
        } else if updated.state != run.state {
            report.updated += 1;
        }
        Ok(updated)
    }

    async fn reconcile_failed(
        &self,
        run: &WorkflowRun,
        report: &mut ReconcileReport,
    ) -> Result<WorkflowRun, DispatchError> {
        let key = &run.idempotency_key;
        if !self.registry().has_budget(run) {
            return self.give_up(key, run);
        }
        self.registry().transition(key, RunState::Pending)?;
        let resubmitted = self.submit_run(key).await?;
        if resubmitted.state == RunState::Submitted {
            report.resubmitted += 1;
        }
        Ok(resubmitted)
    }

    /// Re-apply the run's triple if the store no longer has any object for
    /// it. Returns true when a write was made.
    async fn repair_metadata(&self, run: &WorkflowRun) -> bool {
        match self.metadata().current(&run.resource_id, &run.parameter_name).await {
            Ok(Some(_)) => false,
            Ok(None) => {
                let mutation = MetadataMutation::new(
                    run.resource_id.as_str(),
                    run.parameter_name.as_str(),
                    run.parameter_value.as_str(),
                );
                match self.metadata().apply(&mutation).await {
                    Ok(_) => {
                        tracing::info!(key = %run.idempotency_key.short(), "re-applied missing metadata");
                        true
                    }
                    Err(e) => {
                        tracing::error!(key = %run.idempotency_key.short(), error = %e, "metadata repair failed");
                        false
                    }
                }
            }
            Err(e) => {
                tracing::warn!(key = %run.idempotency_key.short(), error = %e, "metadata check failed");
                false
            }
        }
    }

    /// Abandon stale in-flight runs and drop expired terminal runs.
    pub fn sweep(&self, now: DateTime<Utc>, staleness: chrono::Duration, retention: chrono::Duration) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for run in self.registry().sweep_stale(now, staleness) {
            self.hub().emit(RelayEvent::run_abandoned(&run));
            report.abandoned += 1;
        }
        report.collected = self.registry().collect_garbage(now, retention);
        report
    }
}

/// Sweep settings for the background reconciler.
#[derive(Debug, Clone, Copy)]
pub struct SweepSchedule {
    pub every: Duration,
    pub staleness: chrono::Duration,
    pub retention: chrono::Duration,
}

/// Sweep on an interval until shutdown.
pub async fn run_reconciler(dispatcher: Arc<Dispatcher>, schedule: SweepSchedule, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(schedule.every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let report = dispatcher.sweep(Utc::now(), schedule.staleness, schedule.retention);
                if report.abandoned > 0 || report.collected > 0 {
                    tracing::info!(abandoned = report.abandoned, collected = report.collected, "registry sweep");
                }
            }
        }
    }
    tracing::debug!("reconciler stopped");
}
