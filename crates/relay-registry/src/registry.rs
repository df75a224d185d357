// registry.rs - RunRegistry: in-flight and completed runs keyed by idempotency key.
//
// Runs live in a sharded concurrent map, so operations on one key lock only
// that key's shard and different keys proceed in parallel. A second map
// indexes runs by the engine's workflow handle for completion lookups.
//
// When a RunStore is attached every change is written through. A failed
// write is logged and the in-memory state stays authoritative.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relay_core::IdempotencyKey;
use relay_workflow::WorkflowRef;

use crate::error::RegistryError;
use crate::run::{RunSeed, RunState, WorkflowRun};
use crate::store::RunStore;

pub struct RunRegistry {
    runs: DashMap<IdempotencyKey, WorkflowRun>,
    refs: DashMap<WorkflowRef, IdempotencyKey>,
    store: Option<Arc<RunStore>>,
    /// Submissions allowed per run before a failure abandons it.
    max_submissions: u32,
}

impl RunRegistry {
    /// An in-memory registry.
    pub fn new(max_submissions: u32) -> Self {
        Self {
            runs: DashMap::new(),
            refs: DashMap::new(),
            store: None,
            max_submissions: max_submissions.max(1),
        }
    }

    /// A registry restored from `store`, writing through to it from now on.
    pub fn load(store: RunStore, max_submissions: u32) -> Result<Self, RegistryError> {
        let mut registry = Self::new(max_submissions);
        for run in store.list()? {
            if let Some(r) = &run.workflow_ref {
                registry.refs.insert(r.clone(), run.idempotency_key.clone());
            }
            registry.runs.insert(run.idempotency_key.clone(), run);
        }
        tracing::info!(runs = registry.runs.len(), dir = %store.dir().display(), "run registry loaded");
        registry.store = Some(Arc::new(store));
        Ok(registry)
    }

    pub fn max_submissions(&self) -> u32 {
        self.max_submissions
    }

    /// Whether a failed run may be resubmitted automatically.
    pub fn has_budget(&self, run: &WorkflowRun) -> bool {
        run.attempts < self.max_submissions
    }

    /// Record a Pending run for the seed's key unless a non-abandoned run
    /// already exists. Returns true when this call created the run.
    ///
    /// The check and the insert happen under the key's shard lock, so of
    /// any number of concurrent callers with the same key exactly one wins.
    pub fn try_begin(&self, seed: RunSeed) -> bool {
        let key = seed.idempotency_key.clone();
        let created = match self.runs.entry(key.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().state != RunState::Abandoned {
                    false
                } else {
                    if let Some(old_ref) = existing.get().workflow_ref.clone() {
                        self.refs.remove(&old_ref);
                    }
                    let run = WorkflowRun::new(seed);
                    self.persist(&run);
                    existing.insert(run);
                    true
                }
            }
            Entry::Vacant(slot) => {
                let run = WorkflowRun::new(seed);
                self.persist(&run);
                slot.insert(run);
                true
            }
        };
        if created {
            tracing::debug!(key = %key.short(), "run pending");
        }
        created
    }

    /// Move a run to `next`, enforcing the lifecycle and the resubmission
    /// budget. Returns the updated run.
    pub fn transition(&self, key: &IdempotencyKey, next: RunState) -> Result<WorkflowRun, RegistryError> {
        self.update(key, |run| {
            if run.state == RunState::Failed && next == RunState::Pending && run.attempts >= self.max_submissions {
                return Err(RegistryError::BudgetExhausted {
                    key: key.clone(),
                    attempts: run.attempts,
                });
            }
            run.transition(next)
        })
    }

    /// Transition to Failed and record why.
    pub fn fail(&self, key: &IdempotencyKey, reason: &str) -> Result<WorkflowRun, RegistryError> {
        self.update(key, |run| {
            run.transition(RunState::Failed)?;
            run.last_error = Some(reason.to_string());
            Ok(())
        })
    }

    /// Transition to Abandoned and record why.
    pub fn abandon(&self, key: &IdempotencyKey, reason: &str) -> Result<WorkflowRun, RegistryError> {
        self.update(key, |run| {
            run.transition(RunState::Abandoned)?;
            run.last_error = Some(reason.to_string());
            Ok(())
        })
    }

    /// Record the engine handle of the run's latest submission.
    pub fn attach_ref(&self, key: &IdempotencyKey, workflow_ref: WorkflowRef) -> Result<WorkflowRun, RegistryError> {
        let updated = self.update(key, |run| {
            run.workflow_ref = Some(workflow_ref.clone());
            run.updated_at = Utc::now();
            Ok(())
        })?;
        self.refs.insert(workflow_ref, key.clone());
        Ok(updated)
    }

    /// Pending → Submitted and attach the handle in one step, so a
    /// completion can never find a run by ref before it is Submitted.
    pub fn record_submission(
        &self,
        key: &IdempotencyKey,
        workflow_ref: WorkflowRef,
    ) -> Result<WorkflowRun, RegistryError> {
        let updated = self.update(key, |run| {
            run.transition(RunState::Submitted)?;
            run.workflow_ref = Some(workflow_ref.clone());
            run.last_error = None;
            Ok(())
        })?;
        self.refs.insert(workflow_ref, key.clone());
        Ok(updated)
    }

    pub fn lookup_by_ref(&self, workflow_ref: &WorkflowRef) -> Option<WorkflowRun> {
        let key = self.refs.get(workflow_ref)?.value().clone();
        let run = self.get(&key)?;
        // A resubmission replaces the handle; stale refs no longer resolve.
        (run.workflow_ref.as_ref() == Some(workflow_ref)).then_some(run)
    }

    pub fn get(&self, key: &IdempotencyKey) -> Option<WorkflowRun> {
        self.runs.get(key).map(|r| r.value().clone())
    }

    /// All runs, newest first.
    pub fn list(&self) -> Vec<WorkflowRun> {
        let mut runs: Vec<WorkflowRun> = self.runs.iter().map(|r| r.value().clone()).collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    pub fn non_terminal(&self) -> Vec<WorkflowRun> {
        self.list().into_iter().filter(|r| !r.state.is_terminal()).collect()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Operator override: put a Failed or Abandoned run back to Pending with
    /// a fresh submission budget.
    pub fn operator_retry(&self, key: &IdempotencyKey) -> Result<WorkflowRun, RegistryError> {
        let updated = self.update(key, |run| {
            if !matches!(run.state, RunState::Failed | RunState::Abandoned) {
                return Err(RegistryError::InvalidTransition {
                    key: key.clone(),
                    from: run.state.to_string(),
                    to: RunState::Pending.to_string(),
                });
            }
            if let Some(old) = run.workflow_ref.take() {
                self.refs.remove(&old);
            }
            run.state = RunState::Pending;
            run.attempts = 0;
            run.updated_at = Utc::now();
            Ok(())
        })?;
        tracing::info!(key = %key.short(), "operator retry: run reset to pending");
        Ok(updated)
    }

    /// Abandon Submitted/Running runs that have not changed for `staleness`.
    /// Returns the abandoned runs.
    pub fn sweep_stale(&self, now: DateTime<Utc>, staleness: Duration) -> Vec<WorkflowRun> {
        let cutoff = now - staleness;
        let stale: Vec<IdempotencyKey> = self
            .runs
            .iter()
            .filter(|r| r.state.is_in_flight() && r.updated_at < cutoff)
            .map(|r| r.key().clone())
            .collect();

        let mut abandoned = Vec::new();
        for key in stale {
            let result = self.update(&key, |run| {
                // Re-check under the lock: a completion may have landed.
                if !(run.state.is_in_flight() && run.updated_at < cutoff) {
                    return Err(RegistryError::InvalidTransition {
                        key: key.clone(),
                        from: run.state.to_string(),
                        to: RunState::Abandoned.to_string(),
                    });
                }
                run.transition(RunState::Abandoned)?;
                run.last_error = Some(format!("no progress for {}s", staleness.num_seconds()));
                Ok(())
            });
            if let Ok(run) = result {
                tracing::warn!(key = %key.short(), "stale run abandoned");
                abandoned.push(run);
            }
        }
        abandoned
    }

    /// Drop terminal runs last updated before `now - retention`.
    /// Returns how many were removed.
    pub fn collect_garbage(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let cutoff = now - retention;
        let expired = |run: &WorkflowRun| run.state.is_terminal() && run.updated_at < cutoff;
        let candidates: Vec<IdempotencyKey> = self
            .runs
            .iter()
            .filter(|r| expired(r.value()))
            .map(|r| r.key().clone())
            .collect();

        let mut removed = 0;
        for key in candidates {
            if let Some((_, run)) = self.runs.remove_if(&key, |_, run| expired(run)) {
                if let Some(r) = &run.workflow_ref {
                    self.refs.remove(r);
                }
                if let Some(store) = &self.store {
                    if let Err(e) = store.delete(&key) {
                        tracing::error!(key = %key.short(), error = %e, "failed to delete run file");
                    }
                }
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "garbage-collected terminal runs");
        }
        removed
    }

    /// Apply `f` to the run under its shard lock and write through on success.
    fn update<F>(&self, key: &IdempotencyKey, f: F) -> Result<WorkflowRun, RegistryError>
    where
        F: FnOnce(&mut WorkflowRun) -> Result<(), RegistryError>,
    {
        let mut entry = self
            .runs
            .get_mut(key)
            .ok_or_else(|| RegistryError::NotFound(key.clone()))?;
        let mut draft = entry.value().clone();
        f(&mut draft)?;
        self.persist(&draft);
        *entry.value_mut() = draft.clone();
        Ok(draft)
    }

    fn persist(&self, run: &WorkflowRun) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(run) {
                tracing::error!(key = %run.idempotency_key.short(), error = %e, "failed to persist run");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{EventKind, ResourceTopic};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn seed(value: &str) -> RunSeed {
        let topic = ResourceTopic {
            class: "parameter".into(),
            kind: EventKind::Update,
            resource_id: "01234".into(),
        };
        RunSeed {
            idempotency_key: IdempotencyKey::derive(&topic, "MajorRadius", value, 0),
            resource_id: "01234".into(),
            parameter_name: "MajorRadius".into(),
            parameter_value: value.into(),
            workflow_parameters: BTreeMap::from([("MajorRadius".to_string(), value.to_string())]),
        }
    }

    #[test]
    fn try_begin_once_per_key() {
        let registry = RunRegistry::new(3);
        assert!(registry.try_begin(seed("8.5")));
        assert!(!registry.try_begin(seed("8.5")));
        assert!(registry.try_begin(seed("9.0")));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn concurrent_try_begin_has_one_winner() {
        let registry = Arc::new(RunRegistry::new(3));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.try_begin(seed("8.5")))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn abandoned_run_frees_the_key() {
        let registry = RunRegistry::new(3);
        let key = seed("8.5").idempotency_key;
        registry.try_begin(seed("8.5"));
        registry.abandon(&key, "gave up").unwrap();
        assert!(registry.try_begin(seed("8.5")));
        let run = registry.get(&key).unwrap();
        assert_eq!(run.state, RunState::Pending);
        assert_eq!(run.attempts, 0);
    }

    #[test]
    fn succeeded_run_still_blocks_duplicates() {
        let registry = RunRegistry::new(3);
        let key = seed("8.5").idempotency_key;
        registry.try_begin(seed("8.5"));
        registry.transition(&key, RunState::Submitted).unwrap();
        registry.transition(&key, RunState::Running).unwrap();
        registry.transition(&key, RunState::Succeeded).unwrap();
        assert!(!registry.try_begin(seed("8.5")));
    }

    #[test]
    fn resubmission_budget_enforced() {
        let registry = RunRegistry::new(2);
        let key = seed("8.5").idempotency_key;
        registry.try_begin(seed("8.5"));

        registry.fail(&key, "engine 503").unwrap();
        registry.transition(&key, RunState::Pending).unwrap();
        let run = registry.fail(&key, "engine 503").unwrap();
        assert_eq!(run.attempts, 2);
        assert!(!registry.has_budget(&run));
        assert_eq!(run.last_error.as_deref(), Some("engine 503"));

        let err = registry.transition(&key, RunState::Pending).unwrap_err();
        assert!(matches!(err, RegistryError::BudgetExhausted { attempts: 2, .. }));
        assert_eq!(registry.get(&key).unwrap().state, RunState::Failed);
    }

    #[test]
    fn operator_retry_resets_budget() {
        let registry = RunRegistry::new(1);
        let key = seed("8.5").idempotency_key;
        registry.try_begin(seed("8.5"));
        registry.fail(&key, "x").unwrap();
        registry.abandon(&key, "budget").unwrap();

        let run = registry.operator_retry(&key).unwrap();
        assert_eq!(run.state, RunState::Pending);
        assert_eq!(run.attempts, 0);

        // Only failed or abandoned runs can be retried.
        assert!(matches!(
            registry.operator_retry(&key),
            Err(RegistryError::InvalidTransition { .. })
        ));
        assert!(matches!(
            registry.operator_retry(&seed("1").idempotency_key),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn refs_follow_the_latest_submission() {
        let registry = RunRegistry::new(3);
        let key = seed("8.5").idempotency_key;
        registry.try_begin(seed("8.5"));
        registry.transition(&key, RunState::Submitted).unwrap();
        registry.attach_ref(&key, WorkflowRef::new("inv-1")).unwrap();
        assert_eq!(
            registry.lookup_by_ref(&WorkflowRef::new("inv-1")).unwrap().idempotency_key,
            key
        );

        registry.fail(&key, "x").unwrap();
        registry.transition(&key, RunState::Pending).unwrap();
        registry.transition(&key, RunState::Submitted).unwrap();
        registry.attach_ref(&key, WorkflowRef::new("inv-2")).unwrap();
        assert!(registry.lookup_by_ref(&WorkflowRef::new("inv-1")).is_none());
        assert!(registry.lookup_by_ref(&WorkflowRef::new("inv-2")).is_some());
    }

    #[test]
    fn record_submission_is_one_step() {
        let registry = RunRegistry::new(3);
        let key = seed("8.5").idempotency_key;
        registry.try_begin(seed("8.5"));
        let run = registry.record_submission(&key, WorkflowRef::new("inv-3")).unwrap();
        assert_eq!(run.state, RunState::Submitted);
        assert_eq!(run.attempts, 1);
        assert_eq!(
            registry.lookup_by_ref(&WorkflowRef::new("inv-3")).unwrap().state,
            RunState::Submitted
        );
        // Submitting twice is not a valid lifecycle step.
        assert!(registry.record_submission(&key, WorkflowRef::new("inv-4")).is_err());
    }

    #[test]
    fn sweep_abandons_only_stale_in_flight_runs() {
        let registry = RunRegistry::new(3);
        let stale = seed("1").idempotency_key;
        let pending = seed("2").idempotency_key;
        registry.try_begin(seed("1"));
        registry.try_begin(seed("2"));
        registry.transition(&stale, RunState::Submitted).unwrap();

        let later = Utc::now() + Duration::seconds(600);
        let abandoned = registry.sweep_stale(later, Duration::seconds(300));
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].idempotency_key, stale);
        assert_eq!(registry.get(&stale).unwrap().state, RunState::Abandoned);
        assert_eq!(registry.get(&pending).unwrap().state, RunState::Pending);

        assert!(registry.sweep_stale(Utc::now(), Duration::seconds(300)).is_empty());
    }

    #[test]
    fn garbage_collection_keeps_recent_and_live_runs() {
        let registry = RunRegistry::new(3);
        let done = seed("1").idempotency_key;
        registry.try_begin(seed("1"));
        registry.try_begin(seed("2"));
        registry.abandon(&done, "x").unwrap();

        assert_eq!(registry.collect_garbage(Utc::now(), Duration::hours(1)), 0);
        let later = Utc::now() + Duration::hours(2);
        assert_eq!(registry.collect_garbage(later, Duration::hours(1)), 1);
        assert!(registry.get(&done).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn write_through_and_reload() {
        let dir = tempdir().unwrap();
        let key = seed("8.5").idempotency_key;
        {
            let registry = RunRegistry::load(RunStore::new(dir.path()).unwrap(), 3).unwrap();
            registry.try_begin(seed("8.5"));
            registry.transition(&key, RunState::Submitted).unwrap();
            registry.attach_ref(&key, WorkflowRef::new("inv-9")).unwrap();
        }
        let registry = RunRegistry::load(RunStore::new(dir.path()).unwrap(), 3).unwrap();
        let run = registry.get(&key).unwrap();
        assert_eq!(run.state, RunState::Submitted);
        assert_eq!(run.attempts, 1);
        assert!(registry.lookup_by_ref(&WorkflowRef::new("inv-9")).is_some());
        assert!(!registry.try_begin(seed("8.5")));
    }
}
