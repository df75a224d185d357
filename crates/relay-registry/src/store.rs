// store.rs - RunStore: persistence for WorkflowRun records.
//
// Each run is stored as a JSON file: `<state_dir>/<idempotency_key>.json`.
// Keys are hex digests, so they are safe file names. The registry writes
// through on every change and reloads the directory on restart.

use std::fs;
use std::path::{Path, PathBuf};

use relay_core::IdempotencyKey;

use crate::error::RegistryError;
use crate::run::{RunState, WorkflowRun};

pub struct RunStore {
    state_dir: PathBuf,
}

impl RunStore {
    /// Create a store backed by the given directory, creating it if needed.
    pub fn new(state_dir: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let state_dir = state_dir.as_ref().to_path_buf();
        fs::create_dir_all(&state_dir).map_err(|source| RegistryError::IoError {
            path: state_dir.display().to_string(),
            source,
        })?;
        Ok(Self { state_dir })
    }

    pub fn dir(&self) -> &Path {
        &self.state_dir
    }

    /// Save a run (creates or overwrites).
    ///
    /// Writes to a temporary file and renames it into place so a crash never
    /// leaves a half-written record.
    pub fn save(&self, run: &WorkflowRun) -> Result<(), RegistryError> {
        let path = self.run_file(&run.idempotency_key);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(run)?;
        fs::write(&tmp, json).map_err(|source| RegistryError::IoError {
            path: tmp.display().to_string(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| RegistryError::IoError {
            path: path.display().to_string(),
            source,
        })?;
        Ok(())
    }

    pub fn get(&self, key: &IdempotencyKey) -> Result<Option<WorkflowRun>, RegistryError> {
        let path = self.run_file(key);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path).map_err(|source| RegistryError::IoError {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// List all runs, newest first. Unreadable files are skipped with a warning.
    pub fn list(&self) -> Result<Vec<WorkflowRun>, RegistryError> {
        let mut runs = Vec::new();

        let entries = fs::read_dir(&self.state_dir).map_err(|source| RegistryError::IoError {
            path: self.state_dir.display().to_string(),
            source,
        })?;

        for entry in entries {
            let entry = entry.map_err(|source| RegistryError::IoError {
                path: self.state_dir.display().to_string(),
                source,
            })?;
            let path = entry.path();

            if path.extension().is_some_and(|ext| ext == "json") {
                let json = fs::read_to_string(&path).map_err(|source| RegistryError::IoError {
                    path: path.display().to_string(),
                    source,
                })?;
                match serde_json::from_str::<WorkflowRun>(&json) {
                    Ok(run) => runs.push(run),
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable run file"),
                }
            }
        }

        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    pub fn list_by_state(&self, state: RunState) -> Result<Vec<WorkflowRun>, RegistryError> {
        Ok(self.list()?.into_iter().filter(|r| r.state == state).collect())
    }

    /// Delete a run. Returns false if it was not stored.
    pub fn delete(&self, key: &IdempotencyKey) -> Result<bool, RegistryError> {
        let path = self.run_file(key);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|source| RegistryError::IoError {
            path: path.display().to_string(),
            source,
        })?;
        Ok(true)
    }

    fn run_file(&self, key: &IdempotencyKey) -> PathBuf {
        self.state_dir.join(format!("{}.json", key))
    }
}
