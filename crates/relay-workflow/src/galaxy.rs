// galaxy.rs - Galaxy workflow invocations over HTTP.
//
// Galaxy has no idempotent submission; the idempotency key is carried in the
// history name (`relay-{key}`) so reconciliation can match invocations back
// to runs. Invocation listings only carry `history_id`, so list_runs looks
// each history up to read its name.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::IdempotencyKey;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::engine::{EngineRun, RunStatus, WorkflowEngine, WorkflowRef};
use crate::error::TriggerError;

const HISTORY_PREFIX: &str = "relay-";

/// Settings for the `[workflow.galaxy]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalaxyConfig {
    /// Galaxy server base URL, e.g. `https://usegalaxy.example.org`.
    pub url: String,

    /// API key; usually supplied through `RELAY_WORKFLOW_API_KEY`.
    #[serde(default, skip_serializing)]
    pub api_key: String,

    /// Encoded id of the stored workflow to invoke.
    pub workflow_id: String,

    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
}

fn default_http_timeout_ms() -> u64 {
    15_000
}

pub struct GalaxyEngine {
    config: GalaxyConfig,
    http: reqwest::Client,
}

impl GalaxyEngine {
    pub fn new(config: GalaxyConfig) -> Result<Self, TriggerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .build()
            .map_err(|e| TriggerError::ClientSetup(e.to_string()))?;
        Ok(Self { config, http })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/{}", self.config.url.trim_end_matches('/'), path)
    }

    /// History id to name for every history behind `items`.
    async fn history_names(&self, items: &[Value]) -> Result<BTreeMap<String, String>, TriggerError> {
        let mut names = BTreeMap::new();
        for history_id in items
            .iter()
            .filter_map(|item| item.get("history_id").and_then(Value::as_str))
        {
            if names.contains_key(history_id) {
                continue;
            }
            match self.get_json(&format!("histories/{history_id}?keys=id,name")).await {
                Ok(history) => {
                    if let Some(name) = history.get("name").and_then(Value::as_str) {
                        names.insert(history_id.to_string(), name.to_string());
                    }
                }
                // Purged or not visible to this key; the invocation stays unmatched.
                Err(TriggerError::Rejected { status: 403 | 404, .. }) => {
                    tracing::debug!(%history_id, "history not readable, invocation left unmatched");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(names)
    }

    async fn get_json(&self, path: &str) -> Result<Value, TriggerError> {
        let response = self
            .http
            .get(self.endpoint(path))
            .header("x-api-key", &self.config.api_key)
            .send()
            .await?;
        Ok(response.error_for_status()?.json::<Value>().await?)
    }
}

/// Request body for `POST /api/workflows/{id}/invocations`.
pub(crate) fn invocation_body(key: &IdempotencyKey, parameters: &BTreeMap<String, String>) -> Value {
    json!({
        "inputs": parameters,
        "inputs_by": "name",
        "new_history_name": format!("{HISTORY_PREFIX}{key}"),
    })
}

/// The invocation id from a submit response. Galaxy answers with either a
/// single invocation object or an array of them.
pub(crate) fn invocation_id(body: &Value) -> Result<WorkflowRef, TriggerError> {
    let entry = match body {
        Value::Array(items) => items.first(),
        other => Some(other),
    };
    entry
        .and_then(|v| v.get("id"))
        .and_then(Value::as_str)
        .map(WorkflowRef::new)
        .ok_or_else(|| TriggerError::BadResponse("invocation response has no id".into()))
}

/// Map an invocation state plus its job states to a [`RunStatus`].
pub(crate) fn map_status(state: &str, job_states: &BTreeMap<String, u64>) -> RunStatus {
    match state {
        "new" | "ready" | "requires_materialization" => RunStatus::Queued,
        "failed" | "cancelled" | "cancelling" => RunStatus::Failed {
            reason: format!("invocation {state}"),
        },
        _ => {
            let count = |s: &str| job_states.get(s).copied().unwrap_or(0);
            let failed = count("error") + count("failed") + count("deleted");
            if failed > 0 {
                return RunStatus::Failed {
                    reason: format!("{failed} job(s) failed"),
                };
            }
            let total: u64 = job_states.values().sum();
            if total > 0 && count("ok") + count("skipped") == total {
                RunStatus::Succeeded
            } else {
                RunStatus::Running
            }
        }
    }
}

fn job_states(summary: &Value) -> BTreeMap<String, u64> {
    summary
        .get("states")
        .and_then(Value::as_object)
        .map(|states| {
            states
                .iter()
                .filter_map(|(k, v)| v.as_u64().map(|n| (k.clone(), n)))
                .collect()
        })
        .unwrap_or_default()
}

/// Turn invocation summaries into [`EngineRun`]s, taking the idempotency key
/// from the invocation's history name.
pub(crate) fn engine_runs(items: &[Value], history_names: &BTreeMap<String, String>) -> Vec<EngineRun> {
    items
        .iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(Value::as_str)?;
            let state = item.get("state").and_then(Value::as_str).unwrap_or("new");
            let key = item
                .get("history_id")
                .and_then(Value::as_str)
                .and_then(|history_id| history_names.get(history_id))
                .and_then(|name| key_from_history(name));
            Some(EngineRun {
                workflow_ref: WorkflowRef::new(id),
                idempotency_key: key,
                // Job detail is fetched by poll; the listing only has the
                // coarse invocation state.
                status: map_status(state, &BTreeMap::new()),
            })
        })
        .collect()
}

/// Recover the idempotency key from a `relay-{key}` history name.
pub(crate) fn key_from_history(name: &str) -> Option<IdempotencyKey> {
    name.strip_prefix(HISTORY_PREFIX)?.parse().ok()
}

#[async_trait]
impl WorkflowEngine for GalaxyEngine {
    async fn submit(
        &self,
        key: &IdempotencyKey,
        parameters: &BTreeMap<String, String>,
    ) -> Result<WorkflowRef, TriggerError> {
        let path = format!("workflows/{}/invocations", self.config.workflow_id);
        let body = self
            .http
            .post(self.endpoint(&path))
            .header("x-api-key", &self.config.api_key)
            .json(&invocation_body(key, parameters))
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;
        let workflow_ref = invocation_id(&body)?;
        tracing::debug!(key = %key.short(), workflow_ref = %workflow_ref, "galaxy invocation created");
        Ok(workflow_ref)
    }

    async fn poll(&self, workflow_ref: &WorkflowRef) -> Result<RunStatus, TriggerError> {
        let invocation = match self.get_json(&format!("invocations/{workflow_ref}")).await {
            Err(TriggerError::Rejected { status: 404, .. }) => {
                return Err(TriggerError::UnknownRun(workflow_ref.clone()));
            }
            other => other?,
        };
        let state = invocation
            .get("state")
            .and_then(Value::as_str)
            .ok_or_else(|| TriggerError::BadResponse("invocation has no state".into()))?;
        if state != "scheduled" {
            return Ok(map_status(state, &BTreeMap::new()));
        }
        let summary = self
            .get_json(&format!("invocations/{workflow_ref}/jobs_summary"))
            .await?;
        Ok(map_status(state, &job_states(&summary)))
    }

    async fn list_runs(&self) -> Result<Vec<EngineRun>, TriggerError> {
        let listing = self
            .get_json(&format!(
                "invocations?workflow_id={}&view=element",
                self.config.workflow_id
            ))
            .await?;
        let items = listing
            .as_array()
            .ok_or_else(|| TriggerError::BadResponse("invocation list is not an array".into()))?;
        let names = self.history_names(items).await?;
        Ok(engine_runs(items, &names))
    }

    fn name(&self) -> &str {
        "galaxy"
    }
}
