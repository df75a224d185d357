//! Callback and operator HTTP API.
//!
//! | Route | Purpose |
//! |---|---|
//! | `POST /callbacks/runs` | engine pushes a run status (`StatusNotice`) |
//! | `GET /runs?state=` | list runs, optionally filtered by state |
//! | `GET /runs/{key}` | one run |
//! | `POST /runs/{key}/retry` | operator retry of a Failed or Abandoned run |
//! | `GET /healthz` | liveness |

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use relay_core::IdempotencyKey;
use relay_registry::{RegistryError, RunState, WorkflowRun};
use relay_workflow::StatusNotice;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::completion::CompletionSender;
use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
    pub completions: CompletionSender,
}

/// Error body: `{"error": {"error_code": ..., "message": ...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub error_code: String,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn to_status_and_payload(&self) -> (StatusCode, ApiErrorResponse) {
        let (status, code, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, "NOT_FOUND", m),
            Self::Conflict(m) => (StatusCode::CONFLICT, "CONFLICT", m),
            Self::ServiceUnavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", m),
        };
        (
            status,
            ApiErrorResponse {
                error: ApiErrorDetail {
                    error_code: code.to_string(),
                    message: message.clone(),
                },
            },
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, payload) = self.to_status_and_payload();
        (status, Json(payload)).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match &e {
            DispatchError::Registry(RegistryError::NotFound(_)) => ApiError::NotFound(e.to_string()),
            DispatchError::Registry(RegistryError::InvalidTransition { .. }) => ApiError::Conflict(e.to_string()),
            DispatchError::ShuttingDown => ApiError::ServiceUnavailable(e.to_string()),
            _ if e.class().is_retryable() => ApiError::ServiceUnavailable(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/callbacks/runs", post(push_status))
        .route("/runs", get(list_runs))
        .route("/runs/{key}", get(get_run))
        .route("/runs/{key}/retry", post(retry_run))
        .fallback(not_found)
        .with_state(state)
}

/// Serve the API until shutdown is signalled.
pub async fn serve(listener: TcpListener, state: ApiState, mut shutdown: watch::Receiver<bool>) -> Result<(), DispatchError> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "HTTP API listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .map_err(|source| DispatchError::IoError {
            path: "http listener".to_string(),
            source,
        })
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    runs: usize,
}

async fn healthz(State(state): State<ApiState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        runs: state.dispatcher.registry().len(),
    })
}

async fn push_status(
    State(state): State<ApiState>,
    Json(notice): Json<StatusNotice>,
) -> Result<StatusCode, ApiError> {
    tracing::debug!(workflow_ref = %notice.workflow_ref, status = %notice.status, "status callback");
    state.completions.send(notice)?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    state: Option<String>,
}

async fn list_runs(
    State(state): State<ApiState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<WorkflowRun>>, ApiError> {
    let filter = query
        .state
        .as_deref()
        .map(str::parse::<RunState>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let runs = state
        .dispatcher
        .registry()
        .list()
        .into_iter()
        .filter(|run| filter.map_or(true, |s| run.state == s))
        .collect();
    Ok(Json(runs))
}

async fn get_run(State(state): State<ApiState>, Path(key): Path<String>) -> Result<Json<WorkflowRun>, ApiError> {
    let key = parse_key(&key)?;
    state
        .dispatcher
        .registry()
        .get(&key)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no run for key {key}")))
}

async fn retry_run(State(state): State<ApiState>, Path(key): Path<String>) -> Result<Json<WorkflowRun>, ApiError> {
    let key = parse_key(&key)?;
    let run = state.dispatcher.operator_retry(&key).await?;
    Ok(Json(run))
}

async fn not_found(uri: axum::http::Uri) -> ApiError {
    ApiError::NotFound(format!("not found: {}", uri.path()))
}

fn parse_key(raw: &str) -> Result<IdempotencyKey, ApiError> {
    raw.parse::<IdempotencyKey>().map_err(ApiError::BadRequest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use relay_core::{ParserConfig, RetryPolicy, TopicParser};
    use relay_metadata::{MemoryTripleStore, MetadataClient};
    use relay_registry::{NotificationHub, RunRegistry};
    use relay_workflow::{MemoryWorkflowEngine, RunStatus, TriggerError, WorkflowTrigger};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use crate::broker::Delivery;
    use crate::completion::completion_channel;

    struct Fixture {
        app: Router,
        dispatcher: Arc<Dispatcher>,
        engine: Arc<MemoryWorkflowEngine>,
        notices: mpsc::UnboundedReceiver<StatusNotice>,
    }

    fn fixture() -> Fixture {
        let engine = Arc::new(MemoryWorkflowEngine::new());
        let dispatcher = Arc::new(
            Dispatcher::new(
                TopicParser::new(ParserConfig::default()),
                MetadataClient::new(
                    Arc::new(MemoryTripleStore::new()),
                    RetryPolicy::immediate(1),
                    Duration::from_secs(1),
                ),
                WorkflowTrigger::new(engine.clone(), Duration::from_secs(1)),
                Arc::new(RunRegistry::new(1)),
                Arc::new(NotificationHub::new()),
            )
            .with_resubmit_backoff(RetryPolicy::immediate(1)),
        );
        let (completions, notices) = completion_channel();
        let app = router(ApiState {
            dispatcher: dispatcher.clone(),
            completions,
        });
        Fixture {
            app,
            dispatcher,
            engine,
            notices,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn submit(dispatcher: &Dispatcher) -> IdempotencyKey {
        let report = dispatcher
            .process(Delivery::detached("/parameter/update/01234", br#"{"MajorRadius":"8.5"}"#.to_vec()))
            .await;
        report.events[0].idempotency_key.clone()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let f = fixture();
        let response = f
            .app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn callback_is_queued_for_the_consumer() {
        let mut f = fixture();
        let response = f
            .app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/callbacks/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"workflow_ref":"mem-0001","status":"succeeded"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let notice = f.notices.recv().await.unwrap();
        assert_eq!(notice.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn runs_can_be_listed_and_fetched() {
        let f = fixture();
        let key = submit(&f.dispatcher).await;

        let response = f
            .app
            .clone()
            .oneshot(Request::builder().uri("/runs?state=submitted").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

        let response = f
            .app
            .clone()
            .oneshot(Request::builder().uri(format!("/runs/{key}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["state"], "submitted");

        let response = f
            .app
            .clone()
            .oneshot(Request::builder().uri("/runs?state=sleeping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = f
            .app
            .oneshot(Request::builder().uri("/runs/not-a-key").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["error_code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn retry_endpoint_resubmits_abandoned_runs() {
        let f = fixture();
        f.engine
            .fail_next_submits([TriggerError::Unavailable("503".into())]);
        let key = submit(&f.dispatcher).await;
        assert_eq!(f.dispatcher.registry().get(&key).unwrap().state, RunState::Abandoned);

        let retry = || {
            Request::builder()
                .method("POST")
                .uri(format!("/runs/{key}/retry"))
                .body(Body::empty())
                .unwrap()
        };
        let response = f.app.clone().oneshot(retry()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["state"], "submitted");

        // A submitted run cannot be retried.
        let response = f.app.oneshot(retry()).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_paths_use_the_error_body() {
        let f = fixture();
        let response = f
            .app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"]["error_code"], "NOT_FOUND");
    }
}
