// config.rs - RelayConfig: the `relay.toml` file.
//
// Every table is optional; a missing file yields an in-memory relay that is
// useful for local experiments. Secrets can be kept out of the file with
// RELAY_BROKER_PASSWORD and RELAY_WORKFLOW_API_KEY.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use relay_core::{ParserConfig, RetryPolicy};
use relay_metadata::SparqlConfig;
use relay_workflow::GalaxyConfig;
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

pub const ENV_BROKER_PASSWORD: &str = "RELAY_BROKER_PASSWORD";
pub const ENV_WORKFLOW_API_KEY: &str = "RELAY_WORKFLOW_API_KEY";

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub parser: ParserConfig,

    #[serde(default)]
    pub metadata: MetadataConfig,

    #[serde(default)]
    pub workflow: WorkflowConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    Memory,
    Mqtt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerTransport {
    Tcp,
    Websocket,
}

/// Broker connection (`[broker]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_kind")]
    pub kind: BrokerKind,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_transport")]
    pub transport: BrokerTransport,

    /// Path of the websocket endpoint.
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub username: Option<String>,

    /// Prefer RELAY_BROKER_PASSWORD over putting this in the file.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Topic filters to subscribe to; one subscriber loop each.
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: default_broker_kind(),
            host: default_host(),
            port: default_port(),
            transport: default_transport(),
            ws_path: default_ws_path(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            topics: default_topics(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataBackend {
    Memory,
    Sparql,
}

/// Metadata store (`[metadata]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_metadata_backend")]
    pub backend: MetadataBackend,

    /// Required when `backend = "sparql"`.
    #[serde(default)]
    pub sparql: Option<SparqlConfig>,

    #[serde(default = "default_metadata_timeout_ms")]
    pub call_timeout_ms: u64,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            backend: default_metadata_backend(),
            sparql: None,
            call_timeout_ms: default_metadata_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Memory,
    Galaxy,
}

/// How run completion is learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// The relay polls every in-flight run.
    Poll,
    /// The engine calls `POST /callbacks/runs`.
    Push,
}

/// Workflow engine (`[workflow]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_engine_kind")]
    pub engine: EngineKind,

    /// Required when `engine = "galaxy"`.
    #[serde(default)]
    pub galaxy: Option<GalaxyConfig>,

    #[serde(default = "default_workflow_timeout_ms")]
    pub call_timeout_ms: u64,

    #[serde(default = "default_completion_mode")]
    pub completion: CompletionMode,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Backoff between resubmissions of a failed run.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Event parameter name → workflow input name.
    #[serde(default)]
    pub parameter_map: BTreeMap<String, String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            engine: default_engine_kind(),
            galaxy: None,
            call_timeout_ms: default_workflow_timeout_ms(),
            completion: default_completion_mode(),
            poll_interval_secs: default_poll_interval_secs(),
            retry: RetryPolicy::default(),
            parameter_map: BTreeMap::new(),
        }
    }
}

/// Run registry (`[registry]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Directory for run files. Runs are kept in memory only when unset.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Submissions per run before a failure abandons it.
    #[serde(default = "default_max_submissions")]
    pub max_submissions: u32,

    /// In-flight runs with no progress for this long are abandoned.
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,

    /// Terminal runs are forgotten after this long.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            max_submissions: default_max_submissions(),
            staleness_secs: default_staleness_secs(),
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Worker pool and lifecycle (`[dispatcher]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Deliveries processed concurrently across all subscriptions.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How long shutdown waits for in-flight deliveries.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// Outbound notifications (`[notifications]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// JSONL file every notification is appended to.
    #[serde(default)]
    pub log_path: Option<PathBuf>,

    /// Republish notifications to the broker.
    #[serde(default = "default_true")]
    pub publish_status: bool,

    /// Notifications go to `{prefix}/{resource_id}`.
    #[serde(default = "default_status_topic_prefix")]
    pub status_topic_prefix: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            publish_status: true,
            status_topic_prefix: default_status_topic_prefix(),
        }
    }
}

/// Callback and operator API (`[http]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
        }
    }
}

// Serde default functions
fn default_broker_kind() -> BrokerKind {
    BrokerKind::Memory
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_transport() -> BrokerTransport {
    BrokerTransport::Tcp
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_client_id() -> String {
    "parameter-relay".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_topics() -> Vec<String> {
    vec!["/parameter/update/+".to_string()]
}

fn default_metadata_backend() -> MetadataBackend {
    MetadataBackend::Memory
}

fn default_metadata_timeout_ms() -> u64 {
    5_000
}

fn default_engine_kind() -> EngineKind {
    EngineKind::Memory
}

fn default_workflow_timeout_ms() -> u64 {
    15_000
}

fn default_completion_mode() -> CompletionMode {
    CompletionMode::Poll
}

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_max_submissions() -> u32 {
    3
}

fn default_staleness_secs() -> u64 {
    6 * 3600
}

fn default_retention_secs() -> u64 {
    7 * 24 * 3600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_workers() -> usize {
    8
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_status_topic_prefix() -> String {
    "/parameter/status".to_string()
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_true() -> bool {
    true
}

impl RelayConfig {
    /// Load and validate a config file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, DispatchError> {
        let content = std::fs::read_to_string(path).map_err(|source| DispatchError::IoError {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise use defaults (plus environment).
    pub fn load_or_default(path: &Path) -> Result<Self, DispatchError> {
        if path.exists() {
            return Self::load(path);
        }
        tracing::info!(path = %path.display(), "no config file, using defaults");
        let mut config = Self::default();
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, DispatchError> {
        toml::from_str(content).map_err(|e| DispatchError::Config(e.to_string()))
    }

    /// Fill secrets from the environment. `lookup` is injectable for tests.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(password) = lookup(ENV_BROKER_PASSWORD) {
            self.broker.password = Some(password);
        }
        if let Some(api_key) = lookup(ENV_WORKFLOW_API_KEY) {
            if let Some(galaxy) = self.workflow.galaxy.as_mut() {
                galaxy.api_key = api_key;
            }
        }
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.broker.topics.is_empty() {
            return Err(DispatchError::Config("broker.topics must not be empty".into()));
        }
        if let Some(bad) = self
            .broker
            .topics
            .iter()
            .find(|t| !relay_core::topic_filter::is_valid_filter(t))
        {
            return Err(DispatchError::Config(format!("invalid topic filter '{bad}'")));
        }
        // The MQTT broker hands each message to one subscription only.
        let topics = &self.broker.topics;
        for (i, a) in topics.iter().enumerate() {
            if let Some(b) = topics[i + 1..]
                .iter()
                .find(|b| relay_core::topic_filter::filters_overlap(a, b))
            {
                return Err(DispatchError::Config(format!(
                    "topic filters '{a}' and '{b}' overlap"
                )));
            }
        }
        if self.metadata.backend == MetadataBackend::Sparql && self.metadata.sparql.is_none() {
            return Err(DispatchError::Config(
                "metadata.backend = \"sparql\" requires a [metadata.sparql] table".into(),
            ));
        }
        if self.workflow.engine == EngineKind::Galaxy && self.workflow.galaxy.is_none() {
            return Err(DispatchError::Config(
                "workflow.engine = \"galaxy\" requires a [workflow.galaxy] table".into(),
            ));
        }
        if self.dispatcher.workers == 0 {
            return Err(DispatchError::Config("dispatcher.workers must be at least 1".into()));
        }
        if self.parser.coalescing_window_secs == 0 {
            return Err(DispatchError::Config("parser.coalescing_window_secs must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_file_gives_defaults() {
        let config = RelayConfig::from_toml("").unwrap();
        assert_eq!(config.broker.kind, BrokerKind::Memory);
        assert_eq!(config.broker.topics, vec!["/parameter/update/+".to_string()]);
        assert_eq!(config.registry.max_submissions, 3);
        assert_eq!(config.dispatcher.workers, 8);
        assert_eq!(config.workflow.completion, CompletionMode::Poll);
        assert!(config.parser.resource_classes.contains("parameter"));
        config.validate().unwrap();
    }

    #[test]
    fn full_file_parses() {
        let config = RelayConfig::from_toml(
            r#"
            [broker]
            kind = "mqtt"
            host = "broker.example.org"
            port = 80
            transport = "websocket"
            username = "relay"
            topics = ["/parameter/update/+", "/geometry/update/+"]

            [parser]
            resource_classes = ["parameter", "geometry"]
            coalescing_window_secs = 60

            [metadata]
            backend = "sparql"
            [metadata.sparql]
            update_url = "http://fuseki:3030/relay/update"
            query_url = "http://fuseki:3030/relay/query"
            [metadata.retry]
            max_attempts = 4

            [workflow]
            engine = "galaxy"
            completion = "push"
            [workflow.galaxy]
            url = "https://galaxy.example.org"
            workflow_id = "f2db41e1fa331b3e"
            [workflow.parameter_map]
            MajorRadius = "maj_rad"

            [registry]
            state_dir = "/var/lib/relay/runs"
            max_submissions = 5
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.broker.transport, BrokerTransport::Websocket);
        assert_eq!(config.broker.ws_path, "/ws");
        assert_eq!(config.metadata.retry.max_attempts, 4);
        assert_eq!(config.metadata.retry.initial_backoff_ms, 200);
        assert_eq!(config.workflow.parameter_map["MajorRadius"], "maj_rad");
        assert_eq!(config.registry.max_submissions, 5);
        assert_eq!(config.parser.coalescing_window_secs, 60);
    }

    #[test]
    fn env_overrides_fill_secrets() {
        let mut config = RelayConfig::from_toml(
            r#"
            [workflow]
            engine = "galaxy"
            [workflow.galaxy]
            url = "https://galaxy.example.org"
            workflow_id = "wf"
            "#,
        )
        .unwrap();
        config.apply_env_overrides(|name| match name {
            ENV_BROKER_PASSWORD => Some("pw".to_string()),
            ENV_WORKFLOW_API_KEY => Some("key".to_string()),
            _ => None,
        });
        assert_eq!(config.broker.password.as_deref(), Some("pw"));
        assert_eq!(config.workflow.galaxy.unwrap().api_key, "key");
    }

    #[test]
    fn validation_catches_missing_tables() {
        let config = RelayConfig::from_toml("[metadata]\nbackend = \"sparql\"\n").unwrap();
        assert!(matches!(config.validate(), Err(DispatchError::Config(_))));

        let config = RelayConfig::from_toml("[broker]\ntopics = [\"/a/#/b\"]\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn overlapping_topic_filters_are_rejected() {
        for topics in [
            r#"["/parameter/update/+", "/parameter/#"]"#,
            r#"["/parameter/update/+", "/parameter/update/01234"]"#,
            r#"["/parameter/update/+", "/parameter/update/+"]"#,
        ] {
            let config = RelayConfig::from_toml(&format!("[broker]\ntopics = {topics}\n")).unwrap();
            let err = config.validate().unwrap_err();
            assert!(matches!(err, DispatchError::Config(ref m) if m.contains("overlap")), "{topics}");
        }

        let config = RelayConfig::from_toml(
            "[broker]\ntopics = [\"/parameter/update/+\", \"/geometry/update/+\"]\n",
        )
        .unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn load_or_default_without_file() {
        let dir = tempdir().unwrap();
        let config = RelayConfig::load_or_default(&dir.path().join("relay.toml")).unwrap();
        assert_eq!(config.http.bind, "127.0.0.1:8787");

        std::fs::write(dir.path().join("bad.toml"), "[broker\n").unwrap();
        assert!(RelayConfig::load(&dir.path().join("bad.toml")).is_err());
    }
}
