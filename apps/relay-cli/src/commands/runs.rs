// runs.rs - Run subcommands: list, status, retry.
//
// These talk to the operator API of a running relay rather than reading
// the registry files directly, so they never race the live process.

use clap::Subcommand;
use relay_dispatcher::RelayConfig;
use relay_registry::WorkflowRun;
use serde::Deserialize;

#[derive(Subcommand)]
pub enum RunsCommands {
    /// List tracked runs.
    List {
        /// Filter by state (e.g., "submitted", "failed", "abandoned").
        #[arg(long)]
        state: Option<String>,
    },
    /// Show one run as JSON.
    Status {
        /// Idempotency key of the run.
        key: String,
    },
    /// Resubmit a failed or abandoned run.
    Retry {
        /// Idempotency key of the run.
        key: String,
    },
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    error_code: String,
    message: String,
}

pub fn execute(cmd: &RunsCommands, config: &RelayConfig, url: Option<&str>) -> anyhow::Result<()> {
    let base = base_url(config, url);
    let client = reqwest::Client::new();
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        match cmd {
            RunsCommands::List { state } => {
                let mut request = client.get(format!("{base}/runs"));
                if let Some(state) = state {
                    request = request.query(&[("state", state)]);
                }
                let runs: Vec<WorkflowRun> = send(request).await?;
                print_table(&runs);
            }
            RunsCommands::Status { key } => {
                let run: WorkflowRun = send(client.get(format!("{base}/runs/{key}"))).await?;
                println!("{}", serde_json::to_string_pretty(&run)?);
            }
            RunsCommands::Retry { key } => {
                let run: WorkflowRun =
                    send(client.post(format!("{base}/runs/{key}/retry"))).await?;
                println!("Run {} resubmitted: {}", run.idempotency_key, run.state);
                if let Some(workflow_ref) = &run.workflow_ref {
                    println!("  Workflow: {}", workflow_ref);
                }
            }
        }
        Ok(())
    })
}

fn base_url(config: &RelayConfig, url: Option<&str>) -> String {
    match url {
        Some(url) => url.trim_end_matches('/').to_string(),
        None => format!("http://{}", config.http.bind),
    }
}

async fn send<T: serde::de::DeserializeOwned>(request: reqwest::RequestBuilder) -> anyhow::Result<T> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(err) => anyhow::bail!("{} ({}): {}", status, err.error.error_code, err.error.message),
        Err(_) => anyhow::bail!("{}: {}", status, body),
    }
}

fn print_table(runs: &[WorkflowRun]) {
    if runs.is_empty() {
        println!("No runs found.");
        return;
    }

    println!(
        "{:<16} {:<10} {:<20} {:<11} {:>8}  {}",
        "KEY", "RESOURCE", "PARAMETER", "STATE", "ATTEMPTS", "UPDATED"
    );
    for run in runs {
        println!(
            "{:<16} {:<10} {:<20} {:<11} {:>8}  {}",
            short_key(run),
            run.resource_id,
            run.parameter_name,
            run.state.to_string(),
            run.attempts,
            run.updated_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    println!();
    println!("{} run(s)", runs.len());
}

fn short_key(run: &WorkflowRun) -> String {
    run.idempotency_key.to_string().chars().take(16).collect()
}
