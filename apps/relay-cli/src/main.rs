//! # relay-cli
//!
//! The `relay` binary: runs the parameter relay and gives operators a way
//! to inspect it.
//!
//! ```text
//! relay serve                          # run until Ctrl-C
//! relay parse /parameter/update/01234 '{"MajorRadius": 6.2}'
//! relay runs list --state abandoned    # ask a running relay
//! relay runs retry <key>
//! relay publish 01234 MajorRadius=6.2  # send an update through the broker
//! relay config                         # print the effective configuration
//! ```
//!
//! Every command reads `relay.toml` (or `--config`); a missing file means
//! defaults.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use relay_dispatcher::RelayConfig;

#[derive(Parser)]
#[command(name = "relay", version, about = "Relays MQTT parameter updates into workflow runs")]
struct Cli {
    /// Path to relay.toml.
    #[arg(long, global = true, default_value = "relay.toml")]
    config: PathBuf,

    /// Write logs as JSON lines instead of plain text.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay until interrupted.
    Serve,
    /// Decode a topic and payload and print the resulting events.
    Parse {
        /// Message topic (e.g., "/parameter/update/01234").
        topic: String,
        /// JSON payload (e.g., '{"MajorRadius": 6.2}').
        payload: String,
        /// Ingestion time (RFC 3339); defaults to now.
        #[arg(long)]
        at: Option<chrono::DateTime<chrono::Utc>>,
    },
    /// Inspect and retry workflow runs on a running relay.
    Runs {
        /// Base URL of the relay API (defaults to http://{http.bind}).
        #[arg(long)]
        url: Option<String>,
        #[command(subcommand)]
        command: commands::runs::RunsCommands,
    },
    /// Publish a parameter update on the configured broker.
    #[cfg(feature = "mqtt")]
    Publish {
        /// Resource the parameters belong to (e.g., "01234").
        resource_id: String,
        /// Parameters as NAME=VALUE pairs.
        #[arg(required = true)]
        params: Vec<String>,
        /// Resource class used as the first topic segment.
        #[arg(long, default_value = "parameter")]
        class: String,
    },
    /// Validate the configuration and print it with defaults filled in.
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    let config = RelayConfig::load_or_default(&cli.config)?;

    match &cli.command {
        Commands::Serve => commands::serve::execute(&config),
        Commands::Parse { topic, payload, at } => {
            commands::parse::execute(&config, topic, payload, *at)
        }
        Commands::Runs { url, command } => {
            commands::runs::execute(command, &config, url.as_deref())
        }
        #[cfg(feature = "mqtt")]
        Commands::Publish {
            resource_id,
            params,
            class,
        } => commands::publish::execute(&config, class, resource_id, params),
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("relay_dispatcher=info".parse()?)
        .add_directive("relay_cli=info".parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}
