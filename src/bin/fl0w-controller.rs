//! fl0w-controller - relay agent running on a robot controller
//!
//! Streams sensor readings, runs user programs, answers host queries and
//! serves the programs folder to editors.
//!
//! # Usage
//!
//! ```bash
//! fl0w-controller --config fl0w-controller.toml
//! ```

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fl0w_agent::controller::{source, HostSystem};
use fl0w_agent::{ClientConfig, ControllerAgent, RelayClient};
use fl0w_core::config::load_or_init;
use fl0w_core::ControllerConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// fl0w controller agent
#[derive(Parser, Debug)]
#[command(name = "fl0w-controller", version, about)]
struct Args {
    /// Config file (written with defaults if missing)
    #[arg(short, long, default_value = "fl0w-controller.toml")]
    config: PathBuf,

    /// Relay address, overriding the config file
    #[arg(short, long)]
    server: Option<String>,
}

fn init_tracing(debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("fl0w_agent={level}").parse()?)
                .add_directive(format!("fl0w_sync={level}").parse()?)
                .add_directive(format!("fl0w_core={level}").parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config: ControllerConfig = load_or_init(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    if let Some(server) = args.server {
        config.server_address = server;
    }

    init_tracing(config.debug)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        programs_path = %config.programs_path.display(),
        "fl0w controller starting"
    );

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let client = RelayClient::new(ClientConfig::new(config.server_address.clone()), cancel_token);
    let agent = ControllerAgent::new(config, Arc::new(HostSystem), source::detect())
        .context("Failed to open programs folder")?;

    client.run(&agent).await?;
    info!("fl0w controller stopped");
    Ok(())
}
