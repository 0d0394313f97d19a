//! fl0w-editor - keeps a local folder in sync with a controller
//!
//! # Usage
//!
//! ```bash
//! fl0w-editor --config fl0w-editor.toml
//! fl0w-editor --folder ./botball --controller bot-3
//! ```

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use fl0w_agent::{ClientConfig, EditorAgent, RelayClient};
use fl0w_core::config::load_or_init;
use fl0w_core::EditorConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// fl0w editor sync agent
#[derive(Parser, Debug)]
#[command(name = "fl0w-editor", version, about)]
struct Args {
    /// Config file (written with defaults if missing)
    #[arg(short, long, default_value = "fl0w-editor.toml")]
    config: PathBuf,

    /// Relay address, overriding the config file
    #[arg(short, long)]
    server: Option<String>,

    /// Folder to sync, overriding the config file
    #[arg(short, long)]
    folder: Option<PathBuf>,

    /// Controller name to sync with, overriding the config file
    #[arg(long)]
    controller: Option<String>,
}

fn init_tracing(debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("fl0w_agent={level}").parse()?)
                .add_directive(format!("fl0w_sync={level}").parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config: EditorConfig = load_or_init(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    if let Some(server) = args.server {
        config.server_address = server;
    }
    if let Some(folder) = args.folder {
        config.folder = folder;
    }
    if args.controller.is_some() {
        config.controller = args.controller;
    }

    init_tracing(config.debug)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        folder = %config.folder.display(),
        controller = ?config.controller,
        "fl0w editor starting"
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

    let agent = EditorAgent::new(&config).context("Failed to open sync folder")?;
    let client = RelayClient::new(ClientConfig::new(config.server_address), cancel_token);

    client.run(&agent).await?;
    info!("fl0w editor stopped");
    Ok(())
}
