//! fl0wd - channel registry, presence broadcast and message relay
//!
//! Editors, controllers and web observers connect here; the relay keeps
//! track of who is on which channel and forwards piped and broadcast
//! messages between them.
//!
//! # Usage
//!
//! ```bash
//! # Start the relay (foreground)
//! fl0wd start
//!
//! # Start the relay in the background
//! fl0wd start -d
//!
//! # Stop / inspect a background relay
//! fl0wd stop
//! fl0wd status
//! ```

use std::env;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fl0w_core::config::load_or_init;
use fl0w_core::RelayConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fl0wd::registry::spawn_registry;
use fl0wd::server::RelayServer;

/// fl0w relay - channel registry and message forwarding
#[derive(Parser, Debug)]
#[command(name = "fl0wd", version, about)]
struct Args {
    /// Config file (written with defaults if missing)
    #[arg(short, long, global = true, default_value = "fl0wd.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the relay
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the running relay
    Stop,
    /// Show relay status
    Status,
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("fl0w")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("fl0wd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("fl0wd.log")
}

fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn running_relay() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_relay(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let pid = libc::pid_t::try_from(pid).context("PID out of range")?;
        // SAFETY: kill(2) with a plain pid and SIGTERM has no memory effects.
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<RelayConfig> {
    let config: RelayConfig = load_or_init(path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    config
        .ensure_folders()
        .context("Failed to prepare configured folders")?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Start { daemon: false });

    match command {
        Command::Start { daemon } => {
            if let Some(pid) = running_relay() {
                eprintln!("Relay is already running (PID {pid})");
                eprintln!("Use 'fl0wd stop' to stop it first.");
                process::exit(1);
            }

            let config = load_config(&args.config)?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;
            let result = run_relay(config);
            remove_pid_file();
            result
        }
        Command::Stop => {
            if let Some(pid) = running_relay() {
                println!("Stopping relay (PID {pid})...");
                stop_relay(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Relay stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Relay did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Relay is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = running_relay() {
                println!("Relay is running (PID {pid})");
                if let Ok(config) = fl0w_core::config::read_config::<RelayConfig>(&args.config) {
                    println!("Address: {}", config.server_address);
                }
                Ok(())
            } else {
                println!("Relay is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = File::create(&log_path).context("Failed to create log file for stderr")?;

    // Relative paths in the config stay relative to where the relay was started.
    let working_directory = env::current_dir().context("Failed to read working directory")?;

    Daemonize::new()
        .working_directory(working_directory)
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

fn init_tracing(debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("fl0wd={level}").parse()?)
                .add_directive(format!("fl0w_core={level}").parse()?)
                .add_directive(format!("fl0w_protocol={level}").parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn run_relay(config: RelayConfig) -> Result<()> {
    init_tracing(config.debug)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        binary_path = %config.binary_path.display(),
        source_path = %config.source_path.display(),
        "fl0w relay starting"
    );

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let registry = spawn_registry();
    let server = RelayServer::bind(&config.server_address, registry, cancel_token)
        .await
        .context("Failed to start relay")?;

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("fl0w relay stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
