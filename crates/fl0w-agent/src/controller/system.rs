//! Host operations the controller exposes: hostname, power and process list.

use async_trait::async_trait;
use sysinfo::System;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{AgentError, Result};

/// Name used when the OS does not report one.
const FALLBACK_HOSTNAME: &str = "wallaby";

#[async_trait]
pub trait SystemActions: Send + Sync {
    fn hostname(&self) -> String;

    async fn set_hostname(&self, name: &str) -> Result<()>;

    async fn reboot(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;

    /// One line per process, ordered by pid.
    fn processes(&self) -> Vec<String>;
}

/// The machine the controller runs on.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostSystem;

#[async_trait]
impl SystemActions for HostSystem {
    fn hostname(&self) -> String {
        System::host_name()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| FALLBACK_HOSTNAME.to_string())
    }

    async fn set_hostname(&self, name: &str) -> Result<()> {
        match run_command("hostnamectl", &["set-hostname", name]).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "hostnamectl failed, falling back to hostname");
                run_command("hostname", &[name]).await
            }
        }
    }

    async fn reboot(&self) -> Result<()> {
        run_command("reboot", &[]).await
    }

    async fn shutdown(&self) -> Result<()> {
        run_command("shutdown", &["-h", "0"]).await
    }

    fn processes(&self) -> Vec<String> {
        let mut system = System::new();
        system.refresh_all();

        let mut processes: Vec<_> = system.processes().iter().collect();
        processes.sort_by_key(|(pid, _)| pid.as_u32());

        processes
            .into_iter()
            .map(|(pid, process)| {
                format_process_line(
                    pid.as_u32(),
                    process.cpu_usage(),
                    process.memory(),
                    &process.name().to_string_lossy(),
                )
            })
            .collect()
    }
}

/// `PID CPU% RSS_KB NAME`, aligned like `ps` output.
pub fn format_process_line(pid: u32, cpu: f32, memory_bytes: u64, name: &str) -> String {
    format!("{pid:>7} {cpu:>5.1} {:>9} {name}", memory_bytes / 1024)
}

async fn run_command(program: &str, args: &[&str]) -> Result<()> {
    let rendered = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");
    info!(command = %rendered, "Running host command");

    let status = Command::new(program)
        .args(args)
        .status()
        .await
        .map_err(|e| AgentError::Command {
            command: rendered.clone(),
            reason: e.to_string(),
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(AgentError::Command {
            command: rendered,
            reason: status.to_string(),
        })
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::Mutex;

    use super::*;

    /// Records calls instead of touching the host.
    #[derive(Debug, Default)]
    pub struct RecordingSystem {
        pub calls: Mutex<Vec<String>>,
    }

    impl RecordingSystem {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        fn record(&self, call: String) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call);
            }
        }
    }

    #[async_trait]
    impl SystemActions for RecordingSystem {
        fn hostname(&self) -> String {
            "bot-test".to_string()
        }

        async fn set_hostname(&self, name: &str) -> Result<()> {
            self.record(format!("set_hostname {name}"));
            Ok(())
        }

        async fn reboot(&self) -> Result<()> {
            self.record("reboot".to_string());
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            self.record("shutdown".to_string());
            Ok(())
        }

        fn processes(&self) -> Vec<String> {
            vec![format_process_line(1, 0.0, 4096, "init")]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_line_format() {
        assert_eq!(
            format_process_line(42, 12.5, 2048 * 1024, "botball_user_program"),
            "     42  12.5      2048 botball_user_program"
        );
    }

    #[test]
    fn test_host_hostname_never_empty() {
        assert!(!HostSystem.hostname().is_empty());
    }

    #[test]
    fn test_host_processes_sorted_by_pid() {
        let lines = HostSystem.processes();
        assert!(!lines.is_empty());
        let pids: Vec<u32> = lines
            .iter()
            .filter_map(|line| line.split_whitespace().next()?.parse().ok())
            .collect();
        let mut sorted = pids.clone();
        sorted.sort_unstable();
        assert_eq!(pids, sorted);
    }

    #[tokio::test]
    async fn test_failed_command_is_an_error() {
        let result = run_command("false", &[]).await;
        assert!(matches!(result, Err(AgentError::Command { .. })));
        assert!(run_command("true", &[]).await.is_ok());
    }
}
