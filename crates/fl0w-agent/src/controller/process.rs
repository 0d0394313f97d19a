//! Process controller: at most one user program per controller.
//!
//! ```text
//!        run()            exit / kill
//! Idle ─────────▶ Running ───────────────▶ Idle
//!                    │ stop()                ▲
//!                    ▼                       │
//!                 Killing ───────────────────┘
//! ```
//!
//! Every transition happens under one lock, so a `run` racing a `stop` sees
//! either `Running` or `Killing` and is refused, never a second process.
//!
//! # Panic-Free Guarantees
//!
//! Spawn failures leave the controller `Idle`; output and exit codes are
//! delivered over an unbounded channel and a closed receiver is ignored.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ProcessError;

/// Executable inside each program folder.
pub const PROGRAM_BINARY: &str = "botball_user_program";

/// Arguments that disable buffering on stdin, stdout and stderr.
const UNBUFFER_ARGS: [&str; 3] = ["-i0", "-o0", "-e0"];

/// Exit code reported when the status carries neither code nor signal.
const UNKNOWN_EXIT_CODE: i32 = -1;

/// Output of a running program, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutput {
    /// One line from stdout or stderr
    Line(String),
    /// Final message; negative values are the terminating signal
    Exited(i32),
}

/// Observable state of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Idle,
    Running { program: String },
    Killing { program: String },
}

enum Slot {
    Idle,
    Running {
        program: String,
        kill: oneshot::Sender<()>,
    },
    Killing {
        program: String,
    },
}

impl Slot {
    fn state(&self) -> ProcessState {
        match self {
            Self::Idle => ProcessState::Idle,
            Self::Running { program, .. } => ProcessState::Running {
                program: program.clone(),
            },
            Self::Killing { program } => ProcessState::Killing {
                program: program.clone(),
            },
        }
    }
}

/// Starts, streams and kills user programs.
#[derive(Clone)]
pub struct ProcessController {
    programs_path: PathBuf,
    unbuffer: String,
    slot: Arc<Mutex<Slot>>,
}

impl std::fmt::Debug for ProcessController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessController")
            .field("programs_path", &self.programs_path)
            .field("unbuffer", &self.unbuffer)
            .finish()
    }
}

impl ProcessController {
    /// `unbuffer` may be empty to run programs directly.
    pub fn new(programs_path: impl Into<PathBuf>, unbuffer: impl Into<String>) -> Self {
        Self {
            programs_path: programs_path.into(),
            unbuffer: unbuffer.into(),
            slot: Arc::new(Mutex::new(Slot::Idle)),
        }
    }

    pub async fn state(&self) -> ProcessState {
        self.slot.lock().await.state()
    }

    pub async fn is_idle(&self) -> bool {
        matches!(*self.slot.lock().await, Slot::Idle)
    }

    /// Path of the executable for `program`.
    pub fn program_path(&self, program: &str) -> Result<PathBuf, ProcessError> {
        validate_program(program)?;
        Ok(self.programs_path.join(program).join(PROGRAM_BINARY))
    }

    /// Starts `program` if nothing else is running.
    ///
    /// Output lines and then the exit code are sent to `output`.
    pub async fn run(
        &self,
        program: &str,
        output: mpsc::UnboundedSender<ProcessOutput>,
    ) -> Result<(), ProcessError> {
        let path = self.program_path(program)?;
        let mut slot = self.slot.lock().await;

        if let Slot::Running { program: current, .. } | Slot::Killing { program: current } = &*slot {
            warn!(requested = %program, running = %current, "Refusing concurrent run");
            return Err(ProcessError::AlreadyRunning {
                program: current.clone(),
            });
        }

        let child = self.spawn(&path)?;
        let (kill_tx, kill_rx) = oneshot::channel();
        *slot = Slot::Running {
            program: program.to_string(),
            kill: kill_tx,
        };
        info!(program = %program, pid = ?child.id(), "Program started");

        tokio::spawn(supervise(
            child,
            kill_rx,
            output,
            Arc::clone(&self.slot),
            program.to_string(),
        ));
        Ok(())
    }

    /// Kills the running program. Returns false if there was nothing to stop.
    pub async fn stop(&self) -> bool {
        let mut slot = self.slot.lock().await;

        match std::mem::replace(&mut *slot, Slot::Idle) {
            Slot::Running { program, kill } => {
                info!(program = %program, "Stopping program");
                // A closed receiver means the supervisor is already reaping it.
                let _ = kill.send(());
                *slot = Slot::Killing { program };
                true
            }
            other => {
                debug!(state = ?other.state(), "Stop requested with no running program");
                *slot = other;
                false
            }
        }
    }

    fn spawn(&self, path: &Path) -> Result<Child, ProcessError> {
        let mut command = if self.unbuffer.is_empty() {
            Command::new(path)
        } else {
            let mut command = Command::new(&self.unbuffer);
            command.args(UNBUFFER_ARGS).arg(path);
            command
        };

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        command.spawn().map_err(|e| ProcessError::Spawn {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// Program names are single path components.
fn validate_program(program: &str) -> Result<(), ProcessError> {
    let invalid = program.is_empty()
        || program == "."
        || program == ".."
        || program.contains('/')
        || program.contains('\\');
    if invalid {
        return Err(ProcessError::InvalidProgram(program.to_string()));
    }
    Ok(())
}

async fn supervise(
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    output: mpsc::UnboundedSender<ProcessOutput>,
    slot: Arc<Mutex<Slot>>,
    program: String,
) {
    let mut readers: Vec<JoinHandle<()>> = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward_lines(stdout, output.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward_lines(stderr, output.clone())));
    }

    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_rx => {
            if let Err(e) = child.start_kill() {
                debug!(program = %program, error = %e, "Kill failed, process already gone");
            }
            child.wait().await
        }
    };

    // Lines are flushed before the exit code goes out.
    for reader in readers {
        let _ = reader.await;
    }

    let code = match status {
        Ok(status) => exit_code(status),
        Err(e) => {
            warn!(program = %program, error = %e, "Failed to wait for program");
            UNKNOWN_EXIT_CODE
        }
    };

    let mut slot = slot.lock().await;
    info!(program = %program, code, "Program exited");
    let _ = output.send(ProcessOutput::Exited(code));
    *slot = Slot::Idle;
}

async fn forward_lines<R>(stream: R, output: mpsc::UnboundedSender<ProcessOutput>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if output.send(ProcessOutput::Line(line)).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "Program output closed");
                return;
            }
        }
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(UNKNOWN_EXIT_CODE)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(UNKNOWN_EXIT_CODE)
}
