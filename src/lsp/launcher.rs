//! Process launcher for the language server.
//!
//! Spawns the configured executable with piped stdin/stdout and hands the
//! pipes to the caller. The returned [`ProcessHandle`] owns the child for the
//! rest of its life; it is released exactly once through
//! [`ProcessHandle::terminate`], and spawned with kill-on-drop so an
//! abandoned handle cannot leave a server running.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::error::LaunchError;

/// Log target for output produced by the server itself: captured stderr
/// lines and `window/logMessage` traffic.
pub const SERVER_LOG_TARGET: &str = "jusu_lsp::server";

/// How the client talks to the server process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Framed messages over the child's stdin and stdout.
    #[default]
    Stdio,
}

/// What happens to the server's standard error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    /// The server writes straight to the host's stderr.
    #[default]
    Inherit,
    /// Each line is forwarded into `tracing` under [`SERVER_LOG_TARGET`].
    Capture,
    /// Discarded.
    Null,
}

/// Everything needed to start the language server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Executable name or path.
    pub program: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Transport used once the process is running.
    pub transport: TransportKind,
    /// Standard error policy.
    pub stderr: StderrMode,
    /// Working directory for the child, if different from the host's.
    pub working_dir: Option<PathBuf>,
}

impl LaunchConfig {
    /// Creates a stdio launch configuration for `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            transport: TransportKind::Stdio,
            stderr: StderrMode::Inherit,
            working_dir: None,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends arguments.
    #[must_use]
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the stderr policy.
    #[must_use]
    pub fn stderr(mut self, mode: StderrMode) -> Self {
        self.stderr = mode;
        self
    }

    /// Sets the child's working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// A freshly spawned server: the handle plus its two stdio channels.
#[derive(Debug)]
pub struct LaunchedProcess {
    /// Owner of the child process.
    pub handle: ProcessHandle,
    /// Write channel into the server.
    pub stdin: ChildStdin,
    /// Read channel out of the server.
    pub stdout: ChildStdout,
}

/// How a terminated process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process exited on its own within the grace period.
    Exited(ExitStatus),
    /// The process was forcibly killed.
    Killed,
}

/// Exclusive owner of a spawned language server process.
#[derive(Debug)]
pub struct ProcessHandle {
    program: String,
    child: Child,
}

impl ProcessHandle {
    /// OS process id, if the process has not been reaped yet.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Configured executable name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Waits up to `grace` for the process to exit, then kills it.
    ///
    /// Consumes the handle: the process is reaped before this returns.
    pub async fn terminate(mut self, grace: Duration) -> Termination {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(program = %self.program, ?status, "language server exited");
                return Termination::Exited(status);
            }
            Ok(Err(e)) => {
                warn!(program = %self.program, error = %e, "failed to wait for language server");
            }
            Err(_) => {
                warn!(
                    program = %self.program,
                    grace_ms = grace.as_millis(),
                    "language server did not exit in time, killing"
                );
            }
        }

        if let Err(e) = self.child.kill().await {
            warn!(program = %self.program, error = %e, "failed to kill language server");
        }
        Termination::Killed
    }
}

/// Starts the language server described by `config`.
///
/// Must be called from within a Tokio runtime.
///
/// ## Errors
/// - [`LaunchError::NotFound`] if the executable cannot be resolved
/// - [`LaunchError::SpawnFailed`] if the OS refuses to start it
pub fn launch(config: &LaunchConfig) -> Result<LaunchedProcess, LaunchError> {
    let resolved = which::which(&config.program).map_err(|_| LaunchError::NotFound {
        program: config.program.clone(),
    })?;

    debug!(
        program = %config.program,
        resolved = %resolved.display(),
        args = ?config.args,
        "spawning language server process"
    );

    let mut command = Command::new(&resolved);
    command
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(match config.stderr {
            StderrMode::Inherit => Stdio::inherit(),
            StderrMode::Capture => Stdio::piped(),
            StderrMode::Null => Stdio::null(),
        })
        .kill_on_drop(true);

    if let Some(dir) = &config.working_dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LaunchError::NotFound {
                program: config.program.clone(),
            }
        } else {
            LaunchError::SpawnFailed {
                program: config.program.clone(),
                source: e,
            }
        }
    })?;

    let missing_pipe = |name: &str| LaunchError::SpawnFailed {
        program: config.program.clone(),
        source: std::io::Error::other(format!("failed to capture {name}")),
    };
    let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_stderr(stderr, config.program.clone()));
    }

    debug!(program = %config.program, pid = ?child.id(), "language server process spawned");

    Ok(LaunchedProcess {
        handle: ProcessHandle {
            program: config.program.clone(),
            child,
        },
        stdin,
        stdout,
    })
}

async fn forward_stderr(stderr: ChildStderr, program: String) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(target: SERVER_LOG_TARGET, program = %program, "{line}");
            }
            Ok(None) => break,
            Err(e) => {
                debug!(target: SERVER_LOG_TARGET, program = %program, error = %e, "stderr closed");
                break;
            }
        }
    }
}
