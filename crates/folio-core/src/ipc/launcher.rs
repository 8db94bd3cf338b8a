//! Starting renderer processes.
//!
//! [`Launcher`] is the seam between the supervisor and the operating system.
//! [`ProcessLauncher`] spawns real processes; tests plug in an in-memory
//! renderer instead.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::oneshot;

use crate::config::RendererConfig;
use crate::error::{Error, Result};

/// Boxed stdin of a worker.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxed stdout or stderr of a worker.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Whether the supervisor asked for the process to be killed.
    pub killed: bool,
}

impl WorkerExit {
    fn from_status(status: io::Result<ExitStatus>, killed: bool) -> Self {
        Self {
            code: status.ok().and_then(|s| s.code()),
            killed,
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.killed, self.code) {
            (true, _) => f.write_str("killed"),
            (false, Some(code)) => write!(f, "exit code {code}"),
            (false, None) => f.write_str("terminated by signal"),
        }
    }
}

/// A freshly started worker process.
pub struct WorkerProcess {
    /// OS process id, when there is one.
    pub pid: Option<u32>,
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
    /// Resolves once the process has exited.
    pub exit: BoxFuture<'static, WorkerExit>,
    /// Sending on (or dropping) this channel terminates the process.
    pub kill: oneshot::Sender<()>,
}

/// Starts renderer processes.
pub trait Launcher: Send + Sync {
    /// Start one worker process.
    fn launch(&self) -> Result<WorkerProcess>;

    /// Human-readable name of what is launched, for logs and errors.
    fn describe(&self) -> String;

    /// Program and arguments identifying processes this launcher starts,
    /// used to find workers orphaned by a previous host.
    fn command_line(&self) -> Option<(PathBuf, Vec<OsString>)> {
        None
    }
}

/// Launches the renderer as a child process with piped stdio.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &RendererConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }

    fn spawn_failure(&self, message: impl Into<String>) -> Error {
        Error::SpawnFailure {
            program: self.program.display().to_string(),
            message: message.into(),
        }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self) -> Result<WorkerProcess> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_failure(e.to_string()))?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.spawn_failure("failed to get renderer stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.spawn_failure("failed to get renderer stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.spawn_failure("failed to get renderer stderr"))?;

        let (kill, kill_requested) = oneshot::channel::<()>();
        let exit = async move {
            tokio::select! {
                status = child.wait() => WorkerExit::from_status(status, false),
                _ = kill_requested => {
                    if let Err(e) = child.start_kill() {
                        // Already exited; nothing to kill.
                        tracing::debug!(?pid, "kill request for renderer failed: {}", e);
                    }
                    WorkerExit::from_status(child.wait().await, true)
                }
            }
        }
        .boxed();

        Ok(WorkerProcess {
            pid,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            exit,
            kill,
        })
    }

    fn describe(&self) -> String {
        self.program.display().to_string()
    }

    fn command_line(&self) -> Option<(PathBuf, Vec<OsString>)> {
        Some((self.program.clone(), self.args.clone()))
    }
}
