//! Worker process spawning and control.
//!
//! The supervisor only sees workers through [`WorkerLauncher`] and
//! [`WorkerProcess`]. [`CommandLauncher`] is the production implementation:
//! it re-executes a program (normally this binary's hidden `worker`
//! subcommand) once per slot.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};

/// Environment variable carrying the worker id into the child process.
pub const WORKER_ID_ENV: &str = "API_CLUSTER_WORKER_ID";

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifier of a spawned worker, unique for the supervisor's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitOutcome {
    /// Exit code, absent when the process was killed by a signal.
    pub code: Option<i32>,
    /// Name of the terminating signal, if any (e.g. `SIGKILL`).
    pub signal: Option<String>,
}

impl ExitOutcome {
    /// A process that exited on its own with `code`.
    #[must_use]
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// A process killed by the named signal.
    #[must_use]
    pub fn signaled(signal: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: Some(signal.into()),
        }
    }

    /// Build an outcome from an OS exit status.
    #[must_use]
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal().map(signal_name)
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// Whether the process exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, &self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit"),
        }
    }
}

#[cfg(unix)]
fn signal_name(raw: i32) -> String {
    nix::sys::signal::Signal::try_from(raw)
        .map_or_else(|_| format!("SIG{raw}"), |signal| signal.as_str().to_string())
}

/// Error type for worker spawning operations.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    /// The worker binary was not found.
    #[error("Worker binary not found")]
    NotFound,
    /// Permission denied when spawning.
    #[error("Permission denied")]
    PermissionDenied,
    /// Other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    /// Create a `SpawnError` from an I/O error, classifying common cases.
    fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Io(err),
        }
    }
}

/// Starts worker processes on behalf of the supervisor.
pub trait WorkerLauncher: Send + Sync {
    /// Spawn the worker that will occupy slot `id`.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the process cannot be started.
    fn launch(&self, id: WorkerId) -> Result<Box<dyn WorkerProcess>, SpawnError>;
}

/// A running worker owned by the supervisor.
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process id, if known and still running.
    fn pid(&self) -> Option<u32>;

    /// Wait for the worker to exit on its own.
    async fn wait(&mut self) -> std::io::Result<ExitOutcome>;

    /// Ask the worker to stop, forcing it after `timeout`.
    async fn terminate(&mut self, timeout: Duration) -> std::io::Result<ExitOutcome>;
}

/// Launches workers by executing a program with fixed arguments.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    inherit_output: bool,
}

impl CommandLauncher {
    /// Create a launcher for an arbitrary program.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            inherit_output: true,
        }
    }

    /// Create a launcher that re-executes the current binary as a worker.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the current executable cannot be located.
    pub fn current_exe() -> Result<Self, SpawnError> {
        let exe = std::env::current_exe().map_err(SpawnError::from_io)?;
        Ok(Self::new(exe).arg("worker"))
    }

    /// Append an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Discard worker stdout/stderr instead of sharing the supervisor's.
    #[must_use]
    pub fn quiet(mut self) -> Self {
        self.inherit_output = false;
        self
    }

    /// Get the program path.
    #[must_use]
    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Get the configured arguments.
    #[must_use]
    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }
}

impl WorkerLauncher for CommandLauncher {
    fn launch(&self, id: WorkerId) -> Result<Box<dyn WorkerProcess>, SpawnError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(WORKER_ID_ENV, id.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if !self.inherit_output {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let child = cmd.spawn().map_err(SpawnError::from_io)?;
        tracing::debug!(worker_id = %id, pid = ?child.id(), "Spawned worker process");

        Ok(Box::new(ChildWorker { child }))
    }
}

/// A worker backed by an OS child process.
#[derive(Debug)]
pub struct ChildWorker {
    child: Child,
}

impl ChildWorker {
    #[cfg(unix)]
    async fn terminate_unix(&mut self, timeout: Duration) -> std::io::Result<ExitOutcome> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.child.id() {
            let nix_pid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
            let _ = kill(nix_pid, Signal::SIGTERM);

            match tokio::time::timeout(timeout, self.child.wait()).await {
                Ok(status) => return status.map(ExitOutcome::from_status),
                Err(_) => {
                    tracing::warn!(pid, "Worker ignored SIGTERM, killing");
                    self.child.kill().await?;
                }
            }
        }

        self.child.wait().await.map(ExitOutcome::from_status)
    }
}

#[async_trait]
impl WorkerProcess for ChildWorker {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> std::io::Result<ExitOutcome> {
        self.child.wait().await.map(ExitOutcome::from_status)
    }

    async fn terminate(&mut self, timeout: Duration) -> std::io::Result<ExitOutcome> {
        #[cfg(unix)]
        {
            self.terminate_unix(timeout).await
        }

        #[cfg(not(unix))]
        {
            let _ = timeout;
            self.child.kill().await?;
            self.child.wait().await.map(ExitOutcome::from_status)
        }
    }
}
