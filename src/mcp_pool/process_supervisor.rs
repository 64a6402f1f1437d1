// ABOUTME: MCP process supervision: spawn, exit observation and staged termination
//
// Spawns MCP server processes (optionally in their own process group so wrapper
// scripts and their children are signalled as one unit), routes stderr to a
// per-server log file, and hands the Child to a reaper task. The reaper is the
// only place that waits on the child, which prevents zombies; everyone else
// observes the exit through a watch channel.
//
// Cancelling the process's token is what triggers the graceful signal. If the
// process is still alive after the grace period the reaper escalates to a
// forced kill.

// Allow if-let/else patterns instead of map_or_else for readability
#![allow(clippy::option_if_let_else)]

use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that can occur during process supervision
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Process spawn failed
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    /// Termination failed
    #[error("Failed to terminate process: {0}")]
    TerminateFailed(#[source] std::io::Error),

    /// Invalid command
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

/// Command, arguments and environment overlay for an MCP server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Executable to run
    #[serde(default)]
    pub command: String,
    /// Arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Variables merged over the inherited environment
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl LaunchSpec {
    /// Build a launch spec
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            env,
        }
    }

    /// Whether there is anything to run
    pub fn is_empty(&self) -> bool {
        self.command.trim().is_empty()
    }
}

/// How a supervised process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// Process exited normally with exit code
    Exited {
        /// Exit code from the process
        code: i32,
    },

    /// Process was terminated by a signal
    Signaled {
        /// Signal number that terminated the process
        signal: i32,
    },

    /// Waiting on the process failed
    WaitFailed {
        /// Description of the failure
        reason: String,
    },
}

impl ProcessExit {
    /// True only for a zero exit code
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }

    fn from_wait(result: io::Result<ExitStatus>) -> Self {
        match result {
            Ok(status) => {
                if let Some(code) = status.code() {
                    return Self::Exited { code };
                }
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    if let Some(signal) = status.signal() {
                        return Self::Signaled { signal };
                    }
                }
                Self::WaitFailed {
                    reason: "unknown termination".to_string(),
                }
            }
            Err(e) => Self::WaitFailed {
                reason: e.to_string(),
            },
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exit status {code}"),
            Self::Signaled { signal } => write!(f, "terminated by signal {signal}"),
            Self::WaitFailed { reason } => write!(f, "wait failed: {reason}"),
        }
    }
}

/// What a termination signal is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTarget {
    /// A single process
    Process(u32),
    /// Every process in the group led by this pid
    Group(u32),
}

/// Capability to terminate processes and process groups
///
/// The POSIX implementation maps to SIGTERM/SIGKILL. Non-POSIX targets have no
/// process groups; there the supervisor falls back to killing the direct child.
pub trait ProcessSignaller: Send + Sync + fmt::Debug {
    /// Ask the target to exit (SIGTERM)
    fn graceful_terminate(&self, target: SignalTarget) -> io::Result<()>;

    /// Kill the target outright (SIGKILL)
    fn force_kill(&self, target: SignalTarget) -> io::Result<()>;
}

/// Signal delivery through `kill(2)` / `killpg(2)`
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixSignaller;

#[cfg(unix)]
impl PosixSignaller {
    fn send(target: SignalTarget, signal: nix::sys::signal::Signal) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, killpg};
        use nix::unistd::Pid;

        let raw = match target {
            SignalTarget::Process(pid) | SignalTarget::Group(pid) => {
                i32::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?
            }
        };
        if raw <= 0 {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        let result = match target {
            SignalTarget::Process(_) => kill(Pid::from_raw(raw), signal),
            SignalTarget::Group(_) => killpg(Pid::from_raw(raw), signal),
        };

        match result {
            // Already gone
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }
}

#[cfg(unix)]
impl ProcessSignaller for PosixSignaller {
    fn graceful_terminate(&self, target: SignalTarget) -> io::Result<()> {
        Self::send(target, nix::sys::signal::Signal::SIGTERM)
    }

    fn force_kill(&self, target: SignalTarget) -> io::Result<()> {
        Self::send(target, nix::sys::signal::Signal::SIGKILL)
    }
}

#[cfg(not(unix))]
impl ProcessSignaller for PosixSignaller {
    fn graceful_terminate(&self, _target: SignalTarget) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn force_kill(&self, _target: SignalTarget) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

/// Spawn-time options
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Put the child in a new process group and signal the whole group
    pub own_process_group: bool,

    /// Pipe stdin/stdout back to us (stdio MCPs); otherwise stdout goes to the log
    pub pipe_stdio: bool,

    /// File receiving stderr (appended); null when unset or unopenable
    pub log_file: Option<PathBuf>,

    /// Time between the graceful signal and the forced kill
    pub term_grace: Duration,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            own_process_group: true,
            pipe_stdio: true,
            log_file: None,
            term_grace: Duration::from_secs(3),
        }
    }
}

/// A process spawned by us plus its piped stdio
#[derive(Debug)]
pub struct Spawned {
    /// Handle used to observe and terminate the process
    pub process: SupervisedProcess,
    /// Child's stdin for JSON-RPC communication
    pub stdin: Option<ChildStdin>,
    /// Child's stdout for JSON-RPC communication
    pub stdout: Option<ChildStdout>,
}

/// Handle to a running process owned by a reaper task
#[derive(Debug)]
pub struct SupervisedProcess {
    pid: u32,
    target: SignalTarget,
    signaller: Arc<dyn ProcessSignaller>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    reaper: JoinHandle<()>,
}

/// Spawns MCP server processes and wires up their reapers
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    signaller: Arc<dyn ProcessSignaller>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(Arc::new(PosixSignaller))
    }
}

impl ProcessSupervisor {
    /// Create a supervisor using the given signalling capability
    pub fn new(signaller: Arc<dyn ProcessSignaller>) -> Self {
        Self { signaller }
    }

    /// Spawn a new process
    ///
    /// Cancelling `cancel` sends the graceful signal; the reaper escalates to
    /// a forced kill after `options.term_grace`.
    pub fn spawn(
        &self,
        spec: &LaunchSpec,
        options: &SpawnOptions,
        cancel: CancellationToken,
    ) -> Result<Spawned, SupervisorError> {
        if spec.is_empty() {
            return Err(SupervisorError::InvalidCommand(
                "Command cannot be empty".to_string(),
            ));
        }

        debug!(command = %spec.command, args = ?spec.args, "Spawning MCP process");

        let mut process_cmd = Command::new(&spec.command);
        process_cmd.args(&spec.args).envs(&spec.env).kill_on_drop(true);

        let log = options.log_file.as_deref().and_then(open_log_file);
        if options.pipe_stdio {
            process_cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
        } else {
            let stdout = log
                .as_ref()
                .and_then(|f| f.try_clone().ok())
                .map_or_else(Stdio::null, Stdio::from);
            process_cmd.stdin(Stdio::null()).stdout(stdout);
        }
        process_cmd.stderr(log.map_or_else(Stdio::null, Stdio::from));

        #[cfg(unix)]
        {
            if options.own_process_group {
                process_cmd.process_group(0);
            }
        }

        let mut child = process_cmd.spawn().map_err(SupervisorError::SpawnFailed)?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let pid = child.id().unwrap_or(0);
        let target = if options.own_process_group && cfg!(unix) {
            SignalTarget::Group(pid)
        } else {
            SignalTarget::Process(pid)
        };

        info!(pid = pid, command = %spec.command, "MCP process spawned");

        let (exit_tx, exit_rx) = watch::channel(None);
        let reaper = tokio::spawn(reap(
            child,
            target,
            Arc::clone(&self.signaller),
            cancel,
            options.term_grace,
            exit_tx,
        ));

        Ok(Spawned {
            process: SupervisedProcess {
                pid,
                target,
                signaller: Arc::clone(&self.signaller),
                exit_rx,
                reaper,
            },
            stdin,
            stdout,
        })
    }
}

impl SupervisedProcess {
    /// OS process id (0 if it exited before we could read it)
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit outcome, if the process has ended
    pub fn exit(&self) -> Option<ProcessExit> {
        self.exit_rx.borrow().clone()
    }

    /// Whether the process has ended
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// A receiver that resolves when the process ends
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    /// Wait for the process to end, up to `limit`
    pub async fn wait_exit(&self, limit: Duration) -> Option<ProcessExit> {
        wait_for_exit(self.exit_rx.clone(), limit).await
    }

    /// Kill the process (group) immediately
    pub fn force_kill(&self) -> Result<(), SupervisorError> {
        if self.has_exited() {
            return Ok(());
        }
        match self.signaller.force_kill(self.target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Unsupported => {
                // The reaper owns the Child; aborting it drops the Child, which kills it
                self.reaper.abort();
                Ok(())
            }
            Err(e) => Err(SupervisorError::TerminateFailed(e)),
        }
    }

    /// Wait up to `grace` for exit, then force-kill and wait briefly again
    ///
    /// Timeouts are logged, not returned: the forced kill is the fallback.
    pub async fn await_exit_or_kill(&self, grace: Duration) -> Option<ProcessExit> {
        if let Some(exit) = self.wait_exit(grace).await {
            debug!(pid = self.pid, %exit, "Process exited within grace period");
            return Some(exit);
        }

        warn!(
            pid = self.pid,
            grace_ms = grace.as_millis(),
            "Process did not exit in time, force killing"
        );
        if let Err(e) = self.force_kill() {
            error!(pid = self.pid, error = %e, "Failed to kill process");
        }

        let exit = self.wait_exit(Duration::from_secs(1)).await;
        if exit.is_none() {
            warn!(pid = self.pid, "Process still not reaped after force kill");
        }
        exit
    }
}

/// Wait on an exit watch for up to `limit`
pub async fn wait_for_exit(
    mut exit_rx: watch::Receiver<Option<ProcessExit>>,
    limit: Duration,
) -> Option<ProcessExit> {
    match tokio::time::timeout(limit, exit_rx.wait_for(Option::is_some)).await {
        Ok(Ok(exit)) => return exit.clone(),
        Ok(Err(_)) => {}
        Err(_) => return None,
    }
    // Reaper gone without reporting; whatever is stored is final
    let last = exit_rx.borrow().clone();
    last
}

async fn reap(
    mut child: Child,
    target: SignalTarget,
    signaller: Arc<dyn ProcessSignaller>,
    cancel: CancellationToken,
    term_grace: Duration,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) {
    let early = tokio::select! {
        status = child.wait() => Some(status),
        () = cancel.cancelled() => None,
    };

    let status = match early {
        Some(status) => status,
        None => {
            debug!(?target, "Cancelled, sending graceful termination");
            if let Err(e) = signaller.graceful_terminate(target) {
                debug!(?target, error = %e, "Graceful termination unavailable, killing child");
                let _ = child.start_kill();
            }

            match tokio::time::timeout(term_grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(?target, "Process ignored graceful termination, sending SIGKILL");
                    if signaller.force_kill(target).is_err() {
                        let _ = child.start_kill();
                    }
                    child.wait().await
                }
            }
        }
    };

    let exit = ProcessExit::from_wait(status);
    debug!(?target, %exit, "Process reaped");
    let _ = exit_tx.send(Some(exit));
}

fn open_log_file(path: &Path) -> Option<std::fs::File> {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(path = %path.display(), error = %e, "Failed to create log directory");
            return None;
        }
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to open process log");
            None
        }
    }
}
