//! Process spawning utilities.
//!
//! Launches worker commands, forwards their output to `tracing`, runs
//! bounded helper commands and terminates children with SIGTERM escalating
//! to SIGKILL.
//!
//! Every spawned child is reaped by a background task that publishes its
//! exit on an [`ExitWatch`], so callers can notice a worker that died on
//! its own without holding the child.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use super::ProcessError;

/// Reaper-side view of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    /// Still running.
    Alive,
    /// Exited and reaped.
    Exited(ExitStatus),
    /// Waiting on the child failed; its fate is unknown.
    Lost,
}

impl ChildStatus {
    /// Returns true once the child is no longer running.
    #[must_use]
    pub const fn has_exited(self) -> bool {
        !matches!(self, Self::Alive)
    }
}

/// Cloneable receiver of a child's exit.
#[derive(Debug, Clone)]
pub struct ExitWatch {
    rx: watch::Receiver<ChildStatus>,
}

impl ExitWatch {
    /// Current status without waiting.
    #[must_use]
    pub fn status(&self) -> ChildStatus {
        *self.rx.borrow()
    }

    /// Waits until the child has exited.
    pub async fn exited(&mut self) -> ChildStatus {
        match self.rx.wait_for(|status| status.has_exited()).await {
            Ok(status) => *status,
            Err(_) => ChildStatus::Lost,
        }
    }
}

/// A spawned child, reaped in the background.
#[derive(Debug)]
pub struct ChildProcess {
    pid: u32,
    exit: ExitWatch,
    kill: Option<oneshot::Sender<()>>,
}

impl ChildProcess {
    /// Hands `child` to a reaper task.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `ProcessError::SpawnFailed` if the child has no PID, i.e. it
    /// was already reaped.
    pub fn reap(mut child: Child) -> Result<Self, ProcessError> {
        let pid = child
            .id()
            .ok_or_else(|| ProcessError::SpawnFailed("failed to get process ID".to_string()))?;

        let (status_tx, status_rx) = watch::channel(ChildStatus::Alive);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let waited = tokio::select! {
                waited = child.wait() => waited,
                Ok(()) = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        debug!(pid, error = %e, "SIGKILL not delivered");
                    }
                    child.wait().await
                }
            };
            let status = match waited {
                Ok(status) => ChildStatus::Exited(status),
                Err(e) => {
                    warn!(pid, error = %e, "failed to reap child process");
                    ChildStatus::Lost
                },
            };
            status_tx.send_replace(status);
        });

        Ok(Self {
            pid,
            exit: ExitWatch { rx: status_rx },
            kill: Some(kill_tx),
        })
    }

    /// The OS process ID.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Receiver of this child's exit.
    #[must_use]
    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }
}

/// Spawns `program args...` for worker `name`.
///
/// Stdout and stderr are forwarded line by line to `tracing` at debug level,
/// so this must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns `ProcessError::SpawnFailed` if the process cannot be spawned,
/// or if the PID cannot be obtained.
pub fn spawn(name: &str, program: &str, args: &[String]) -> Result<ChildProcess, ProcessError> {
    let mut cmd = Command::new(program);

    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    let mut child = cmd
        .spawn()
        .map_err(|e| ProcessError::SpawnFailed(format!("{program}: {e}")))?;

    if let Some(stdout) = child.stdout.take() {
        forward_lines(name.to_string(), "stdout", stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(name.to_string(), "stderr", stderr);
    }

    ChildProcess::reap(child)
}

fn forward_lines<R>(name: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(worker = %name, stream, "{line}");
        }
    });
}

/// Runs a short-lived helper command to completion within `limit`.
///
/// # Errors
///
/// Returns `ProcessError::StopFailed` if the command cannot be run, exits
/// unsuccessfully or overruns `limit` (it is killed in that case).
pub async fn run_bounded(
    program: &str,
    args: &[String],
    limit: Duration,
) -> Result<(), ProcessError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(limit, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(ProcessError::StopFailed(format!("{program}: {e}"))),
        Err(_) => {
            return Err(ProcessError::StopFailed(format!(
                "{program} did not finish within {}",
                humantime::format_duration(limit)
            )));
        },
    };

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(ProcessError::StopFailed(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )))
    }
}

/// Terminates `child`: SIGTERM, wait up to `grace`, then SIGKILL.
///
/// # Errors
///
/// Returns `ProcessError::StopFailed` if the child cannot be reaped.
pub async fn terminate(mut child: ChildProcess, grace: Duration) -> Result<(), ProcessError> {
    if child.exit.status().has_exited() {
        return reaped(child.exit.status());
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        #[allow(clippy::cast_possible_wrap)]
        let target = Pid::from_raw(child.pid as i32);
        if let Err(e) = kill(target, Signal::SIGTERM) {
            debug!(pid = child.pid, error = %e, "SIGTERM not delivered");
        }
    }

    if let Ok(status) = tokio::time::timeout(grace, child.exit.exited()).await {
        return reaped(status);
    }
    warn!(pid = child.pid, "process ignored SIGTERM, sending SIGKILL");

    if let Some(kill) = child.kill.take() {
        // The reaper is gone only if the child already exited.
        let _ = kill.send(());
    }
    match tokio::time::timeout(grace, child.exit.exited()).await {
        Ok(status) => reaped(status),
        Err(_) => Err(ProcessError::StopFailed("process survived SIGKILL".to_string())),
    }
}

fn reaped(status: ChildStatus) -> Result<(), ProcessError> {
    match status {
        ChildStatus::Lost => Err(ProcessError::StopFailed(
            "child process could not be reaped".to_string(),
        )),
        ChildStatus::Alive | ChildStatus::Exited(_) => Ok(()),
    }
}
