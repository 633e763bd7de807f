//! Worker process supervision.
//!
//! The orchestrator only needs three verbs from whatever actually runs relay
//! workers: start a worker with a config file, stop it, and tell whether its
//! port is free again. [`WorkerRuntime`] is that seam; [`CommandRuntime`] is
//! the production implementation driving an external command (docker by
//! default).

pub mod command;
pub mod spawner;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

pub use command::{CommandRuntime, RuntimeConfig};
pub use spawner::{ChildProcess, ChildStatus, ExitWatch};

static NEXT_HANDLE_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Default interval between two port probes.
pub const DEFAULT_PORT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default bound on waiting for a port to be released.
pub const DEFAULT_PORT_RELEASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Process supervision errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    /// The worker process could not be launched.
    #[error("failed to start worker process: {0}")]
    SpawnFailed(String),

    /// Teardown failed; the old process may still be alive.
    #[error("failed to stop worker process: {0}")]
    StopFailed(String),

    /// Teardown completed but the port stayed bound.
    #[error("port {port} was not released within {waited:?}")]
    PortNotReleased {
        /// Port that stayed bound.
        port: u16,
        /// How long we polled.
        waited: Duration,
    },
}

/// What a runtime needs to launch one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Process/container name.
    pub name: String,
    /// Port exposed to the client.
    pub port: u16,
    /// Materialized config file.
    pub config_path: PathBuf,
}

/// Handle to a supervised worker process.
///
/// Owned by exactly one worker entry; replaced, never mutated, on restart.
/// Every handle carries a process-wide unique serial.
#[derive(Debug)]
pub struct ProcessHandle {
    serial: u64,
    name: String,
    port: u16,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    exit: Option<ExitWatch>,
    child: Option<ChildProcess>,
}

impl ProcessHandle {
    fn build(name: String, port: u16, child: Option<ChildProcess>) -> Self {
        Self {
            serial: NEXT_HANDLE_SERIAL.fetch_add(1, Ordering::Relaxed),
            name,
            port,
            pid: child.as_ref().map(ChildProcess::pid),
            started_at: Utc::now(),
            exit: child.as_ref().map(ChildProcess::exit_watch),
            child,
        }
    }

    /// Handle for a process the runtime tracks by name only.
    #[must_use]
    pub fn detached(name: impl Into<String>, port: u16) -> Self {
        Self::build(name.into(), port, None)
    }

    /// Handle owning a spawned child process.
    #[must_use]
    pub fn from_child(name: impl Into<String>, port: u16, child: ChildProcess) -> Self {
        Self::build(name.into(), port, Some(child))
    }

    /// Unique serial of this handle.
    #[must_use]
    pub const fn serial(&self) -> u64 {
        self.serial
    }

    /// Process/container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Port the process was started on.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// OS process id, if known.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// When the process was launched.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Receiver of the process exit, if the runtime can observe it.
    #[must_use]
    pub fn exit_watch(&self) -> Option<ExitWatch> {
        self.exit.clone()
    }

    /// Takes the owned child process out of the handle.
    pub fn take_child(&mut self) -> Option<ChildProcess> {
        self.child.take()
    }
}

/// Protocols a port must be bindable on to count as released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortProbe {
    /// UDP only, the SRT transport.
    #[default]
    Udp,
    /// TCP only.
    Tcp,
    /// Both UDP and TCP.
    Both,
}

impl PortProbe {
    const fn udp(self) -> bool {
        matches!(self, Self::Udp | Self::Both)
    }

    const fn tcp(self) -> bool {
        matches!(self, Self::Tcp | Self::Both)
    }
}

/// Something that can run relay workers.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Launches a worker. Must not wait for the worker to become ready.
    async fn start(&self, launch: LaunchSpec) -> Result<ProcessHandle, ProcessError>;

    /// Tears a worker down. Success means the process is gone; if
    /// [`guarantees_port_release`](Self::guarantees_port_release) is false
    /// the caller still polls the port.
    async fn stop(&self, handle: ProcessHandle) -> Result<(), ProcessError>;

    /// Whether `port` can be bound again. Probes UDP by default.
    async fn is_port_free(&self, port: u16) -> bool {
        probe_port(port, PortProbe::Udp).await
    }

    /// True if a successful [`stop`](Self::stop) already implies the port is
    /// released.
    fn guarantees_port_release(&self) -> bool {
        false
    }
}

/// Checks whether `port` can be bound on all interfaces for the protocols
/// of `probe`.
pub async fn probe_port(port: u16, probe: PortProbe) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    if probe.udp() && tokio::net::UdpSocket::bind(addr).await.is_err() {
        return false;
    }
    !(probe.tcp() && tokio::net::TcpListener::bind(addr).await.is_err())
}

/// Polls `runtime` until `port` is free or `max_wait` elapses.
///
/// Returns `true` once the port is free, `false` on timeout.
pub async fn await_port_release<R: WorkerRuntime + ?Sized>(
    runtime: &R,
    port: u16,
    poll_interval: Duration,
    max_wait: Duration,
) -> bool {
    let deadline = Instant::now() + max_wait;
    let poll_interval = poll_interval.max(Duration::from_millis(1));
    loop {
        if runtime.is_port_free(port).await {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}
