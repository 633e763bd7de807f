//! Relay workers.
//!
//! A [`Worker`] pairs the immutable registration data of one client
//! ([`WorkerSpec`]) with its live state. All live state sits behind one
//! async mutex per worker, so telemetry for different workers proceeds in
//! parallel while telemetry for the same worker is serialized.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, MutexGuard};

use crate::latency::PingWindow;
use crate::process::ProcessHandle;
use crate::restart::RestartReport;

/// Lifecycle state of a worker.
///
/// ```text
/// Stopped --start ok--> Running --trigger--> Restarting --start ok--> Running
///    ^                      |                    |
///    +---- process exit ----+                    |
///    +----------- stop/start failure ------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// No process: the last stop/start failed or the process exited.
    Stopped,
    /// A process is running with `active_rtt_ms`.
    Running,
    /// A restart sequence owns the worker.
    Restarting,
}

impl WorkerState {
    /// Returns true if the worker is serving with a live process.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Restarting => "restarting",
        })
    }
}

/// Registration data of a worker. Immutable once registered.
pub struct WorkerSpec {
    /// Process/container name and log correlation key.
    pub identity: String,
    /// Port exposed to the client.
    pub port: u16,
    /// Credential the client sends with its telemetry.
    pub client_key: SecretString,
    /// Upper bound for the configured timeout.
    pub max_timeout_ms: u64,
    /// Lower bound for the configured RTT.
    pub min_rtt_ms: u64,
    /// Optional upper bound for the configured RTT.
    pub max_rtt_ms: Option<u64>,
    /// Opaque value injected into the generated config.
    pub stream_key: Option<SecretString>,
}

impl WorkerSpec {
    /// Creates a spec with no clamping: any timeout, any RTT.
    #[must_use]
    pub fn new(identity: impl Into<String>, port: u16, client_key: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            port,
            client_key: SecretString::from(client_key.into()),
            max_timeout_ms: u64::MAX,
            min_rtt_ms: 0,
            max_rtt_ms: None,
            stream_key: None,
        }
    }

    /// Sets the timeout upper bound.
    #[must_use]
    pub const fn with_max_timeout_ms(mut self, max_timeout_ms: u64) -> Self {
        self.max_timeout_ms = max_timeout_ms;
        self
    }

    /// Sets the RTT lower bound.
    #[must_use]
    pub const fn with_min_rtt_ms(mut self, min_rtt_ms: u64) -> Self {
        self.min_rtt_ms = min_rtt_ms;
        self
    }

    /// Sets the RTT upper bound.
    #[must_use]
    pub const fn with_max_rtt_ms(mut self, max_rtt_ms: u64) -> Self {
        self.max_rtt_ms = Some(max_rtt_ms);
        self
    }

    /// Sets the stream key.
    #[must_use]
    pub fn with_stream_key(mut self, stream_key: impl Into<String>) -> Self {
        self.stream_key = Some(SecretString::from(stream_key.into()));
        self
    }

    /// Constant-time comparison against a presented client key.
    #[must_use]
    pub fn client_key_matches(&self, presented: &str) -> bool {
        bool::from(
            self.client_key
                .expose_secret()
                .as_bytes()
                .ct_eq(presented.as_bytes()),
        )
    }
}

impl fmt::Debug for WorkerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSpec")
            .field("identity", &self.identity)
            .field("port", &self.port)
            .field("client_key", &"[REDACTED]")
            .field("max_timeout_ms", &self.max_timeout_ms)
            .field("min_rtt_ms", &self.min_rtt_ms)
            .field("max_rtt_ms", &self.max_rtt_ms)
            .field("stream_key", &self.stream_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Mutable part of a worker, guarded by [`Worker::lock`].
#[derive(Debug)]
pub struct WorkerInner {
    /// Current lifecycle state.
    pub state: WorkerState,
    /// Recent latency samples.
    pub window: PingWindow,
    /// Mean of `window`, `None` before the first sample.
    pub average_ping_ms: Option<f64>,
    /// RTT baked into the current configuration; 0 until first configured.
    pub active_rtt_ms: u64,
    /// Timeout baked into the current configuration.
    pub active_timeout_ms: u64,
    /// The supervised process, if one is running.
    pub process: Option<ProcessHandle>,
    /// Number of finished restart sequences, successful or not.
    pub restart_count: u64,
    /// Report of the most recent restart sequence.
    pub last_restart: Option<RestartReport>,
}

/// A supervised relay worker.
#[derive(Debug)]
pub struct Worker {
    spec: WorkerSpec,
    inner: Mutex<WorkerInner>,
}

impl Worker {
    /// Creates a stopped worker with an empty window of `window_capacity`.
    #[must_use]
    pub fn new(spec: WorkerSpec, window_capacity: usize) -> Self {
        Self {
            spec,
            inner: Mutex::new(WorkerInner {
                state: WorkerState::Stopped,
                window: PingWindow::new(window_capacity),
                average_ping_ms: None,
                active_rtt_ms: 0,
                active_timeout_ms: 0,
                process: None,
                restart_count: 0,
                last_restart: None,
            }),
        }
    }

    /// Registration data.
    #[must_use]
    pub const fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    /// Worker identity.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.spec.identity
    }

    /// Port exposed to the client.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.spec.port
    }

    /// Locks the live state.
    ///
    /// Never hold the guard across process start/stop.
    pub async fn lock(&self) -> MutexGuard<'_, WorkerInner> {
        self.inner.lock().await
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> WorkerState {
        self.inner.lock().await.state
    }

    /// RTT of the current configuration.
    pub async fn active_rtt_ms(&self) -> u64 {
        self.inner.lock().await.active_rtt_ms
    }

    /// Point-in-time view for status reporting.
    pub async fn snapshot(&self) -> WorkerSnapshot {
        let inner = self.inner.lock().await;
        WorkerSnapshot {
            identity: self.spec.identity.clone(),
            port: self.spec.port,
            state: inner.state,
            pid: inner.process.as_ref().and_then(ProcessHandle::pid),
            samples: inner.window.len(),
            average_ping_ms: inner.average_ping_ms,
            active_rtt_ms: inner.active_rtt_ms,
            active_timeout_ms: inner.active_timeout_ms,
            restart_count: inner.restart_count,
            last_restart: inner.last_restart.clone(),
        }
    }
}

/// Serializable view of a worker. Carries no credentials.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    /// Worker identity.
    pub identity: String,
    /// Port exposed to the client.
    pub port: u16,
    /// Lifecycle state.
    pub state: WorkerState,
    /// OS pid of the supervised process, when known.
    pub pid: Option<u32>,
    /// Samples in the window.
    pub samples: usize,
    /// Mean of the window.
    pub average_ping_ms: Option<f64>,
    /// RTT of the current configuration.
    pub active_rtt_ms: u64,
    /// Timeout of the current configuration.
    pub active_timeout_ms: u64,
    /// Finished restart sequences.
    pub restart_count: u64,
    /// Most recent restart.
    pub last_restart: Option<RestartReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_key_matching() {
        let spec = WorkerSpec::new("relay-a", 10080, "key-a");
        assert!(spec.client_key_matches("key-a"));
        assert!(!spec.client_key_matches("key-b"));
        assert!(!spec.client_key_matches("key-a-longer"));
        assert!(!spec.client_key_matches(""));
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let spec = WorkerSpec::new("relay-a", 10080, "super-secret-key").with_stream_key("live/abc");
        let debug = format!("{spec:?}");
        assert!(debug.contains("relay-a"));
        assert!(!debug.contains("super-secret-key"));
        assert!(!debug.contains("live/abc"));
    }

    #[tokio::test]
    async fn test_new_worker_is_stopped_and_unconfigured() {
        let worker = Worker::new(WorkerSpec::new("relay-a", 10080, "k"), 50);
        assert_eq!(worker.state().await, WorkerState::Stopped);
        assert_eq!(worker.active_rtt_ms().await, 0);

        let snapshot = worker.snapshot().await;
        assert_eq!(snapshot.samples, 0);
        assert_eq!(snapshot.average_ping_ms, None);
        assert_eq!(snapshot.pid, None);
        assert_eq!(worker.lock().await.window.capacity(), 50);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(WorkerState::Restarting.to_string(), "restarting");
        assert!(WorkerState::Running.is_running());
        assert!(!WorkerState::Stopped.is_running());
    }
}
