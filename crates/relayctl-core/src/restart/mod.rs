//! Restart orchestration.
//!
//! Decides, per accepted latency sample, whether a worker's running
//! configuration has drifted far enough from the current estimate to be
//! replaced, and runs the replacement:
//!
//! ```text
//! Running --CAS under worker lock--> Restarting
//!   1. materialize candidates, activeRTT := effective RTT
//!   2. stop old process, wait for the port
//!   3. start new process
//! Restarting --> Running            (all steps succeeded)
//! Restarting --> Running            (materialize failed, old process untouched)
//! Restarting --> Stopped            (stop, port release or start failed,
//!                                    or shutdown began before start)
//! Running    --> Stopped            (the process exited on its own)
//! ```
//!
//! The worker lock is held only for the compare-and-set and the bookkeeping
//! around each step, never across process start or stop. A worker in
//! `Restarting` cannot be claimed again, so restart sequences for one worker
//! never overlap.
//!
//! `activeRTT` is updated as soon as the new config is written, before the
//! new process runs. A sequence that fails after that point leaves the
//! worker `Stopped` with the new value, so the next restart compares against
//! what was attempted rather than what last ran.
//!
//! Every installed process with an observable exit gets a watcher task. When
//! that process exits while it is still the worker's current process, the
//! watcher drops the handle and moves a `Running` worker to `Stopped`; a
//! restart that has not yet taken the handle then skips the stop.
//!
//! Once [`RestartOrchestrator::begin_shutdown`] is called no new restart can
//! claim a worker, and a sequence already in flight ends `Stopped` instead of
//! starting a process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::latency::{self, Estimate, InvalidSample, LatencyPolicy};
use crate::materialize::{ConfigMaterializer, MaterializeError};
use crate::process::{
    DEFAULT_PORT_POLL_INTERVAL, DEFAULT_PORT_RELEASE_TIMEOUT, ExitWatch, LaunchSpec,
    ProcessError, ProcessHandle, WorkerRuntime, await_port_release,
};
use crate::worker::{Worker, WorkerState};

/// Default relative RTT drift that triggers a restart.
pub const DEFAULT_VARIANCE_THRESHOLD: f64 = 0.3;

/// Default timeout a worker boots with.
pub const DEFAULT_BASE_TIMEOUT_MS: u64 = 3_000;

/// Default RTT a worker boots with.
pub const DEFAULT_BASE_RTT_MS: u64 = 120;

/// Restart decision and sequencing parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    /// Restart when `|1 - candidate / active| >= variance_threshold`.
    pub variance_threshold: f64,
    /// Timeout requested at boot and for operator restarts of a worker
    /// without samples.
    pub base_timeout_ms: u64,
    /// RTT requested at boot and for operator restarts of a worker
    /// without samples.
    pub base_rtt_ms: u64,
    /// Interval between port-release probes.
    pub port_poll_interval: Duration,
    /// Bound on waiting for the old process to release the port.
    pub port_release_timeout: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            variance_threshold: DEFAULT_VARIANCE_THRESHOLD,
            base_timeout_ms: DEFAULT_BASE_TIMEOUT_MS,
            base_rtt_ms: DEFAULT_BASE_RTT_MS,
            port_poll_interval: DEFAULT_PORT_POLL_INTERVAL,
            port_release_timeout: DEFAULT_PORT_RELEASE_TIMEOUT,
        }
    }
}

/// Relative drift of `candidate_rtt_ms` from `active_rtt_ms`.
///
/// `None` when the worker has never been configured (`active_rtt_ms == 0`);
/// such a worker always restarts.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn variance(candidate_rtt_ms: f64, active_rtt_ms: u64) -> Option<f64> {
    if active_rtt_ms == 0 {
        None
    } else {
        Some((1.0 - candidate_rtt_ms / active_rtt_ms as f64).abs())
    }
}

/// Why a restart sequence ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartReason {
    /// Latency drift detected from telemetry.
    Telemetry,
    /// Requested through the operator API.
    Operator,
}

/// How a restart sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartOutcome {
    /// New process started; worker is `Running`.
    Completed,
    /// Config could not be produced; prior state restored.
    MaterializeFailed,
    /// Old process could not be stopped; worker is `Stopped`.
    StopFailed,
    /// Old process stopped but its port stayed bound; worker is `Stopped`.
    PortNotReleased,
    /// New process could not be launched; worker is `Stopped`.
    StartFailed,
    /// Shutdown began before the new process was started; worker is
    /// `Stopped`.
    Cancelled,
}

impl RestartOutcome {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::MaterializeFailed => "materialize_failed",
            Self::StopFailed => "stop_failed",
            Self::PortNotReleased => "port_not_released",
            Self::StartFailed => "start_failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the sequence reached `Running` with a new process.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Summary of one finished restart sequence.
#[derive(Debug, Clone, Serialize)]
pub struct RestartReport {
    /// Worker identity.
    pub identity: String,
    /// What started the sequence.
    pub reason: RestartReason,
    /// How it ended.
    pub outcome: RestartOutcome,
    /// Failure description, if any.
    pub error: Option<String>,
    /// Effective RTT written to the config, if materialization succeeded.
    pub effective_rtt_ms: Option<u64>,
    /// Effective timeout written to the config, if materialization
    /// succeeded.
    pub effective_timeout_ms: Option<u64>,
    /// When the sequence started.
    pub started_at: DateTime<Utc>,
    /// How long the sequence took.
    pub duration_ms: u64,
}

/// Receives every finished restart report.
pub trait RestartListener: Send + Sync {
    /// Called once per sequence, after the worker state has settled.
    fn restart_finished(&self, report: &RestartReport);
}

/// Listener that ignores reports.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl RestartListener for NoopListener {
    fn restart_finished(&self, _report: &RestartReport) {}
}

/// Errors of direct lifecycle requests (boot, operator restart).
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// A restart sequence already owns the worker.
    #[error("worker '{0}' is already restarting")]
    AlreadyRestarting(String),

    /// The controller is shutting down.
    #[error("shutting down")]
    ShuttingDown,

    /// The worker is not in the state the request needs.
    #[error("worker '{identity}' is {state}")]
    InvalidState {
        /// Worker identity.
        identity: String,
        /// Its current state.
        state: WorkerState,
    },

    /// The worker config could not be produced.
    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    /// The worker process could not be started or stopped.
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// What one accepted sample led to.
#[derive(Debug)]
pub enum Trigger {
    /// Drift below the threshold.
    Hold {
        /// Relative drift from the active RTT.
        variance: f64,
    },
    /// Worker not `Running`, or shutdown began; the sample was recorded
    /// without a decision.
    Deferred {
        /// State at the time of the sample.
        state: WorkerState,
    },
    /// A restart sequence was claimed and spawned.
    Restart {
        /// Relative drift, `None` for a never-configured worker.
        variance: Option<f64>,
        /// The spawned sequence.
        task: JoinHandle<RestartReport>,
    },
}

/// Result of [`RestartOrchestrator::observe`].
#[derive(Debug)]
pub struct Observation {
    /// Estimate after the sample was added.
    pub estimate: Estimate,
    /// Restart decision.
    pub trigger: Trigger,
}

/// Runs the control loop for every worker.
#[derive(Clone)]
pub struct RestartOrchestrator {
    runtime: Arc<dyn WorkerRuntime>,
    materializer: Arc<ConfigMaterializer>,
    latency: LatencyPolicy,
    policy: RestartPolicy,
    listener: Arc<dyn RestartListener>,
    shutting_down: Arc<AtomicBool>,
}

impl std::fmt::Debug for RestartOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestartOrchestrator")
            .field("materializer", &self.materializer)
            .field("latency", &self.latency)
            .field("policy", &self.policy)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl RestartOrchestrator {
    /// Creates an orchestrator with no restart listener.
    #[must_use]
    pub fn new(
        runtime: Arc<dyn WorkerRuntime>,
        materializer: ConfigMaterializer,
        latency: LatencyPolicy,
        policy: RestartPolicy,
    ) -> Self {
        Self {
            runtime,
            materializer: Arc::new(materializer),
            latency,
            policy,
            listener: Arc::new(NoopListener),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets the listener receiving restart reports.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn RestartListener>) -> Self {
        self.listener = listener;
        self
    }

    /// The latency policy samples are folded with.
    #[must_use]
    pub const fn latency_policy(&self) -> &LatencyPolicy {
        &self.latency
    }

    /// The restart policy.
    #[must_use]
    pub const fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// The config materializer.
    #[must_use]
    pub fn materializer(&self) -> &ConfigMaterializer {
        &self.materializer
    }

    /// Stops accepting restarts. Sequences in flight end `Stopped` before
    /// their start step. Shared by every clone.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Whether [`begin_shutdown`](Self::begin_shutdown) was called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Folds one latency sample into `worker` and, if the worker is
    /// `Running` and has drifted, claims and spawns a restart.
    ///
    /// Samples are recorded in every state. Only `Running` workers are
    /// considered for a restart, and none once shutdown began.
    pub async fn observe(
        &self,
        worker: &Arc<Worker>,
        sample_ms: i64,
    ) -> Result<Observation, InvalidSample> {
        let mut inner = worker.lock().await;
        let estimate = latency::observe(&mut inner.window, &self.latency, sample_ms)?;
        inner.average_ping_ms = Some(estimate.average_ms);

        if !inner.state.is_running() || self.is_shutting_down() {
            return Ok(Observation {
                estimate,
                trigger: Trigger::Deferred { state: inner.state },
            });
        }

        let drift = variance(estimate.candidate_rtt_ms, inner.active_rtt_ms);
        if let Some(v) = drift.filter(|v| *v < self.policy.variance_threshold) {
            return Ok(Observation {
                estimate,
                trigger: Trigger::Hold { variance: v },
            });
        }

        inner.state = WorkerState::Restarting;
        drop(inner);

        debug!(
            worker = %worker.identity(),
            variance = ?drift,
            candidate_rtt_ms = estimate.candidate_rtt_ms,
            "latency drift, restarting worker"
        );
        let task = self.spawn_restart(
            Arc::clone(worker),
            WorkerState::Running,
            estimate.candidate_timeout_ms,
            estimate.candidate_rtt_ms,
            RestartReason::Telemetry,
        );

        Ok(Observation {
            estimate,
            trigger: Trigger::Restart {
                variance: drift,
                task,
            },
        })
    }

    /// Claims `worker` and spawns a restart with the estimate of its current
    /// window, or the base values when it has no samples.
    ///
    /// `Running` and `Stopped` workers can be restarted this way.
    pub async fn restart_now(
        &self,
        worker: &Arc<Worker>,
    ) -> Result<JoinHandle<RestartReport>, LifecycleError> {
        let mut inner = worker.lock().await;
        if self.is_shutting_down() {
            return Err(LifecycleError::ShuttingDown);
        }
        let prior = inner.state;
        if prior == WorkerState::Restarting {
            return Err(LifecycleError::AlreadyRestarting(
                worker.identity().to_string(),
            ));
        }

        #[allow(clippy::cast_precision_loss)]
        let (timeout_ms, rtt_ms) = inner.window.average().map_or(
            (
                self.policy.base_timeout_ms as f64,
                self.policy.base_rtt_ms as f64,
            ),
            |average| {
                let estimate = self.latency.estimate(average);
                (estimate.candidate_timeout_ms, estimate.candidate_rtt_ms)
            },
        );
        inner.state = WorkerState::Restarting;
        drop(inner);

        info!(worker = %worker.identity(), from = %prior, "operator restart requested");
        Ok(self.spawn_restart(
            Arc::clone(worker),
            prior,
            timeout_ms,
            rtt_ms,
            RestartReason::Operator,
        ))
    }

    /// Boots a `Stopped` worker with the base timeout and RTT.
    ///
    /// On failure the worker stays `Stopped`.
    pub async fn start_worker(&self, worker: &Arc<Worker>) -> Result<(), LifecycleError> {
        let mut inner = worker.lock().await;
        if inner.state != WorkerState::Stopped {
            return Err(LifecycleError::InvalidState {
                identity: worker.identity().to_string(),
                state: inner.state,
            });
        }

        #[allow(clippy::cast_precision_loss)]
        let materialized = self.materializer.materialize(
            worker.spec(),
            self.policy.base_timeout_ms as f64,
            self.policy.base_rtt_ms as f64,
        )?;
        inner.active_rtt_ms = materialized.effective_rtt_ms;
        inner.active_timeout_ms = materialized.effective_timeout_ms;
        inner.state = WorkerState::Restarting;
        drop(inner);

        let launch = LaunchSpec {
            name: worker.identity().to_string(),
            port: worker.port(),
            config_path: materialized.path,
        };
        match self.runtime.start(launch).await {
            Ok(handle) => {
                let exit = handle.exit_watch().map(|exit| (handle.serial(), exit));
                let mut inner = worker.lock().await;
                inner.process = Some(handle);
                inner.state = WorkerState::Running;
                drop(inner);
                if let Some((serial, exit)) = exit {
                    watch_exit(worker, serial, exit);
                }
                info!(
                    worker = %worker.identity(),
                    port = worker.port(),
                    rtt_ms = materialized.effective_rtt_ms,
                    timeout_ms = materialized.effective_timeout_ms,
                    "worker started"
                );
                Ok(())
            },
            Err(e) => {
                worker.lock().await.state = WorkerState::Stopped;
                warn!(worker = %worker.identity(), error = %e, "worker failed to start");
                Err(e.into())
            },
        }
    }

    /// Stops a worker's process and leaves it `Stopped`.
    ///
    /// Refuses workers with a restart in flight.
    pub async fn stop_worker(&self, worker: &Arc<Worker>) -> Result<(), LifecycleError> {
        let mut inner = worker.lock().await;
        if inner.state == WorkerState::Restarting {
            return Err(LifecycleError::AlreadyRestarting(
                worker.identity().to_string(),
            ));
        }
        let handle = inner.process.take();
        inner.state = WorkerState::Stopped;
        drop(inner);

        if let Some(handle) = handle {
            self.runtime.stop(handle).await?;
            info!(worker = %worker.identity(), "worker stopped");
        }
        Ok(())
    }

    fn spawn_restart(
        &self,
        worker: Arc<Worker>,
        prior: WorkerState,
        timeout_ms: f64,
        rtt_ms: f64,
        reason: RestartReason,
    ) -> JoinHandle<RestartReport> {
        let this = self.clone();
        tokio::spawn(async move {
            this.run_restart(&worker, prior, timeout_ms, rtt_ms, reason)
                .await
        })
    }

    /// Runs steps 1-3 for a worker already claimed in `Restarting`.
    async fn run_restart(
        &self,
        worker: &Arc<Worker>,
        prior: WorkerState,
        timeout_ms: f64,
        rtt_ms: f64,
        reason: RestartReason,
    ) -> RestartReport {
        let mut run = SequenceRun::begin(worker, reason);
        info!(
            worker = %run.identity,
            ?reason,
            requested_rtt_ms = rtt_ms,
            requested_timeout_ms = timeout_ms,
            "restart sequence started"
        );

        let materialized = match self.materializer.materialize(worker.spec(), timeout_ms, rtt_ms)
        {
            Ok(materialized) => materialized,
            Err(e) => {
                warn!(worker = %run.identity, error = %e, "restart aborted: config not written");
                let report = run.finish(RestartOutcome::MaterializeFailed, Some(e.to_string()));
                return self.settle(worker, prior, None, report).await;
            },
        };
        run.effective_rtt_ms = Some(materialized.effective_rtt_ms);
        run.effective_timeout_ms = Some(materialized.effective_timeout_ms);

        let previous = {
            let mut inner = worker.lock().await;
            inner.active_rtt_ms = materialized.effective_rtt_ms;
            inner.active_timeout_ms = materialized.effective_timeout_ms;
            inner.process.take()
        };

        let stopped = previous.is_some();
        if let Some(handle) = previous {
            if let Err(e) = self.runtime.stop(handle).await {
                warn!(worker = %run.identity, error = %e, "restart aborted: old process not stopped");
                let report = run.finish(RestartOutcome::StopFailed, Some(e.to_string()));
                return self.settle(worker, WorkerState::Stopped, None, report).await;
            }
        }

        if !(stopped && self.runtime.guarantees_port_release()) {
            let released = await_port_release(
                self.runtime.as_ref(),
                worker.port(),
                self.policy.port_poll_interval,
                self.policy.port_release_timeout,
            )
            .await;
            if !released {
                let e = ProcessError::PortNotReleased {
                    port: worker.port(),
                    waited: self.policy.port_release_timeout,
                };
                warn!(worker = %run.identity, error = %e, "restart aborted");
                let report = run.finish(RestartOutcome::PortNotReleased, Some(e.to_string()));
                return self.settle(worker, WorkerState::Stopped, None, report).await;
            }
        }

        if self.is_shutting_down() {
            info!(worker = %run.identity, "restart cancelled by shutdown");
            let report = run.finish(RestartOutcome::Cancelled, None);
            return self.settle(worker, WorkerState::Stopped, None, report).await;
        }

        let launch = LaunchSpec {
            name: run.identity.clone(),
            port: worker.port(),
            config_path: materialized.path,
        };
        match self.runtime.start(launch).await {
            Ok(handle) => {
                info!(
                    worker = %run.identity,
                    rtt_ms = materialized.effective_rtt_ms,
                    timeout_ms = materialized.effective_timeout_ms,
                    "worker restarted"
                );
                let report = run.finish(RestartOutcome::Completed, None);
                self.settle(worker, WorkerState::Running, Some(handle), report)
                    .await
            },
            Err(e) => {
                warn!(worker = %run.identity, error = %e, "restart aborted: new process not started");
                let report = run.finish(RestartOutcome::StartFailed, Some(e.to_string()));
                self.settle(worker, WorkerState::Stopped, None, report).await
            },
        }
    }

    /// Releases the worker from `Restarting` and records the report.
    async fn settle(
        &self,
        worker: &Arc<Worker>,
        state: WorkerState,
        process: Option<ProcessHandle>,
        report: RestartReport,
    ) -> RestartReport {
        let exit = process
            .as_ref()
            .and_then(|handle| handle.exit_watch().map(|exit| (handle.serial(), exit)));
        {
            let mut inner = worker.lock().await;
            if process.is_some() {
                inner.process = process;
            }
            inner.state = state;
            inner.restart_count += 1;
            inner.last_restart = Some(report.clone());
        }
        if let Some((serial, exit)) = exit {
            watch_exit(worker, serial, exit);
        }
        self.listener.restart_finished(&report);
        report
    }
}

/// Settles `worker` when the process behind handle `serial` exits while it
/// is still the worker's current process.
fn watch_exit(worker: &Arc<Worker>, serial: u64, mut exit: ExitWatch) {
    let worker = Arc::clone(worker);
    tokio::spawn(async move {
        let status = exit.exited().await;
        let mut inner = worker.lock().await;
        if inner.process.as_ref().map(ProcessHandle::serial) != Some(serial) {
            return;
        }
        inner.process = None;
        let prior = inner.state;
        if prior == WorkerState::Running {
            inner.state = WorkerState::Stopped;
        }
        drop(inner);
        warn!(worker = %worker.identity(), ?status, state = %prior, "worker process exited");
    });
}

/// Bookkeeping of one sequence in progress.
struct SequenceRun {
    identity: String,
    reason: RestartReason,
    started_at: DateTime<Utc>,
    clock: Instant,
    effective_rtt_ms: Option<u64>,
    effective_timeout_ms: Option<u64>,
}

impl SequenceRun {
    fn begin(worker: &Worker, reason: RestartReason) -> Self {
        Self {
            identity: worker.identity().to_string(),
            reason,
            started_at: Utc::now(),
            clock: Instant::now(),
            effective_rtt_ms: None,
            effective_timeout_ms: None,
        }
    }

    fn finish(&self, outcome: RestartOutcome, error: Option<String>) -> RestartReport {
        RestartReport {
            identity: self.identity.clone(),
            reason: self.reason,
            outcome,
            error,
            effective_rtt_ms: self.effective_rtt_ms,
            effective_timeout_ms: self.effective_timeout_ms,
            started_at: self.started_at,
            duration_ms: u64::try_from(self.clock.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}
