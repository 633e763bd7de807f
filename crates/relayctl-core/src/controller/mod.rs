//! Controller.
//!
//! Ties the registry to the restart orchestrator and exposes the operations
//! the outer surfaces need: boot, telemetry intake, operator restarts,
//! status snapshots and shutdown.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::latency::{Estimate, InvalidSample};
use crate::materialize::MaterializeError;
use crate::process::WorkerRuntime;
use crate::registry::{RegistryError, WorkerRegistry};
use crate::restart::{LifecycleError, RestartListener, RestartOrchestrator, RestartReport, Trigger};
use crate::worker::WorkerSnapshot;

/// Poll interval while waiting for in-flight restarts at shutdown.
const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Fatal boot errors.
#[derive(Debug, Error)]
pub enum BootError {
    /// Two workers collide, or an identity is unusable.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The base template is unreadable or the config directory unusable.
    #[error(transparent)]
    Template(#[from] MaterializeError),
}

/// Errors of operator requests.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// No worker has this identity.
    #[error("unknown worker '{0}'")]
    UnknownWorker(String),

    /// The worker cannot take the request in its current state.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// What one telemetry message led to. Never surfaced to the client.
#[derive(Debug)]
pub enum PingOutcome {
    /// No client key was presented.
    MissingClientKey,
    /// The client key matches no worker.
    UnknownClient,
    /// The derived latency was out of range; nothing was recorded.
    InvalidSample {
        /// Worker the key belongs to.
        identity: String,
        /// Why the sample was rejected.
        error: InvalidSample,
    },
    /// The sample was recorded.
    Recorded {
        /// Worker the key belongs to.
        identity: String,
        /// Estimate after the sample.
        estimate: Estimate,
        /// Restart decision.
        trigger: Trigger,
    },
}

impl PingOutcome {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::MissingClientKey => "missing_client_key",
            Self::UnknownClient => "unknown_client",
            Self::InvalidSample { .. } => "invalid_sample",
            Self::Recorded { trigger, .. } => match trigger {
                Trigger::Hold { .. } => "hold",
                Trigger::Deferred { .. } => "deferred",
                Trigger::Restart { .. } => "restart",
            },
        }
    }
}

/// The relay controller.
#[derive(Debug)]
pub struct Controller {
    registry: WorkerRegistry,
    orchestrator: RestartOrchestrator,
}

impl Controller {
    /// Creates a controller over an already populated registry.
    #[must_use]
    pub const fn new(registry: WorkerRegistry, orchestrator: RestartOrchestrator) -> Self {
        Self {
            registry,
            orchestrator,
        }
    }

    /// Registers every configured worker and wires the orchestrator.
    ///
    /// Fails on the first registration error, before any process exists.
    pub fn from_settings(
        settings: &Settings,
        runtime: Arc<dyn WorkerRuntime>,
        listener: Arc<dyn RestartListener>,
    ) -> Result<Self, BootError> {
        let mut registry = WorkerRegistry::new(settings.controller.window_capacity);
        for worker in &settings.workers {
            registry.register(worker.to_spec())?;
        }

        let orchestrator = RestartOrchestrator::new(
            runtime,
            settings.materializer(),
            settings.latency_policy(),
            settings.restart_policy(),
        )
        .with_listener(listener);

        Ok(Self::new(registry, orchestrator))
    }

    /// The worker registry.
    #[must_use]
    pub const fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// The restart orchestrator.
    #[must_use]
    pub const fn orchestrator(&self) -> &RestartOrchestrator {
        &self.orchestrator
    }

    /// Starts every worker with the base configuration.
    ///
    /// An unusable template, or a worker config that cannot be written,
    /// aborts boot and stops the workers already started. A worker whose
    /// process fails to start is left `Stopped` and boot continues. Returns
    /// the number of workers started.
    pub async fn boot(&self) -> Result<usize, BootError> {
        self.orchestrator.materializer().check()?;

        let mut started = 0;
        for worker in self.registry.all() {
            match self.orchestrator.start_worker(worker).await {
                Ok(()) => started += 1,
                Err(LifecycleError::Materialize(e)) => {
                    error!(worker = %worker.identity(), error = %e, "worker config not written, aborting boot");
                    self.stop_all().await;
                    return Err(BootError::Template(e));
                },
                Err(e) => {
                    warn!(worker = %worker.identity(), error = %e, "worker left stopped at boot");
                },
            }
        }

        info!(
            started,
            total = self.registry.len(),
            "controller booted"
        );
        Ok(started)
    }

    /// Handles one heartbeat.
    ///
    /// The latency sample is `server_now_ms - client_timestamp_ms`.
    pub async fn handle_ping(
        &self,
        client_key: Option<&str>,
        client_timestamp_ms: i64,
        server_now_ms: i64,
    ) -> PingOutcome {
        let Some(client_key) = client_key else {
            debug!("ping without client key");
            return PingOutcome::MissingClientKey;
        };
        let Some(worker) = self.registry.lookup_by_client_key(client_key) else {
            debug!("ping from unknown client");
            return PingOutcome::UnknownClient;
        };

        let sample_ms = server_now_ms.saturating_sub(client_timestamp_ms);
        let identity = worker.identity().to_string();
        match self.orchestrator.observe(&worker, sample_ms).await {
            Ok(observation) => {
                debug!(
                    worker = %identity,
                    sample_ms,
                    average_ms = observation.estimate.average_ms,
                    "ping recorded"
                );
                PingOutcome::Recorded {
                    identity,
                    estimate: observation.estimate,
                    trigger: observation.trigger,
                }
            },
            Err(error) => {
                debug!(worker = %identity, %error, "ping rejected");
                PingOutcome::InvalidSample { identity, error }
            },
        }
    }

    /// Restarts a worker on operator request.
    pub async fn restart_worker(
        &self,
        identity: &str,
    ) -> Result<JoinHandle<RestartReport>, ControllerError> {
        let worker = self
            .registry
            .get(identity)
            .ok_or_else(|| ControllerError::UnknownWorker(identity.to_string()))?;
        Ok(self.orchestrator.restart_now(&worker).await?)
    }

    /// Snapshots every worker in registration order.
    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut snapshots = Vec::with_capacity(self.registry.len());
        for worker in self.registry.all() {
            snapshots.push(worker.snapshot().await);
        }
        snapshots
    }

    /// Stops every worker, refusing further restarts.
    ///
    /// Idle workers are stopped at once. Workers with a restart in flight
    /// are stopped once it settles; the sequences are bounded by the runtime
    /// timeouts and end `Stopped` without starting a process. A warning is
    /// logged if they are still running after `grace`. Stop failures are
    /// logged.
    pub async fn shutdown(&self, grace: Duration) {
        self.orchestrator.begin_shutdown();
        let deadline = Instant::now() + grace;
        let mut overdue = false;
        loop {
            let pending = self.stop_all().await;
            if pending == 0 {
                break;
            }
            if !overdue && Instant::now() >= deadline {
                warn!(pending, "restarts still in flight after shutdown grace");
                overdue = true;
            }
            tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
        }
        info!("all workers stopped");
    }

    /// Stops every worker without a restart in flight. Returns the number
    /// of workers still restarting.
    async fn stop_all(&self) -> usize {
        let mut pending = 0;
        for worker in self.registry.all() {
            match self.orchestrator.stop_worker(worker).await {
                Ok(()) => {},
                Err(LifecycleError::AlreadyRestarting(_)) => pending += 1,
                Err(e) => {
                    warn!(worker = %worker.identity(), error = %e, "worker not stopped");
                },
            }
        }
        pending
    }
}
