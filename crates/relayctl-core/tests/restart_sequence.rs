//! Restart state machine tests against an instrumented in-memory runtime.

#![allow(clippy::float_cmp)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use relayctl_core::controller::{Controller, PingOutcome};
use relayctl_core::latency::LatencyPolicy;
use relayctl_core::materialize::ConfigMaterializer;
use relayctl_core::process::{
    CommandRuntime, LaunchSpec, ProcessError, ProcessHandle, RuntimeConfig, WorkerRuntime,
};
use relayctl_core::registry::WorkerRegistry;
use relayctl_core::restart::{RestartOrchestrator, RestartOutcome, RestartPolicy, Trigger};
use relayctl_core::worker::{WorkerSpec, WorkerState};
use tempfile::TempDir;
use tokio::sync::Semaphore;

const KEY: &str = "client-a";

/// Runtime recording every call, with switchable failures.
#[derive(Default)]
struct FakeRuntime {
    starts: AtomicUsize,
    stops: AtomicUsize,
    busy: AtomicUsize,
    max_busy: AtomicUsize,
    fail_stop: AtomicBool,
    fail_start: AtomicBool,
    port_held: AtomicBool,
    guarantees_release: bool,
    call_delay: Duration,
    /// When set, `stop` waits for a permit.
    stop_gate: Option<Semaphore>,
}

impl FakeRuntime {
    async fn enter(&self) {
        let now = self.busy.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_busy.fetch_max(now, Ordering::SeqCst);
        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
    }

    fn leave(&self) {
        self.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkerRuntime for FakeRuntime {
    async fn start(&self, launch: LaunchSpec) -> Result<ProcessHandle, ProcessError> {
        self.enter().await;
        self.starts.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail_start.load(Ordering::SeqCst) {
            Err(ProcessError::SpawnFailed("image missing".to_string()))
        } else {
            Ok(ProcessHandle::detached(launch.name, launch.port))
        };
        self.leave();
        result
    }

    async fn stop(&self, _handle: ProcessHandle) -> Result<(), ProcessError> {
        if let Some(gate) = &self.stop_gate {
            let _permit = gate.acquire().await;
        }
        self.enter().await;
        self.stops.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail_stop.load(Ordering::SeqCst) {
            Err(ProcessError::StopFailed("container stuck".to_string()))
        } else {
            Ok(())
        };
        self.leave();
        result
    }

    async fn is_port_free(&self, _port: u16) -> bool {
        !self.port_held.load(Ordering::SeqCst)
    }

    fn guarantees_port_release(&self) -> bool {
        self.guarantees_release
    }
}

struct Harness {
    _dir: TempDir,
    runtime: Arc<FakeRuntime>,
    controller: Controller,
}

/// Window 3, threshold 0.5, multiplier 1, margin 0, workers boot with RTT 0.
async fn harness(runtime: FakeRuntime) -> Harness {
    let dir = TempDir::new().unwrap();
    let template = dir.path().join("srt.base.conf");
    std::fs::write(&template, "latency RTT_HERE;\ntimeout TIMEOUT_HERE;\n").unwrap();

    let runtime = Arc::new(runtime);
    let orchestrator = RestartOrchestrator::new(
        Arc::clone(&runtime) as Arc<dyn WorkerRuntime>,
        ConfigMaterializer::new(template, dir.path().join("generated")),
        LatencyPolicy {
            latency_margin_ms: 0.0,
            rtt_multiplier: 1.0,
            timeout_multiplier: 100.0,
            ..LatencyPolicy::default()
        },
        RestartPolicy {
            variance_threshold: 0.5,
            base_timeout_ms: 0,
            base_rtt_ms: 0,
            port_poll_interval: Duration::from_millis(20),
            port_release_timeout: Duration::from_millis(200),
        },
    );

    let mut registry = WorkerRegistry::new(3);
    registry
        .register(WorkerSpec::new("relay-a", 10080, KEY))
        .unwrap();

    let controller = Controller::new(registry, orchestrator);
    assert_eq!(controller.boot().await.unwrap(), 1);

    Harness {
        _dir: dir,
        runtime,
        controller,
    }
}

impl Harness {
    /// Sends a ping whose latency is `sample_ms`.
    async fn ping(&self, sample_ms: i64) -> PingOutcome {
        self.controller
            .handle_ping(Some(KEY), 1_000_000, 1_000_000 + sample_ms)
            .await
    }

    /// Sends a ping and waits for the restart it triggers, if any.
    async fn ping_and_settle(&self, sample_ms: i64) -> Option<RestartOutcome> {
        match self.ping(sample_ms).await {
            PingOutcome::Recorded {
                trigger: Trigger::Restart { task, .. },
                ..
            } => Some(task.await.unwrap().outcome),
            PingOutcome::Recorded { .. } => None,
            other => panic!("sample not recorded: {other:?}"),
        }
    }

    async fn active_rtt(&self) -> u64 {
        self.controller.snapshot().await[0].active_rtt_ms
    }

    async fn state(&self) -> WorkerState {
        self.controller.snapshot().await[0].state
    }
}

#[tokio::test]
async fn test_first_sample_triggers_when_unconfigured() {
    let h = harness(FakeRuntime::default()).await;
    assert_eq!(h.active_rtt().await, 0);

    assert_eq!(
        h.ping_and_settle(100).await,
        Some(RestartOutcome::Completed)
    );
    assert_eq!(h.active_rtt().await, 100);
    assert_eq!(h.state().await, WorkerState::Running);
    assert_eq!(h.runtime.stops.load(Ordering::SeqCst), 1);
    assert_eq!(h.runtime.starts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_drift_scenario_with_failed_stop() {
    let h = harness(FakeRuntime::default()).await;

    // [100] -> restart to 100; [100, 100, 100] -> no drift.
    assert_eq!(
        h.ping_and_settle(100).await,
        Some(RestartOutcome::Completed)
    );
    assert_eq!(h.ping_and_settle(100).await, None);
    assert_eq!(h.ping_and_settle(100).await, None);
    assert_eq!(h.active_rtt().await, 100);

    // [100, 100, 120] -> avg 106.67, variance 0.0667 < 0.5.
    match h.ping(120).await {
        PingOutcome::Recorded {
            estimate,
            trigger: Trigger::Hold { variance },
            ..
        } => {
            assert!((estimate.average_ms - 106.666).abs() < 0.01);
            assert!((variance - 0.0667).abs() < 0.001);
        },
        other => panic!("expected hold, got {other:?}"),
    }

    // [100, 120, 500] -> avg 240, variance 1.4; the stop fails.
    h.runtime.fail_stop.store(true, Ordering::SeqCst);
    let (variance, task) = match h.ping(500).await {
        PingOutcome::Recorded {
            estimate,
            trigger: Trigger::Restart { variance, task },
            ..
        } => {
            assert_eq!(estimate.average_ms, 240.0);
            (variance, task)
        },
        other => panic!("expected restart, got {other:?}"),
    };
    assert!((variance.unwrap() - 1.4).abs() < 1e-9);

    let report = task.await.unwrap();
    assert_eq!(report.outcome, RestartOutcome::StopFailed);
    assert_eq!(report.effective_rtt_ms, Some(240));
    assert_eq!(h.state().await, WorkerState::Stopped);
    // Updated before the new process ran.
    assert_eq!(h.active_rtt().await, 240);
    assert_eq!(h.runtime.starts.load(Ordering::SeqCst), 2);

    // Telemetry never revives a stopped worker.
    h.runtime.fail_stop.store(false, Ordering::SeqCst);
    match h.ping(10).await {
        PingOutcome::Recorded {
            trigger: Trigger::Deferred { state },
            ..
        } => assert_eq!(state, WorkerState::Stopped),
        other => panic!("expected deferred, got {other:?}"),
    }
    assert_eq!(h.controller.snapshot().await[0].restart_count, 2);
}

#[tokio::test]
async fn test_port_never_released_aborts_before_start() {
    let h = harness(FakeRuntime::default()).await;
    h.runtime.port_held.store(true, Ordering::SeqCst);

    assert_eq!(
        h.ping_and_settle(100).await,
        Some(RestartOutcome::PortNotReleased)
    );
    assert_eq!(h.runtime.stops.load(Ordering::SeqCst), 1);
    // Only the boot start.
    assert_eq!(h.runtime.starts.load(Ordering::SeqCst), 1);
    assert_eq!(h.state().await, WorkerState::Stopped);

    let last = h.controller.snapshot().await[0].last_restart.clone().unwrap();
    assert!(last.error.unwrap().contains("10080"));
}

#[tokio::test]
async fn test_runtime_guaranteeing_release_skips_port_poll() {
    let h = harness(FakeRuntime {
        guarantees_release: true,
        ..FakeRuntime::default()
    })
    .await;
    h.runtime.port_held.store(true, Ordering::SeqCst);

    assert_eq!(
        h.ping_and_settle(100).await,
        Some(RestartOutcome::Completed)
    );
    assert_eq!(h.state().await, WorkerState::Running);
}

#[tokio::test]
async fn test_failed_start_leaves_stopped() {
    let h = harness(FakeRuntime::default()).await;
    h.runtime.fail_start.store(true, Ordering::SeqCst);

    assert_eq!(
        h.ping_and_settle(100).await,
        Some(RestartOutcome::StartFailed)
    );
    let snapshot = &h.controller.snapshot().await[0];
    assert_eq!(snapshot.state, WorkerState::Stopped);
    assert_eq!(snapshot.pid, None);
    assert_eq!(snapshot.active_rtt_ms, 100);

    // An operator restart brings it back.
    h.runtime.fail_start.store(false, Ordering::SeqCst);
    let report = h
        .controller
        .restart_worker("relay-a")
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(report.outcome, RestartOutcome::Completed);
    assert_eq!(h.state().await, WorkerState::Running);
}

#[tokio::test]
async fn test_ping_does_not_wait_for_restart() {
    let h = harness(FakeRuntime {
        stop_gate: Some(Semaphore::new(0)),
        ..FakeRuntime::default()
    })
    .await;

    let task = match h.ping(100).await {
        PingOutcome::Recorded {
            trigger: Trigger::Restart { task, .. },
            ..
        } => task,
        other => panic!("expected restart, got {other:?}"),
    };
    assert_eq!(h.state().await, WorkerState::Restarting);

    // A second drifting sample is recorded but cannot claim the worker.
    match h.ping(900).await {
        PingOutcome::Recorded {
            trigger: Trigger::Deferred { state },
            ..
        } => assert_eq!(state, WorkerState::Restarting),
        other => panic!("expected deferred, got {other:?}"),
    }
    assert!(h.controller.restart_worker("relay-a").await.is_err());

    if let Some(gate) = &h.runtime.stop_gate {
        gate.add_permits(1);
    }
    assert_eq!(task.await.unwrap().outcome, RestartOutcome::Completed);
    assert_eq!(h.controller.snapshot().await[0].samples, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_overlapping_restarts_under_concurrent_telemetry() {
    let h = Arc::new(
        harness(FakeRuntime {
            call_delay: Duration::from_millis(5),
            ..FakeRuntime::default()
        })
        .await,
    );

    let mut pings = Vec::new();
    for i in 0..64_i64 {
        let h = Arc::clone(&h);
        pings.push(tokio::spawn(async move {
            let sample = if i % 2 == 0 { 10 } else { 2_000 };
            h.ping(sample).await
        }));
    }

    let mut restarts = Vec::new();
    for ping in pings {
        if let PingOutcome::Recorded {
            trigger: Trigger::Restart { task, .. },
            ..
        } = ping.await.unwrap()
        {
            restarts.push(task);
        }
    }
    assert!(!restarts.is_empty());
    for task in restarts {
        assert_eq!(task.await.unwrap().outcome, RestartOutcome::Completed);
    }

    assert_eq!(h.runtime.max_busy.load(Ordering::SeqCst), 1);
    assert_eq!(h.state().await, WorkerState::Running);
    assert!(h.controller.snapshot().await[0].samples <= 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_waits_for_restart_in_flight() {
    let h = Arc::new(
        harness(FakeRuntime {
            stop_gate: Some(Semaphore::new(0)),
            ..FakeRuntime::default()
        })
        .await,
    );

    let task = match h.ping(100).await {
        PingOutcome::Recorded {
            trigger: Trigger::Restart { task, .. },
            ..
        } => task,
        other => panic!("expected restart, got {other:?}"),
    };

    let shutdown = {
        let h = Arc::clone(&h);
        tokio::spawn(async move {
            h.controller.shutdown(Duration::from_millis(50)).await;
        })
    };
    // Past the grace period, shutdown still waits for the sequence.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!shutdown.is_finished());
    assert_eq!(h.state().await, WorkerState::Restarting);

    if let Some(gate) = &h.runtime.stop_gate {
        gate.add_permits(1);
    }
    tokio::time::timeout(Duration::from_secs(5), shutdown)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(task.await.unwrap().outcome, RestartOutcome::Cancelled);
    let snapshot = &h.controller.snapshot().await[0];
    assert_eq!(snapshot.state, WorkerState::Stopped);
    assert_eq!(snapshot.pid, None);
    // Only the boot start; the cancelled sequence never launched a process.
    assert_eq!(h.runtime.starts.load(Ordering::SeqCst), 1);

    // Late telemetry cannot start anything either.
    assert!(matches!(
        h.ping(5_000).await,
        PingOutcome::Recorded {
            trigger: Trigger::Deferred { .. },
            ..
        }
    ));
    assert!(h.controller.restart_worker("relay-a").await.is_err());
}

/// Controller over a command runtime whose worker process exits at once.
async fn exiting_worker(dir: &TempDir) -> Controller {
    let template = dir.path().join("srt.base.conf");
    std::fs::write(&template, "latency RTT_HERE;\n").unwrap();

    let runtime = CommandRuntime::new(RuntimeConfig {
        start_command: ["sh", "-c", "exit 1"].map(String::from).to_vec(),
        stop_command: Vec::new(),
        stop_timeout: Duration::from_secs(2),
        ..RuntimeConfig::default()
    });
    let orchestrator = RestartOrchestrator::new(
        Arc::new(runtime),
        ConfigMaterializer::new(template, dir.path().join("generated")),
        LatencyPolicy::default(),
        RestartPolicy::default(),
    );
    // The restart polls the real port; keep clear of common ones.
    let mut registry = WorkerRegistry::new(3);
    registry
        .register(WorkerSpec::new("relay-a", 47_913, KEY))
        .unwrap();
    Controller::new(registry, orchestrator)
}

async fn wait_for_state(controller: &Controller, expected: WorkerState) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while controller.snapshot().await[0].state != expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "worker never reached {expected}");
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn test_exited_process_leaves_worker_stopped() {
    let dir = TempDir::new().unwrap();
    let controller = exiting_worker(&dir).await;

    // Launching succeeds; the process dies right after.
    assert_eq!(controller.boot().await.unwrap(), 1);
    wait_for_state(&controller, WorkerState::Stopped).await;
    assert_eq!(controller.snapshot().await[0].pid, None);

    match controller.handle_ping(Some(KEY), 1_000, 1_050).await {
        PingOutcome::Recorded {
            trigger: Trigger::Deferred { state },
            ..
        } => assert_eq!(state, WorkerState::Stopped),
        other => panic!("expected deferred, got {other:?}"),
    }

    // A process started by a restart is watched the same way.
    let report = controller
        .restart_worker("relay-a")
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(report.outcome, RestartOutcome::Completed);
    wait_for_state(&controller, WorkerState::Stopped).await;
    assert_eq!(controller.snapshot().await[0].restart_count, 1);
}
