//! Prometheus metrics for the controller.
//!
//! | Metric | Type | Description | Labels |
//! |--------|------|-------------|--------|
//! | `relayctl_ping_samples_total` | Counter | Telemetry messages by outcome | `outcome` |
//! | `relayctl_restarts_total` | Counter | Finished restart sequences | `worker`, `outcome` |
//! | `relayctl_worker_active_rtt_ms` | Gauge | RTT of the running config | `worker` |
//! | `relayctl_worker_average_ping_ms` | Gauge | Mean of the latency window | `worker` |
//!
//! Counters are fed as events happen; the per-worker gauges are refreshed
//! from controller snapshots right before each scrape.

use std::sync::Arc;

use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use relayctl_core::restart::{RestartListener, RestartReport};
use relayctl_core::worker::WorkerSnapshot;
use thiserror::Error;

/// Maximum length for label values.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Controller metrics. Cheap to clone; all clones share the same series.
#[derive(Clone)]
pub struct ControllerMetrics {
    ping_samples_total: CounterVec,
    restarts_total: CounterVec,
    active_rtt_ms: GaugeVec,
    average_ping_ms: GaugeVec,
}

impl ControllerMetrics {
    /// Creates the metrics and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate name).
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let ping_samples_total = CounterVec::new(
            Opts::new(
                "relayctl_ping_samples_total",
                "Telemetry messages received, by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(ping_samples_total.clone()))?;

        let restarts_total = CounterVec::new(
            Opts::new(
                "relayctl_restarts_total",
                "Finished restart sequences, by worker and outcome",
            ),
            &["worker", "outcome"],
        )?;
        registry.register(Box::new(restarts_total.clone()))?;

        let active_rtt_ms = GaugeVec::new(
            Opts::new(
                "relayctl_worker_active_rtt_ms",
                "RTT the worker's current config was written with",
            ),
            &["worker"],
        )?;
        registry.register(Box::new(active_rtt_ms.clone()))?;

        let average_ping_ms = GaugeVec::new(
            Opts::new(
                "relayctl_worker_average_ping_ms",
                "Mean of the worker's latency window",
            ),
            &["worker"],
        )?;
        registry.register(Box::new(average_ping_ms.clone()))?;

        Ok(Self {
            ping_samples_total,
            restarts_total,
            active_rtt_ms,
            average_ping_ms,
        })
    }

    /// Counts one telemetry message.
    pub fn ping_received(&self, outcome: &str) {
        self.ping_samples_total
            .with_label_values(&[truncate_label(outcome)])
            .inc();
    }

    /// Returns the telemetry count for an outcome. Useful in tests.
    #[must_use]
    pub fn ping_count(&self, outcome: &str) -> f64 {
        self.ping_samples_total
            .with_label_values(&[truncate_label(outcome)])
            .get()
    }

    /// Returns the restart count for a worker and outcome. Useful in tests.
    #[must_use]
    pub fn restart_count(&self, worker: &str, outcome: &str) -> f64 {
        self.restarts_total
            .with_label_values(&[truncate_label(worker), truncate_label(outcome)])
            .get()
    }

    /// Refreshes the per-worker gauges.
    #[allow(clippy::cast_precision_loss)]
    pub fn observe_workers(&self, snapshots: &[WorkerSnapshot]) {
        for snapshot in snapshots {
            let worker = truncate_label(&snapshot.identity);
            self.active_rtt_ms
                .with_label_values(&[worker])
                .set(snapshot.active_rtt_ms as f64);
            if let Some(average) = snapshot.average_ping_ms {
                self.average_ping_ms
                    .with_label_values(&[worker])
                    .set(average);
            }
        }
    }
}

impl RestartListener for ControllerMetrics {
    fn restart_finished(&self, report: &RestartReport) {
        self.restarts_total
            .with_label_values(&[
                truncate_label(&report.identity),
                report.outcome.as_str(),
            ])
            .inc();
    }
}

/// Prometheus registry together with the controller metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    metrics: ControllerMetrics,
}

impl MetricsRegistry {
    /// Creates a registry with all controller metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let metrics = ControllerMetrics::new(&registry)?;
        Ok(Self { registry, metrics })
    }

    /// The controller metrics.
    #[must_use]
    pub const fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Shared metrics registry.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// Creates a new shared metrics registry.
///
/// # Errors
///
/// Returns an error if metric registration fails.
pub fn new_shared_registry() -> MetricsResult<SharedMetricsRegistry> {
    Ok(Arc::new(MetricsRegistry::new()?))
}

/// Truncates a label value on a UTF-8 boundary at or before
/// [`MAX_LABEL_VALUE_LEN`] bytes.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        value
    } else {
        let end = value
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
            .last()
            .unwrap_or(0);
        &value[..end]
    }
}
