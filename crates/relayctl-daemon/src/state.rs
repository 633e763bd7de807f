//! Shared daemon state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use relayctl_core::Controller;

use crate::metrics::SharedMetricsRegistry;

/// Daemon state shared by every HTTP handler.
pub type SharedState = Arc<DaemonStateHandle>;

/// Handle to the controller and daemon-level flags.
pub struct DaemonStateHandle {
    controller: Controller,
    /// `None` when metrics are disabled.
    metrics: Option<SharedMetricsRegistry>,
    /// Shutdown flag (atomic for lock-free checking).
    shutdown: AtomicBool,
    started_at: DateTime<Utc>,
}

impl DaemonStateHandle {
    /// Creates a new daemon state handle.
    #[must_use]
    pub fn new(controller: Controller, metrics: Option<SharedMetricsRegistry>) -> Self {
        Self {
            controller,
            metrics,
            shutdown: AtomicBool::new(false),
            started_at: Utc::now(),
        }
    }

    /// The controller.
    #[must_use]
    pub const fn controller(&self) -> &Controller {
        &self.controller
    }

    /// The metrics registry, if metrics are enabled.
    #[must_use]
    pub const fn metrics(&self) -> Option<&SharedMetricsRegistry> {
        self.metrics.as_ref()
    }

    /// Check if shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Get daemon uptime in seconds.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // max(0) ensures non-negative
    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}
