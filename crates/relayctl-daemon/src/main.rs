//! relayctl-daemon - adaptive relay worker controller.
//!
//! Loads the settings, boots every configured relay worker, then serves
//! client telemetry until SIGTERM/SIGINT, at which point in-flight restarts
//! are allowed to settle and every worker is stopped.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relayctl_core::Controller;
use relayctl_core::config::Settings;
use relayctl_core::process::{CommandRuntime, WorkerRuntime};
use relayctl_core::restart::{NoopListener, RestartListener};
use relayctl_daemon::http;
use relayctl_daemon::metrics::new_shared_registry;
use relayctl_daemon::state::{DaemonStateHandle, SharedState};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// relayctl daemon - adaptive RTT controller for relay workers
#[derive(Parser, Debug)]
#[command(name = "relayctl-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the settings file
    #[arg(short, long, default_value = "relayctl.toml")]
    config: PathBuf,

    /// Override `controller.http_listen`
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Disable the Prometheus `/metrics` endpoint
    #[arg(long)]
    no_metrics: bool,
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let settings = Settings::from_file(&args.config)
        .with_context(|| format!("failed to load settings from {}", args.config.display()))?;
    info!(
        config = %args.config.display(),
        workers = settings.workers.len(),
        "settings loaded"
    );

    let metrics = if args.no_metrics {
        info!("Metrics endpoint disabled");
        None
    } else {
        Some(new_shared_registry().context("failed to create metrics registry")?)
    };
    let listener: Arc<dyn RestartListener> = match &metrics {
        Some(registry) => Arc::new(registry.metrics().clone()),
        None => Arc::new(NoopListener),
    };

    let runtime: Arc<dyn WorkerRuntime> = Arc::new(CommandRuntime::new(settings.runtime.clone()));
    let controller = Controller::from_settings(&settings, runtime, listener)
        .context("invalid worker configuration")?;
    controller.boot().await.context("boot failed")?;

    let state: SharedState = Arc::new(DaemonStateHandle::new(controller, metrics));
    let result = serve(&state, args.listen.unwrap_or(settings.controller.http_listen)).await;

    info!("shutting down workers");
    state
        .controller()
        .shutdown(settings.controller.shutdown_grace)
        .await;
    result
}

/// Serves the HTTP surface until SIGTERM or SIGINT.
async fn serve(state: &SharedState, addr: SocketAddr) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "HTTP server listening");

    let signal_state = Arc::clone(state);
    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
        signal_state.request_shutdown();
    };

    axum::serve(listener, http::router(Arc::clone(state)))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")
}
