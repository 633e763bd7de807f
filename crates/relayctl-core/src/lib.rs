//! relayctl-core - adaptive RTT control loop for supervised relay workers.
//!
//! Each configured client owns one relay worker process. Clients report
//! heartbeat timestamps; the controller turns those into round-trip latency
//! samples, keeps a bounded sliding window per worker, derives a candidate
//! RTT/timeout pair and, when the candidate drifts far enough from the RTT
//! the running worker was configured with, swaps the worker for a
//! reconfigured one.
//!
//! # Modules
//!
//! - [`config`]: TOML settings (controller constants, runtime, workers)
//! - [`worker`]: per-worker identity, clamps and lock-protected live state
//! - [`registry`]: the fixed set of workers, unique ports and identities
//! - [`latency`]: sliding window and candidate RTT/timeout derivation
//! - [`materialize`]: clamping and rendering of the worker config file
//! - [`process`]: worker runtime seam, process spawning and port probing
//! - [`restart`]: restart trigger and the stop → reconfigure → start sequence
//! - [`controller`]: telemetry entry point, boot and shutdown
//!
//! # Runtime Requirements
//!
//! Restart sequences run as spawned tokio tasks, so telemetry must be handled
//! from within a tokio runtime.

pub mod config;
pub mod controller;
pub mod latency;
pub mod materialize;
pub mod process;
pub mod registry;
pub mod restart;
pub mod worker;

pub use controller::{Controller, PingOutcome};
pub use registry::WorkerRegistry;
pub use worker::{Worker, WorkerSpec, WorkerState};
