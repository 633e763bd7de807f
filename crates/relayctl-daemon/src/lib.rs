//! relayctl-daemon library.
//!
//! HTTP surface, metrics and shared state of the relay controller daemon.
//! The binary in `main.rs` wires them to a [`relayctl_core::Controller`].

pub mod http;
pub mod metrics;
pub mod state;
