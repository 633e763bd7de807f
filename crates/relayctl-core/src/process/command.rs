//! Command-line worker runtime.
//!
//! Runs each worker through an external command built from argument
//! templates. The defaults run the SRS relay image under docker:
//!
//! ```text
//! docker run --rm --name {name} -p {port}:10080/udp \
//!     -v {config}:/config/srt.conf ossrs/srs:5 ./objs/srs -c /config/srt.conf
//! docker rm --force {name}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    DEFAULT_PORT_POLL_INTERVAL, DEFAULT_PORT_RELEASE_TIMEOUT, LaunchSpec, PortProbe,
    ProcessError, ProcessHandle, WorkerRuntime, probe_port, spawner,
};
use crate::config::humantime_serde;

/// Replaced by the worker identity in command templates.
pub const NAME_PLACEHOLDER: &str = "{name}";
/// Replaced by the worker port in command templates.
pub const PORT_PLACEHOLDER: &str = "{port}";
/// Replaced by the materialized config path in command templates.
pub const CONFIG_PLACEHOLDER: &str = "{config}";

/// Worker runtime configuration (`[runtime]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Program and arguments launching one worker.
    #[serde(default = "default_start_command")]
    pub start_command: Vec<String>,

    /// Program and arguments tearing one worker down. Empty means the
    /// spawned process is only signalled.
    #[serde(default = "default_stop_command")]
    pub stop_command: Vec<String>,

    /// Bound on the stop command and on SIGTERM before SIGKILL.
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,

    /// Interval between port-release probes.
    #[serde(default = "default_port_poll_interval", with = "humantime_serde")]
    pub port_poll_interval: Duration,

    /// Bound on waiting for the port to be released after a stop.
    #[serde(default = "default_port_release_timeout", with = "humantime_serde")]
    pub port_release_timeout: Duration,

    /// Protocols the worker port is published on, probed after a stop.
    #[serde(default)]
    pub port_probe: PortProbe,
}

fn default_start_command() -> Vec<String> {
    [
        "docker",
        "run",
        "--rm",
        "--name",
        NAME_PLACEHOLDER,
        "-p",
        "{port}:10080/udp",
        "-v",
        "{config}:/config/srt.conf",
        "ossrs/srs:5",
        "./objs/srs",
        "-c",
        "/config/srt.conf",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

fn default_stop_command() -> Vec<String> {
    ["docker", "rm", "--force", NAME_PLACEHOLDER]
        .iter()
        .map(ToString::to_string)
        .collect()
}

const fn default_stop_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_port_poll_interval() -> Duration {
    DEFAULT_PORT_POLL_INTERVAL
}

const fn default_port_release_timeout() -> Duration {
    DEFAULT_PORT_RELEASE_TIMEOUT
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            start_command: default_start_command(),
            stop_command: default_stop_command(),
            stop_timeout: default_stop_timeout(),
            port_poll_interval: default_port_poll_interval(),
            port_release_timeout: default_port_release_timeout(),
            port_probe: PortProbe::default(),
        }
    }
}

/// Expands the placeholders of a command template for one worker.
///
/// `{config}` becomes an absolute path, as bind mounts require.
#[must_use]
pub fn expand(template: &[String], launch: &LaunchSpec) -> Vec<String> {
    let port = launch.port.to_string();
    let config = std::path::absolute(&launch.config_path)
        .unwrap_or_else(|_| launch.config_path.clone())
        .display()
        .to_string();
    template
        .iter()
        .map(|arg| {
            arg.replace(NAME_PLACEHOLDER, &launch.name)
                .replace(PORT_PLACEHOLDER, &port)
                .replace(CONFIG_PLACEHOLDER, &config)
        })
        .collect()
}

/// Runs workers as external commands.
#[derive(Debug, Clone)]
pub struct CommandRuntime {
    config: RuntimeConfig,
}

impl CommandRuntime {
    /// Creates a runtime from its configuration.
    #[must_use]
    pub const fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// The runtime configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

#[async_trait]
impl WorkerRuntime for CommandRuntime {
    async fn start(&self, launch: LaunchSpec) -> Result<ProcessHandle, ProcessError> {
        let argv = expand(&self.config.start_command, &launch);
        let Some((program, args)) = argv.split_first() else {
            return Err(ProcessError::SpawnFailed(
                "start command is empty".to_string(),
            ));
        };

        let spawned = spawner::spawn(&launch.name, program, args)?;
        info!(
            worker = %launch.name,
            port = launch.port,
            pid = spawned.pid(),
            "worker process launched"
        );
        Ok(ProcessHandle::from_child(
            launch.name,
            launch.port,
            spawned,
        ))
    }

    async fn stop(&self, mut handle: ProcessHandle) -> Result<(), ProcessError> {
        let launch = LaunchSpec {
            name: handle.name().to_string(),
            port: handle.port(),
            config_path: std::path::PathBuf::new(),
        };

        let mut result = Ok(());
        if let Some((program, args)) = expand(&self.config.stop_command, &launch).split_first() {
            debug!(worker = %launch.name, %program, "running stop command");
            result = spawner::run_bounded(program, args, self.config.stop_timeout).await;
        }

        // The launcher process goes either way; a failed stop command is
        // still reported.
        if let Some(child) = handle.take_child() {
            let terminated = spawner::terminate(child, self.config.stop_timeout).await;
            result = result.and(terminated);
        }

        if result.is_ok() {
            info!(worker = %launch.name, "worker process stopped");
        }
        result
    }

    async fn is_port_free(&self, port: u16) -> bool {
        probe_port(port, self.config.port_probe).await
    }
}
