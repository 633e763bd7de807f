//! Settings.
//!
//! Static settings are read once at boot from a TOML file with three parts:
//! `[controller]` (listener, paths and control-loop constants), `[runtime]`
//! (how worker processes are run, see [`RuntimeConfig`]) and one
//! `[[workers]]` table per client. Relative paths are resolved against the
//! working directory.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::latency::{
    DEFAULT_LATENCY_MARGIN_MS, DEFAULT_MAX_SAMPLE_MS, DEFAULT_RTT_MULTIPLIER,
    DEFAULT_TIMEOUT_MULTIPLIER, DEFAULT_WINDOW_CAPACITY, LatencyPolicy,
};
use crate::materialize::ConfigMaterializer;
use crate::process::RuntimeConfig;
use crate::restart::{
    DEFAULT_BASE_RTT_MS, DEFAULT_BASE_TIMEOUT_MS, DEFAULT_VARIANCE_THRESHOLD, RestartPolicy,
};
use crate::worker::WorkerSpec;

/// Complete settings file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Controller settings.
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Worker runtime settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// One entry per client.
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

impl Settings {
    /// Loads and validates settings from a file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parses and validates settings from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks value ranges that serde cannot express.
    ///
    /// Duplicate ports and identities are left to the worker registry,
    /// which rejects them at registration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.controller.validate()?;

        if self.runtime.start_command.is_empty() {
            return Err(ConfigError::Validation(
                "runtime.start_command must not be empty".to_string(),
            ));
        }

        for worker in &self.workers {
            worker.validate()?;
        }
        Ok(())
    }

    /// Latency derivation parameters.
    #[must_use]
    pub const fn latency_policy(&self) -> LatencyPolicy {
        LatencyPolicy {
            latency_margin_ms: self.controller.latency_margin_ms,
            rtt_multiplier: self.controller.rtt_multiplier,
            timeout_multiplier: self.controller.timeout_multiplier,
            max_sample_ms: self.controller.max_sample_ms,
        }
    }

    /// Restart decision and sequencing parameters.
    #[must_use]
    pub const fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            variance_threshold: self.controller.variance_threshold,
            base_timeout_ms: self.controller.base_timeout_ms,
            base_rtt_ms: self.controller.base_rtt_ms,
            port_poll_interval: self.runtime.port_poll_interval,
            port_release_timeout: self.runtime.port_release_timeout,
        }
    }

    /// Materializer for the configured template and config directory.
    #[must_use]
    pub fn materializer(&self) -> ConfigMaterializer {
        ConfigMaterializer::new(&self.controller.template_path, &self.controller.config_dir)
    }
}

/// Controller settings (`[controller]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// HTTP listen address.
    #[serde(default = "default_http_listen")]
    pub http_listen: SocketAddr,

    /// Base worker config template.
    #[serde(default = "default_template_path")]
    pub template_path: PathBuf,

    /// Directory materialized worker configs are written to.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Latency samples kept per worker.
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,

    /// Relative RTT drift that triggers a restart.
    #[serde(default = "default_variance_threshold")]
    pub variance_threshold: f64,

    /// Multiplier from `average + margin` to RTT.
    #[serde(default = "default_rtt_multiplier")]
    pub rtt_multiplier: f64,

    /// Margin added to the average latency.
    #[serde(default = "default_latency_margin_ms")]
    pub latency_margin_ms: f64,

    /// Multiplier from RTT to timeout.
    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: f64,

    /// Largest admissible latency sample.
    #[serde(default = "default_max_sample_ms")]
    pub max_sample_ms: u64,

    /// Timeout workers boot with.
    #[serde(default = "default_base_timeout_ms")]
    pub base_timeout_ms: u64,

    /// RTT workers boot with.
    #[serde(default = "default_base_rtt_ms")]
    pub base_rtt_ms: u64,

    /// Time after which in-flight restarts at shutdown are reported as
    /// overdue.
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

fn default_http_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

fn default_template_path() -> PathBuf {
    PathBuf::from("config/srt.base.conf")
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("config")
}

const fn default_window_capacity() -> usize {
    DEFAULT_WINDOW_CAPACITY
}

const fn default_variance_threshold() -> f64 {
    DEFAULT_VARIANCE_THRESHOLD
}

const fn default_rtt_multiplier() -> f64 {
    DEFAULT_RTT_MULTIPLIER
}

const fn default_latency_margin_ms() -> f64 {
    DEFAULT_LATENCY_MARGIN_MS
}

const fn default_timeout_multiplier() -> f64 {
    DEFAULT_TIMEOUT_MULTIPLIER
}

const fn default_max_sample_ms() -> u64 {
    DEFAULT_MAX_SAMPLE_MS
}

const fn default_base_timeout_ms() -> u64 {
    DEFAULT_BASE_TIMEOUT_MS
}

const fn default_base_rtt_ms() -> u64 {
    DEFAULT_BASE_RTT_MS
}

const fn default_shutdown_grace() -> Duration {
    Duration::from_secs(15)
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
            template_path: default_template_path(),
            config_dir: default_config_dir(),
            window_capacity: default_window_capacity(),
            variance_threshold: default_variance_threshold(),
            rtt_multiplier: default_rtt_multiplier(),
            latency_margin_ms: default_latency_margin_ms(),
            timeout_multiplier: default_timeout_multiplier(),
            max_sample_ms: default_max_sample_ms(),
            base_timeout_ms: default_base_timeout_ms(),
            base_rtt_ms: default_base_rtt_ms(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl ControllerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.window_capacity == 0 {
            return Err(ConfigError::Validation(
                "controller.window_capacity must be at least 1".to_string(),
            ));
        }
        if !self.variance_threshold.is_finite() || self.variance_threshold < 0.0 {
            return Err(ConfigError::Validation(format!(
                "controller.variance_threshold must be a non-negative number, got {}",
                self.variance_threshold
            )));
        }
        for (name, value) in [
            ("rtt_multiplier", self.rtt_multiplier),
            ("timeout_multiplier", self.timeout_multiplier),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "controller.{name} must be a positive number, got {value}"
                )));
            }
        }
        if !self.latency_margin_ms.is_finite() || self.latency_margin_ms < 0.0 {
            return Err(ConfigError::Validation(format!(
                "controller.latency_margin_ms must be a non-negative number, got {}",
                self.latency_margin_ms
            )));
        }
        Ok(())
    }
}

/// One client's worker (`[[workers]]`).
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Worker identity: process name and config file suffix.
    pub identity: String,
    /// Port exposed to the client.
    pub port: u16,
    /// Key the client presents in `x-client-id`.
    pub client_key: String,
    /// Upper bound for the timeout.
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    /// Lower bound for the RTT.
    #[serde(default)]
    pub min_rtt_ms: u64,
    /// Optional upper bound for the RTT.
    #[serde(default)]
    pub max_rtt_ms: Option<u64>,
    /// Optional value substituted for `STREAM_KEY_HERE`.
    #[serde(default)]
    pub stream_key: Option<String>,
}

const fn default_max_timeout_ms() -> u64 {
    u64::MAX
}

impl WorkerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Validation(format!(
                "worker '{}': port must not be 0",
                self.identity
            )));
        }
        if self.client_key.is_empty() {
            return Err(ConfigError::Validation(format!(
                "worker '{}': client_key must not be empty",
                self.identity
            )));
        }
        if let Some(max_rtt_ms) = self.max_rtt_ms.filter(|max| *max < self.min_rtt_ms) {
            return Err(ConfigError::Validation(format!(
                "worker '{}': max_rtt_ms ({max_rtt_ms}) is below min_rtt_ms ({})",
                self.identity, self.min_rtt_ms
            )));
        }
        Ok(())
    }

    /// Builds the registration data of this worker.
    #[must_use]
    pub fn to_spec(&self) -> WorkerSpec {
        let mut spec = WorkerSpec::new(&self.identity, self.port, &self.client_key)
            .with_max_timeout_ms(self.max_timeout_ms)
            .with_min_rtt_ms(self.min_rtt_ms);
        if let Some(max_rtt_ms) = self.max_rtt_ms {
            spec = spec.with_max_rtt_ms(max_rtt_ms);
        }
        if let Some(stream_key) = &self.stream_key {
            spec = spec.with_stream_key(stream_key);
        }
        spec
    }
}

impl std::fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConfig")
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

/// Settings errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading the settings file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Serde adapter for human-readable durations (`"10s"`, `"250ms"`).
pub(crate) mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
