//! Worker config materialization.
//!
//! Turns a requested (timeout, RTT) pair into the text configuration a relay
//! worker reads at start, applying the worker's clamps:
//!
//! 1. `timeout = min(requested_timeout, max_timeout)`
//! 2. `rtt = max(requested_rtt, min_rtt)`
//! 3. `rtt = min(rtt, max_rtt)` when `max_rtt` is set
//!
//! Workers take whole milliseconds, so requested values are rounded before
//! clamping. The base template is re-read on every call.

use std::io::Write;
use std::path::{Path, PathBuf};

use secrecy::ExposeSecret;
use thiserror::Error;
use tracing::debug;

use crate::worker::WorkerSpec;

/// Replaced by the clamped timeout.
pub const TIMEOUT_TOKEN: &str = "TIMEOUT_HERE";
/// Replaced by the clamped RTT.
pub const RTT_TOKEN: &str = "RTT_HERE";
/// Replaced by the worker identity.
pub const NAME_TOKEN: &str = "NAME_HERE";
/// Replaced by the stream key, or nothing when the worker has none.
pub const STREAM_KEY_TOKEN: &str = "STREAM_KEY_HERE";

/// Materialization failure.
#[derive(Debug, Error)]
pub enum MaterializeError {
    /// The base template could not be read.
    #[error("config template {path} is unavailable: {source}")]
    TemplateUnavailable {
        /// Template path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The rendered config could not be written.
    #[error("failed to write worker config {path}: {source}")]
    WriteFailed {
        /// Destination path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Clamped timing values, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clamped {
    /// Effective timeout.
    pub timeout_ms: u64,
    /// Effective RTT.
    pub rtt_ms: u64,
}

/// Output of [`ConfigMaterializer::materialize`].
#[derive(Debug, Clone)]
pub struct Materialized {
    /// Rendered configuration text.
    pub text: String,
    /// File the text was written to.
    pub path: PathBuf,
    /// Effective (clamped) RTT; becomes the worker's active RTT.
    pub effective_rtt_ms: u64,
    /// Effective (clamped) timeout.
    pub effective_timeout_ms: u64,
}

/// Rounds a derived millisecond value, mapping NaN and negatives to zero.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // saturating by construction
pub fn round_ms(value: f64) -> u64 {
    if value.is_nan() || value <= 0.0 {
        0
    } else {
        value.round() as u64
    }
}

/// Applies the worker clamps to a requested pair.
#[must_use]
pub fn clamp(spec: &WorkerSpec, requested_timeout_ms: f64, requested_rtt_ms: f64) -> Clamped {
    let timeout_ms = round_ms(requested_timeout_ms).min(spec.max_timeout_ms);
    let mut rtt_ms = round_ms(requested_rtt_ms).max(spec.min_rtt_ms);
    if let Some(max_rtt_ms) = spec.max_rtt_ms {
        rtt_ms = rtt_ms.min(max_rtt_ms);
    }
    Clamped { timeout_ms, rtt_ms }
}

/// Substitutes the clamped values and worker identity into `template`.
#[must_use]
pub fn render(template: &str, spec: &WorkerSpec, clamped: Clamped) -> String {
    let stream_key = spec
        .stream_key
        .as_ref()
        .map_or("", |key| key.expose_secret());
    template
        .replace(TIMEOUT_TOKEN, &clamped.timeout_ms.to_string())
        .replace(RTT_TOKEN, &clamped.rtt_ms.to_string())
        .replace(NAME_TOKEN, &spec.identity)
        .replace(STREAM_KEY_TOKEN, stream_key)
}

/// Renders worker configs from a base template into a config directory.
#[derive(Debug, Clone)]
pub struct ConfigMaterializer {
    template_path: PathBuf,
    config_dir: PathBuf,
}

impl ConfigMaterializer {
    /// Creates a materializer reading `template_path` and writing into
    /// `config_dir`.
    #[must_use]
    pub fn new(template_path: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            template_path: template_path.into(),
            config_dir: config_dir.into(),
        }
    }

    /// Base template path.
    #[must_use]
    pub fn template_path(&self) -> &Path {
        &self.template_path
    }

    /// Where the config of worker `identity` is written.
    #[must_use]
    pub fn config_path(&self, identity: &str) -> PathBuf {
        self.config_dir.join(format!("srt_{identity}.conf"))
    }

    /// Verifies the template is readable and the config directory exists.
    pub fn check(&self) -> Result<(), MaterializeError> {
        self.read_template()?;
        std::fs::create_dir_all(&self.config_dir).map_err(|source| {
            MaterializeError::WriteFailed {
                path: self.config_dir.clone(),
                source,
            }
        })
    }

    /// Clamps, renders and atomically writes the config of `spec`.
    pub fn materialize(
        &self,
        spec: &WorkerSpec,
        requested_timeout_ms: f64,
        requested_rtt_ms: f64,
    ) -> Result<Materialized, MaterializeError> {
        let template = self.read_template()?;
        let clamped = clamp(spec, requested_timeout_ms, requested_rtt_ms);
        let text = render(&template, spec, clamped);
        let path = self.config_path(&spec.identity);

        self.write_atomic(&path, &text)
            .map_err(|source| MaterializeError::WriteFailed {
                path: path.clone(),
                source,
            })?;

        debug!(
            worker = %spec.identity,
            path = %path.display(),
            rtt_ms = clamped.rtt_ms,
            timeout_ms = clamped.timeout_ms,
            "worker config written"
        );

        Ok(Materialized {
            text,
            path,
            effective_rtt_ms: clamped.rtt_ms,
            effective_timeout_ms: clamped.timeout_ms,
        })
    }

    fn read_template(&self) -> Result<String, MaterializeError> {
        std::fs::read_to_string(&self.template_path).map_err(|source| {
            MaterializeError::TemplateUnavailable {
                path: self.template_path.clone(),
                source,
            }
        })
    }

    // A running worker may re-read its config at any time; never expose a
    // half-written file.
    fn write_atomic(&self, path: &Path, text: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.config_dir)?;
        tmp.write_all(text.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}
