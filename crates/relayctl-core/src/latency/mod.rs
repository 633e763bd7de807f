//! Latency estimation.
//!
//! Keeps the most recent round-trip samples of a worker in a bounded FIFO
//! window and derives the RTT/timeout pair the worker should be configured
//! with:
//!
//! ```text
//! average   = mean(window)
//! rtt       = (average + latency_margin_ms) * rtt_multiplier
//! timeout   = rtt * timeout_multiplier
//! ```

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default number of samples kept per worker.
pub const DEFAULT_WINDOW_CAPACITY: usize = 50;

/// Default fixed margin added to the average latency, in milliseconds.
pub const DEFAULT_LATENCY_MARGIN_MS: f64 = 10.0;

/// Default multiplier applied to `average + margin`.
pub const DEFAULT_RTT_MULTIPLIER: f64 = 3.0;

/// Default multiplier turning the candidate RTT into a timeout.
pub const DEFAULT_TIMEOUT_MULTIPLIER: f64 = 100.0;

/// Default upper bound for an admissible sample (one minute).
pub const DEFAULT_MAX_SAMPLE_MS: u64 = 60_000;

/// A latency sample that cannot be admitted into the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidSample {
    /// Client clock is ahead of ours or the timestamp is garbage.
    #[error("negative latency sample: {0} ms")]
    Negative(i64),

    /// Sample is larger than any plausible round trip.
    #[error("latency sample of {sample_ms} ms exceeds the {max_ms} ms bound")]
    TooLarge {
        /// Offending sample.
        sample_ms: i64,
        /// Configured bound.
        max_ms: u64,
    },
}

/// Bounded FIFO of round-trip samples in milliseconds.
#[derive(Debug, Clone)]
pub struct PingWindow {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl PingWindow {
    /// Creates an empty window holding at most `capacity` samples.
    ///
    /// A capacity of zero is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a sample, evicting and returning the oldest one when full.
    pub fn push(&mut self, sample_ms: u64) -> Option<u64> {
        let evicted = if self.samples.len() == self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample_ms);
        evicted
    }

    /// Arithmetic mean of the window, `None` while empty.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // window values are far below 2^52
    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().sum();
        Some(sum as f64 / self.samples.len() as f64)
    }

    /// Samples from oldest to newest.
    pub fn samples(&self) -> impl Iterator<Item = u64> + '_ {
        self.samples.iter().copied()
    }

    /// Number of samples currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of samples held.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Tunables of the RTT derivation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyPolicy {
    /// Fixed margin added to the average before multiplying.
    pub latency_margin_ms: f64,
    /// Multiplier from `average + margin` to RTT.
    pub rtt_multiplier: f64,
    /// Multiplier from RTT to timeout.
    pub timeout_multiplier: f64,
    /// Largest admissible sample.
    pub max_sample_ms: u64,
}

impl Default for LatencyPolicy {
    fn default() -> Self {
        Self {
            latency_margin_ms: DEFAULT_LATENCY_MARGIN_MS,
            rtt_multiplier: DEFAULT_RTT_MULTIPLIER,
            timeout_multiplier: DEFAULT_TIMEOUT_MULTIPLIER,
            max_sample_ms: DEFAULT_MAX_SAMPLE_MS,
        }
    }
}

impl LatencyPolicy {
    /// Checks that a raw `server_now - client_timestamp` difference is a
    /// usable latency.
    pub fn validate_sample(&self, sample_ms: i64) -> Result<u64, InvalidSample> {
        let sample = u64::try_from(sample_ms).map_err(|_| InvalidSample::Negative(sample_ms))?;
        if sample > self.max_sample_ms {
            return Err(InvalidSample::TooLarge {
                sample_ms,
                max_ms: self.max_sample_ms,
            });
        }
        Ok(sample)
    }

    /// Derives the candidate RTT and timeout from an average latency.
    #[must_use]
    pub fn estimate(&self, average_ms: f64) -> Estimate {
        let candidate_rtt_ms = (average_ms + self.latency_margin_ms) * self.rtt_multiplier;
        Estimate {
            average_ms,
            candidate_rtt_ms,
            candidate_timeout_ms: candidate_rtt_ms * self.timeout_multiplier,
        }
    }
}

/// Result of folding one sample into a window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Estimate {
    /// Mean of the window after the sample was added.
    pub average_ms: f64,
    /// RTT the worker should run with.
    pub candidate_rtt_ms: f64,
    /// Timeout the worker should run with.
    pub candidate_timeout_ms: f64,
}

/// Validates `sample_ms`, appends it to `window` and derives the new
/// estimate. An invalid sample leaves the window untouched.
pub fn observe(
    window: &mut PingWindow,
    policy: &LatencyPolicy,
    sample_ms: i64,
) -> Result<Estimate, InvalidSample> {
    let sample = policy.validate_sample(sample_ms)?;
    window.push(sample);
    // The window is non-empty after a push.
    let average = window.average().unwrap_or_default();
    Ok(policy.estimate(average))
}
