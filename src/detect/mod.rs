//! Streaming drift detection: bounded buffers, decision policy, and
//! per-stream routing.

pub mod detector;
pub mod policy;
pub mod streams;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use detector::{DetectorStats, IngestOutcome, StreamingDetector};
pub use policy::{AnomalyDecisionPolicy, Decision};
pub use streams::{DetectionRecord, StreamManager};

/// Errors surfaced by the detection core.
///
/// Buffer and configuration errors are meant for local handling by the
/// caller (log and skip). `InternalFault` means a backend misbehaved and
/// the current detection attempt is void.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("empty input")]
    EmptyInput,

    #[error("detector not ready: need {needed} events, have {have}")]
    NotReady { needed: usize, have: usize },

    #[error("internal fault: {0}")]
    InternalFault(String),
}

pub type Result<T> = std::result::Result<T, DetectError>;

/// Full result of one detection cycle.
///
/// Produced fresh by every `detect` call and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedMetrics {
    pub ncd: f64,
    pub p_value: f64,
    pub baseline_compression_ratio: f64,
    pub window_compression_ratio: f64,
    /// Bits per byte, 0..=8.
    pub baseline_entropy: f64,
    pub window_entropy: f64,
    pub is_anomaly: bool,
    pub confidence_level: f64,
    pub is_statistically_significant: bool,
    /// Relative change, `(window - baseline) / baseline`.
    pub compression_ratio_change: f64,
    /// Absolute change in bits per byte.
    pub entropy_change: f64,
    pub composite_score: f64,
    pub conditional_novelty: f64,
    pub permutation_count: usize,
    pub explanation: String,
    pub recommended_ncd_threshold: f64,
    pub recommended_window_size: usize,
    pub data_stability_score: f64,
}

/// What the detection boundary hands back to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionOutcome {
    pub is_anomaly: bool,
    pub metrics: EnhancedMetrics,
}

impl From<EnhancedMetrics> for DetectionOutcome {
    fn from(metrics: EnhancedMetrics) -> Self {
        Self {
            is_anomaly: metrics.is_anomaly,
            metrics,
        }
    }
}
