//! driftwatch -- Compression-based drift and anomaly detection for event streams.
//!
//! A rolling baseline of recent events is compared against a rolling
//! analysis window using Normalized Compression Distance, compression
//! ratios and byte entropy. A seeded permutation test gives the observed
//! distance a p-value, and a composite policy turns the evidence into an
//! explained verdict. Around that core sit numeric outlier tracking,
//! high-entropy token normalization, adaptive window sizing, and a
//! feedback-driven threshold tuner.

pub mod adaptive;
pub mod autotune;
pub mod compression;
pub mod config;
pub mod detect;
pub mod metrics;
pub mod numeric;
pub mod privacy;
pub mod tokenizer;

pub use config::{DetectionProfile, DetectorConfig, EngineConfig};
pub use detect::{
    DetectError, DetectionOutcome, DetectionRecord, EnhancedMetrics, IngestOutcome, Result,
    StreamManager, StreamingDetector,
};
