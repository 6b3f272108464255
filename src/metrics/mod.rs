//! Compression-derived drift metrics: ratios, entropy, and NCD.

pub mod entropy;
pub mod ncd;
pub mod permutation;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::compression::Compressor;
use crate::detect::{DetectError, Result};

pub use entropy::shannon_entropy;
pub use ncd::{frame_events, ncd_from_sizes, NcdComponents, RECORD_TERMINATOR};
pub use permutation::{PermutationResult, PermutationSignificanceTester};

/// Everything measured from one baseline/window pair before any decision
/// is made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionMetrics {
    pub ncd: f64,
    pub baseline_compression_ratio: f64,
    pub window_compression_ratio: f64,
    pub baseline_entropy: f64,
    pub window_entropy: f64,
    pub baseline_len: usize,
    pub window_len: usize,
    pub baseline_compressed_len: usize,
    pub window_compressed_len: usize,
    pub joint_compressed_len: usize,
    pub conditional_novelty: f64,
    pub delta_bits: f64,
}

/// Computes [`CompressionMetrics`] with a fixed compressor backend.
#[derive(Clone)]
pub struct CompressionMetricsEngine {
    compressor: Arc<dyn Compressor>,
}

impl CompressionMetricsEngine {
    pub fn new(compressor: Arc<dyn Compressor>) -> Self {
        Self { compressor }
    }

    pub fn compressor(&self) -> &Arc<dyn Compressor> {
        &self.compressor
    }

    /// Measure two framed buffer images independently and jointly.
    pub fn compute(&self, baseline: &[u8], window: &[u8]) -> Result<CompressionMetrics> {
        let parts = ncd::compute_components(baseline, window, self.compressor.as_ref())?;

        Ok(CompressionMetrics {
            ncd: parts.ncd(),
            baseline_compression_ratio: compression_ratio(
                baseline.len(),
                parts.baseline_compressed,
            )?,
            window_compression_ratio: compression_ratio(window.len(), parts.window_compressed)?,
            baseline_entropy: shannon_entropy(baseline),
            window_entropy: shannon_entropy(window),
            baseline_len: baseline.len(),
            window_len: window.len(),
            baseline_compressed_len: parts.baseline_compressed,
            window_compressed_len: parts.window_compressed,
            joint_compressed_len: parts.joint_compressed,
            conditional_novelty: parts.conditional_novelty(),
            delta_bits: parts.delta_bits(),
        })
    }
}

/// `uncompressed / compressed`. A zero compressed length for non-empty
/// input means the backend is broken.
pub fn compression_ratio(uncompressed: usize, compressed: usize) -> Result<f64> {
    if compressed == 0 {
        return Err(DetectError::InternalFault(format!(
            "compressor returned 0 bytes for {uncompressed} bytes of input"
        )));
    }
    Ok(uncompressed as f64 / compressed as f64)
}
