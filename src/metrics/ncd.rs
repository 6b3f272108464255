//! Normalized Compression Distance.
//!
//! `NCD(x, y) = (C(x‖y) − min(C(x), C(y))) / max(C(x), C(y))`
//!
//! Both sides are serialized with the same record framing (every event is
//! followed by [`RECORD_TERMINATOR`]), so `x‖y` is the plain back-to-back
//! join of two framed images. No separator byte is inserted between them,
//! and the only boundary the compressor ever sees is one that already
//! occurs inside each side.

use crate::compression::Compressor;
use crate::detect::{DetectError, Result};

/// Byte appended after every event when building a buffer image.
pub const RECORD_TERMINATOR: u8 = b'\n';

/// Serialize events into one newline-terminated record image.
pub fn frame_events<I, E>(events: I) -> Vec<u8>
where
    I: IntoIterator<Item = E>,
    E: AsRef<[u8]>,
{
    let mut out = Vec::new();
    for event in events {
        out.extend_from_slice(event.as_ref());
        out.push(RECORD_TERMINATOR);
    }
    out
}

/// The three compressed sizes an NCD is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NcdComponents {
    pub baseline_compressed: usize,
    pub window_compressed: usize,
    pub joint_compressed: usize,
}

impl NcdComponents {
    pub fn ncd(&self) -> f64 {
        ncd_from_sizes(
            self.baseline_compressed,
            self.window_compressed,
            self.joint_compressed,
        )
    }

    /// `(C(b‖w) − C(b)) / C(w)`: how much of the window is new information
    /// given the baseline. Lower means more expected.
    pub fn conditional_novelty(&self) -> f64 {
        if self.window_compressed == 0 {
            return 0.0;
        }
        let extra = self.joint_compressed as f64 - self.baseline_compressed as f64;
        (extra / self.window_compressed as f64).max(0.0)
    }

    /// `C(b‖w) − (C(b) + C(w))`. Negative when the two sides share structure.
    pub fn delta_bits(&self) -> f64 {
        self.joint_compressed as f64
            - (self.baseline_compressed as f64 + self.window_compressed as f64)
    }
}

/// NCD from precomputed sizes, clamped to `[0, 1]`.
///
/// Real compressors carry header overhead, so `C(x‖y)` can come out
/// slightly below `min` or above `max`; both ends are clamped.
pub fn ncd_from_sizes(cx: usize, cy: usize, cxy: usize) -> f64 {
    let max = cx.max(cy);
    if max == 0 {
        return 0.0;
    }
    let min = cx.min(cy) as f64;
    ((cxy as f64 - min) / max as f64).clamp(0.0, 1.0)
}

/// Compress both framed images and their concatenation.
pub fn compute_components(
    baseline: &[u8],
    window: &[u8],
    compressor: &dyn Compressor,
) -> Result<NcdComponents> {
    if baseline.is_empty() || window.is_empty() {
        return Err(DetectError::EmptyInput);
    }

    let baseline_compressed = compressor.compressed_len(baseline)?;
    let window_compressed = compressor.compressed_len(window)?;
    let joint_compressed = joint_compressed_len(baseline, window, compressor)?;

    Ok(NcdComponents {
        baseline_compressed,
        window_compressed,
        joint_compressed,
    })
}

/// NCD between two framed images.
pub fn ncd(baseline: &[u8], window: &[u8], compressor: &dyn Compressor) -> Result<f64> {
    Ok(compute_components(baseline, window, compressor)?.ncd())
}

pub(crate) fn joint_compressed_len(
    baseline: &[u8],
    window: &[u8],
    compressor: &dyn Compressor,
) -> Result<usize> {
    let mut joint = Vec::with_capacity(baseline.len() + window.len());
    joint.extend_from_slice(baseline);
    joint.extend_from_slice(window);
    compressor.compressed_len(&joint)
}
