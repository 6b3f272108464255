//! Baseline and window sizing from observed stream characteristics.
//!
//! Four independent estimates of a good baseline size (event rate, memory
//! budget, pattern diversity, entropy) are combined: the memory budget is a
//! hard cap, the other three are averaged. The window is a fixed fraction
//! of the baseline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::detect::DetectError;
use crate::metrics::shannon_entropy;

/// Events sampled by [`derive_stream_characteristics`].
pub const CHARACTERISTICS_SAMPLE_LIMIT: usize = 200;

/// Cap on bytes fed to the entropy estimate.
const ENTROPY_SAMPLE_BYTES: usize = 512 * 1024;

/// Entropy (bits/byte) above which a baseline is grown.
const HIGH_ENTROPY_BITS: f64 = 6.0;

/// Observed properties of a stream, computed per sizing call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamCharacteristics {
    pub avg_events_per_hour: f64,
    pub avg_event_size_bytes: usize,
    pub avg_baseline_entropy: f64,
    /// 0 = every event the same shape, 1 = highly varied.
    pub pattern_diversity: f64,
}

/// Bounds and scaling factors for [`compute_window_sizes`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveWindowConfig {
    pub min_baseline: usize,
    pub max_baseline: usize,
    /// Baseline events per event/hour of traffic.
    pub baseline_per_event_rate: f64,
    pub min_window: usize,
    pub max_window: usize,
    pub window_to_baseline_ratio: f64,
    pub max_memory_per_stream_mb: usize,
    /// Event size assumed when the stream reports none.
    pub avg_event_size_for_calc: usize,
}

impl Default for AdaptiveWindowConfig {
    fn default() -> Self {
        Self {
            min_baseline: 100,
            max_baseline: 2000,
            baseline_per_event_rate: 0.1,
            min_window: 10,
            max_window: 200,
            window_to_baseline_ratio: 0.125,
            max_memory_per_stream_mb: 50,
            avg_event_size_for_calc: 1024,
        }
    }
}

impl AdaptiveWindowConfig {
    pub fn validate(&self) -> Result<(), DetectError> {
        let fail = |msg: String| Err(DetectError::InvalidConfig(msg));

        if self.min_baseline == 0 || self.min_baseline > self.max_baseline {
            return fail(format!(
                "adaptive baseline bounds invalid: min {} max {}",
                self.min_baseline, self.max_baseline
            ));
        }
        if self.min_window == 0 || self.min_window > self.max_window {
            return fail(format!(
                "adaptive window bounds invalid: min {} max {}",
                self.min_window, self.max_window
            ));
        }
        if self.min_window * 2 > self.min_baseline {
            return fail(format!(
                "min_window ({}) must be at most half of min_baseline ({})",
                self.min_window, self.min_baseline
            ));
        }
        if !(self.window_to_baseline_ratio > 0.0 && self.window_to_baseline_ratio <= 1.0) {
            return fail(format!(
                "window_to_baseline_ratio ({}) must be within (0, 1]",
                self.window_to_baseline_ratio
            ));
        }
        if !self.baseline_per_event_rate.is_finite() || self.baseline_per_event_rate < 0.0 {
            return fail("baseline_per_event_rate must be non-negative".into());
        }
        if self.max_memory_per_stream_mb == 0 || self.avg_event_size_for_calc == 0 {
            return fail("memory budget and default event size must be positive".into());
        }
        Ok(())
    }
}

/// Recommended sizes with the estimates that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRecommendation {
    pub baseline_size: usize,
    pub window_size: usize,
    pub frequency_estimate: usize,
    pub memory_estimate: usize,
    pub diversity_estimate: usize,
    pub entropy_estimate: usize,
}

/// Map stream characteristics to `(baseline, window)` sizes.
///
/// Pure; output always lies within the configured bounds and the window
/// never exceeds the baseline.
pub fn compute_window_sizes(
    chars: &StreamCharacteristics,
    cfg: &AdaptiveWindowConfig,
) -> WindowRecommendation {
    let clamp_baseline = |v: usize| v.clamp(cfg.min_baseline, cfg.max_baseline);
    let floor = |v: f64| if v.is_finite() && v > 0.0 { v as usize } else { 0 };

    // More traffic, larger baseline.
    let frequency_estimate =
        clamp_baseline(floor(chars.avg_events_per_hour * cfg.baseline_per_event_rate));

    // Baseline plus three windows must fit the budget.
    let event_size = if chars.avg_event_size_bytes == 0 {
        cfg.avg_event_size_for_calc
    } else {
        chars.avg_event_size_bytes
    };
    let max_events = cfg.max_memory_per_stream_mb * 1024 * 1024 / event_size;
    let memory_estimate = clamp_baseline(max_events / 4);

    let diversity = chars.pattern_diversity.clamp(0.0, 1.0);
    let diversity_estimate =
        clamp_baseline(floor((cfg.min_baseline * 2) as f64 * (1.0 + diversity * 0.5)));

    let entropy_multiplier = if chars.avg_baseline_entropy > HIGH_ENTROPY_BITS {
        1.0 + (chars.avg_baseline_entropy - HIGH_ENTROPY_BITS) * 0.1
    } else {
        1.0
    };
    let entropy_estimate = clamp_baseline(floor((cfg.min_baseline * 2) as f64 * entropy_multiplier));

    let combined = (frequency_estimate + diversity_estimate + entropy_estimate) / 3;
    let baseline_size = clamp_baseline(combined.min(memory_estimate));

    let mut window_size = floor(baseline_size as f64 * cfg.window_to_baseline_ratio)
        .clamp(cfg.min_window, cfg.max_window);
    if window_size > baseline_size {
        window_size = baseline_size / 2;
    }

    WindowRecommendation {
        baseline_size,
        window_size,
        frequency_estimate,
        memory_estimate,
        diversity_estimate,
        entropy_estimate,
    }
}

/// Estimate [`StreamCharacteristics`] from a batch of raw events.
///
/// At most [`CHARACTERISTICS_SAMPLE_LIMIT`] events are sampled. When
/// `observed_span` is unknown the batch is assumed to cover ten minutes.
pub fn derive_stream_characteristics<E: AsRef<[u8]>>(
    events: &[E],
    observed_span: Option<Duration>,
) -> StreamCharacteristics {
    if events.is_empty() {
        return StreamCharacteristics::default();
    }

    let samples: Vec<&[u8]> = events
        .iter()
        .take(CHARACTERISTICS_SAMPLE_LIMIT)
        .map(|e| e.as_ref().trim_ascii())
        .collect();

    let mut combined = Vec::new();
    let mut total = 0usize;
    for s in &samples {
        total += s.len();
        if combined.len() < ENTROPY_SAMPLE_BYTES {
            combined.extend_from_slice(s);
        }
    }

    let avg_size = total as f64 / samples.len() as f64;
    let avg_events_per_hour = match observed_span {
        Some(span) if span.as_secs_f64() > 0.0 => {
            events.len() as f64 * 3600.0 / span.as_secs_f64()
        }
        _ => events.len() as f64 * 6.0,
    };

    StreamCharacteristics {
        avg_events_per_hour,
        avg_event_size_bytes: avg_size as usize,
        avg_baseline_entropy: shannon_entropy(&combined),
        pattern_diversity: pattern_diversity(&samples),
    }
}

/// Coefficient of variation of event lengths, capped at 1.
fn pattern_diversity(samples: &[&[u8]]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().map(|s| s.len() as f64).sum::<f64>() / n;
    if mean == 0.0 {
        return 0.0;
    }
    let var = samples
        .iter()
        .map(|s| (s.len() as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    (var.sqrt() / mean).min(1.0)
}
