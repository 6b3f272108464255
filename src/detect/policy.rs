//! Anomaly verdicts from compression metrics.
//!
//! Three signals (NCD, relative compression-ratio change, entropy change)
//! are each scaled by their threshold, clipped to `[0, 2]`, and combined
//! into a weighted composite. A window is anomalous only when the
//! composite reaches its threshold, the NCD reaches its own threshold, and
//! (when required) the permutation p-value is significant.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use super::EnhancedMetrics;
use crate::config::{CompositeWeights, DetectorConfig};
use crate::metrics::CompressionMetrics;

/// Upper clip of each normalized signal.
const COMPONENT_CAP: f64 = 2.0;

const MIN_RECOMMENDED_NCD: f64 = 0.1;
const MAX_RECOMMENDED_NCD: f64 = 0.8;
const MIN_RECOMMENDED_WINDOW: usize = 10;

/// Verdict for one baseline/window pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub is_anomaly: bool,
    /// 0..=1
    pub confidence: f64,
    pub composite_score: f64,
    pub is_statistically_significant: bool,
    pub compression_ratio_change: f64,
    pub entropy_change: f64,
    pub explanation: String,
}

/// Threshold set applied to every detection cycle of one detector.
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyDecisionPolicy {
    ncd_threshold: f64,
    p_value_threshold: f64,
    compression_ratio_drop_threshold: f64,
    entropy_change_threshold: f64,
    composite_threshold: f64,
    require_statistical_significance: bool,
    weights: CompositeWeights,
    baseline_size: usize,
    window_size: usize,
}

impl AnomalyDecisionPolicy {
    /// Assumes `config` has been validated.
    pub fn from_config(config: &DetectorConfig) -> Self {
        Self {
            ncd_threshold: config.ncd_threshold,
            p_value_threshold: config.p_value_threshold,
            compression_ratio_drop_threshold: config.compression_ratio_drop_threshold,
            entropy_change_threshold: config.entropy_change_threshold,
            composite_threshold: config.composite_threshold,
            require_statistical_significance: config.require_statistical_significance,
            weights: config.composite_weights,
            baseline_size: config.baseline_size,
            window_size: config.window_size,
        }
    }

    pub fn ncd_threshold(&self) -> f64 {
        self.ncd_threshold
    }

    pub fn p_value_threshold(&self) -> f64 {
        self.p_value_threshold
    }

    /// Weighted mean of the clipped, threshold-normalized signals.
    pub fn composite_score(&self, ncd: f64, ratio_change: f64, entropy_change: f64) -> f64 {
        let w = &self.weights;
        let total = w.ncd + w.compression + w.entropy;
        if total <= 0.0 {
            return 0.0;
        }
        let weighted = w.ncd * normalized(ncd, self.ncd_threshold)
            + w.compression * normalized(ratio_change.abs(), self.compression_ratio_drop_threshold)
            + w.entropy * normalized(entropy_change.abs(), self.entropy_change_threshold);
        weighted / total
    }

    pub fn decide(&self, metrics: &CompressionMetrics, p_value: f64) -> Decision {
        let ratio_change = relative_change(
            metrics.baseline_compression_ratio,
            metrics.window_compression_ratio,
        );
        let entropy_change = metrics.window_entropy - metrics.baseline_entropy;
        let composite = self.composite_score(metrics.ncd, ratio_change, entropy_change);

        let significant = p_value < self.p_value_threshold;
        let is_anomaly = composite >= self.composite_threshold
            && metrics.ncd >= self.ncd_threshold
            && (!self.require_statistical_significance || significant);
        let confidence = (composite / (2.0 * self.composite_threshold)).clamp(0.0, 1.0);

        let explanation = self.explain(&Explain {
            metrics,
            p_value,
            significant,
            is_anomaly,
            confidence,
            composite,
            ratio_change,
            entropy_change,
        });

        Decision {
            is_anomaly,
            confidence,
            composite_score: composite,
            is_statistically_significant: significant,
            compression_ratio_change: ratio_change,
            entropy_change,
            explanation,
        }
    }

    /// Decide and attach the self-tuning recommendations.
    pub fn evaluate(
        &self,
        metrics: &CompressionMetrics,
        p_value: f64,
        permutation_count: usize,
    ) -> EnhancedMetrics {
        let decision = self.decide(metrics, p_value);
        let stability = stability_score(
            decision.entropy_change,
            decision.compression_ratio_change,
            decision.confidence,
        );

        EnhancedMetrics {
            ncd: metrics.ncd,
            p_value,
            baseline_compression_ratio: metrics.baseline_compression_ratio,
            window_compression_ratio: metrics.window_compression_ratio,
            baseline_entropy: metrics.baseline_entropy,
            window_entropy: metrics.window_entropy,
            is_anomaly: decision.is_anomaly,
            confidence_level: decision.confidence,
            is_statistically_significant: decision.is_statistically_significant,
            compression_ratio_change: decision.compression_ratio_change,
            entropy_change: decision.entropy_change,
            composite_score: decision.composite_score,
            conditional_novelty: metrics.conditional_novelty,
            permutation_count,
            recommended_ncd_threshold: self.recommended_ncd_threshold(stability),
            recommended_window_size: self.recommended_window_size(stability, decision.entropy_change),
            data_stability_score: stability,
            explanation: decision.explanation,
        }
    }

    pub fn recommended_ncd_threshold(&self, stability: f64) -> f64 {
        (self.ncd_threshold + (0.5 - stability) * 0.2).clamp(MIN_RECOMMENDED_NCD, MAX_RECOMMENDED_NCD)
    }

    pub fn recommended_window_size(&self, stability: f64, entropy_change: f64) -> usize {
        let scale = 1.0 + (1.0 - stability) * 0.5 + entropy_change.abs().min(1.0) * 0.25;
        let raw = (self.window_size as f64 * scale).round() as usize;
        let upper = MIN_RECOMMENDED_WINDOW.max((self.baseline_size as f64 * 0.75) as usize);
        raw.clamp(MIN_RECOMMENDED_WINDOW, upper)
    }

    fn explain(&self, e: &Explain<'_>) -> String {
        let m = e.metrics;
        let mut out = String::with_capacity(768);

        let verdict = if e.is_anomaly {
            "ANOMALY DETECTED"
        } else {
            "ANOMALY NOT DETECTED"
        };
        let significance = if e.significant {
            "statistically significant"
        } else {
            "not statistically significant"
        };
        let _ = writeln!(
            out,
            "{verdict} (confidence {:.1}%): p-value {:.4} is {significance} at {:.3}",
            e.confidence * 100.0,
            e.p_value,
            self.p_value_threshold
        );

        let _ = writeln!(
            out,
            "COMPRESSION EVIDENCE: baseline ratio {:.2}x, window ratio {:.2}x ({:+.1}%)",
            m.baseline_compression_ratio,
            m.window_compression_ratio,
            e.ratio_change * 100.0
        );

        let entropy_pct = if m.baseline_entropy > 0.0 {
            format!("{:+.1}%", e.entropy_change / m.baseline_entropy * 100.0)
        } else {
            format!("{:+.2} bits", e.entropy_change)
        };
        let _ = writeln!(
            out,
            "ENTROPY EVIDENCE: baseline {:.2} bits/byte, window {:.2} bits/byte ({entropy_pct})",
            m.baseline_entropy, m.window_entropy
        );

        let _ = writeln!(
            out,
            "NCD SCORE: {:.3} ({} dissimilarity, threshold {:.2})",
            m.ncd,
            ncd_band(m.ncd),
            self.ncd_threshold
        );
        let _ = writeln!(
            out,
            "COMPOSITE SCORE: {:.2} (threshold {:.2})",
            e.composite, self.composite_threshold
        );
        let _ = writeln!(
            out,
            "CONDITIONAL NOVELTY: {:.2} of the window is not explained by the baseline",
            m.conditional_novelty
        );
        let _ = write!(out, "INTERPRETATION: {}", self.interpretation(e));
        out
    }

    fn interpretation(&self, e: &Explain<'_>) -> &'static str {
        let thresholds_met =
            e.composite >= self.composite_threshold && e.metrics.ncd >= self.ncd_threshold;
        if e.is_anomaly {
            if e.ratio_change < 0.0 {
                "The window shares little structure with the baseline and compresses worse \
                 than it; new or disordered content is entering the stream."
            } else {
                "The window shares little structure with the baseline even though it \
                 compresses as well or better; the stream has shifted to different content."
            }
        } else if thresholds_met {
            "Distance and composite evidence cross their thresholds but the result is not \
             statistically significant; this is likely sampling noise."
        } else if e.metrics.ncd >= self.ncd_threshold {
            "Distance is elevated but the combined evidence stays below the composite threshold."
        } else {
            "The window is consistent with the baseline."
        }
    }
}

struct Explain<'a> {
    metrics: &'a CompressionMetrics,
    p_value: f64,
    significant: bool,
    is_anomaly: bool,
    confidence: f64,
    composite: f64,
    ratio_change: f64,
    entropy_change: f64,
}

/// `x / threshold` clipped to `[0, 2]`. A zero threshold makes any positive
/// signal a full one.
fn normalized(x: f64, threshold: f64) -> f64 {
    if threshold > 0.0 {
        (x / threshold).clamp(0.0, COMPONENT_CAP)
    } else if x > 0.0 {
        COMPONENT_CAP
    } else {
        0.0
    }
}

fn relative_change(baseline: f64, window: f64) -> f64 {
    if baseline == 0.0 {
        0.0
    } else {
        (window - baseline) / baseline
    }
}

fn ncd_band(ncd: f64) -> &'static str {
    if ncd < 0.3 {
        "low"
    } else if ncd < 0.7 {
        "moderate"
    } else {
        "high"
    }
}

/// 1 for a window indistinguishable from its baseline, falling towards 0 as
/// entropy and compressibility move and confidence drops.
pub fn stability_score(entropy_change: f64, ratio_change: f64, confidence: f64) -> f64 {
    let instability = 0.4 * entropy_change.abs().min(1.0)
        + 0.4 * ratio_change.abs().min(1.0)
        + 0.2 * (1.0 - confidence).abs().min(1.0);
    (1.0 - instability).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectionProfile;

    fn metrics(ncd: f64, ratios: (f64, f64), entropies: (f64, f64)) -> CompressionMetrics {
        CompressionMetrics {
            ncd,
            baseline_compression_ratio: ratios.0,
            window_compression_ratio: ratios.1,
            baseline_entropy: entropies.0,
            window_entropy: entropies.1,
            baseline_len: 12_000,
            window_len: 1_500,
            baseline_compressed_len: 1_000,
            window_compressed_len: 300,
            joint_compressed_len: 1_250,
            conditional_novelty: 0.5,
            delta_bits: -50.0,
        }
    }

    fn balanced() -> AnomalyDecisionPolicy {
        AnomalyDecisionPolicy::from_config(&DetectorConfig::for_profile(DetectionProfile::Balanced))
    }

    #[test]
    fn test_identical_buffers_not_anomalous() {
        let d = balanced().decide(&metrics(0.05, (12.0, 12.0), (3.0, 3.0)), 0.8);
        assert!(!d.is_anomaly);
        assert_eq!(d.compression_ratio_change, 0.0);
        assert_eq!(d.entropy_change, 0.0);
        assert!(d.composite_score < 0.1);
        assert!(d.explanation.starts_with("ANOMALY NOT DETECTED"));
        assert!(d.explanation.contains("consistent with the baseline"));
    }

    #[test]
    fn test_strong_drift_is_anomalous() {
        let d = balanced().decide(&metrics(0.9, (12.0, 1.0), (3.0, 7.9)), 0.01);
        assert!(d.is_anomaly);
        assert!(d.is_statistically_significant);
        assert_eq!(d.composite_score, 2.0);
        assert_eq!(d.confidence, 1.0);
        assert!(d.explanation.starts_with("ANOMALY DETECTED (confidence 100.0%)"));
        assert!(d.explanation.contains("NCD SCORE: 0.900 (high"));
        assert!(d.explanation.contains("(-91.7%)"));
    }

    #[test]
    fn test_significance_gate() {
        let m = metrics(0.9, (12.0, 1.0), (3.0, 7.9));
        let d = balanced().decide(&m, 0.5);
        assert!(!d.is_anomaly);
        assert!(!d.is_statistically_significant);
        assert!(d.explanation.contains("not statistically significant"));
        assert!(d.explanation.contains("likely sampling noise"));

        let relaxed = DetectorConfig {
            require_statistical_significance: false,
            ..DetectorConfig::for_profile(DetectionProfile::Balanced)
        };
        assert!(AnomalyDecisionPolicy::from_config(&relaxed).decide(&m, 0.5).is_anomaly);
    }

    #[test]
    fn test_ncd_gate_holds_despite_composite() {
        // (0.667 + 2 + 2) / 3 > 1, but NCD stays under 0.3.
        let d = balanced().decide(&metrics(0.2, (12.0, 1.0), (3.0, 7.0)), 0.001);
        assert!(d.composite_score > 1.0);
        assert!(!d.is_anomaly);
    }

    #[test]
    fn test_weights_select_signals() {
        let cfg = DetectorConfig {
            composite_weights: CompositeWeights {
                ncd: 1.0,
                compression: 0.0,
                entropy: 0.0,
            },
            ..DetectorConfig::for_profile(DetectionProfile::Balanced)
        };
        let policy = AnomalyDecisionPolicy::from_config(&cfg);
        let score = policy.composite_score(0.15, 5.0, 5.0);
        assert!((score - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_zero_thresholds_saturate() {
        let cfg = DetectorConfig {
            compression_ratio_drop_threshold: 0.0,
            entropy_change_threshold: 0.0,
            ..DetectorConfig::for_profile(DetectionProfile::Balanced)
        };
        let policy = AnomalyDecisionPolicy::from_config(&cfg);
        assert_eq!(normalized(0.0, 0.0), 0.0);
        assert!((policy.composite_score(0.0, 0.01, -0.01) - 4.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_baseline_ratio_means_no_change() {
        assert_eq!(relative_change(0.0, 3.0), 0.0);
        assert_eq!(relative_change(2.0, 3.0), 0.5);
    }

    #[test]
    fn test_evaluate_fills_recommendations() {
        let m = metrics(0.05, (12.0, 12.0), (3.0, 3.0));
        let a = balanced().evaluate(&m, 0.7, 100);
        let b = balanced().evaluate(&m, 0.7, 100);
        assert_eq!(a, b);
        assert_eq!(a.permutation_count, 100);
        assert_eq!(a.conditional_novelty, 0.5);
        assert!(a.data_stability_score > 0.75 && a.data_stability_score <= 1.0);
        assert!(a.recommended_ncd_threshold < 0.3);
        assert!((10..=300).contains(&a.recommended_window_size));
    }

    #[test]
    fn test_recommendations_clamped() {
        let policy = balanced();
        assert_eq!(policy.recommended_ncd_threshold(-10.0), 0.8);
        assert_eq!(policy.recommended_ncd_threshold(10.0), 0.1);
        // 50 * (1 + 0.5 + 0.25) rounds to 88.
        assert_eq!(policy.recommended_window_size(0.0, 3.0), 88);
        assert_eq!(policy.recommended_window_size(1.0, 0.0), 50);
    }

    #[test]
    fn test_stability_score_bounds() {
        assert_eq!(stability_score(0.0, 0.0, 1.0), 1.0);
        assert_eq!(stability_score(5.0, -5.0, 0.0), 0.0);
        assert!((stability_score(0.5, 0.0, 1.0) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_ncd_bands() {
        assert_eq!(ncd_band(0.1), "low");
        assert_eq!(ncd_band(0.3), "moderate");
        assert_eq!(ncd_band(0.7), "high");
    }
}
