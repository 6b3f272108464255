//! Feedback-driven threshold tuning.
//!
//! Hosts collect dispositions (confirmed / false positive / dismissed) on
//! past anomalies and periodically ask the [`AutoTuneController`] whether
//! the NCD and p-value thresholds of a stream should move. Each stream
//! cycles between two states: `Active` (adjustments permitted) and
//! `Cooling` (suppressed until the cooldown elapses after the last applied
//! adjustment).

pub mod history;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::detect::DetectError;

pub use history::{TuneHistoryLog, TuneHistoryRecord, TuneType};

/// NCD thresholds are kept inside this band.
pub const NCD_THRESHOLD_BOUNDS: (f64, f64) = (0.1, 0.8);
/// p-value thresholds are kept inside this band.
pub const P_VALUE_THRESHOLD_BOUNDS: (f64, f64) = (0.001, 0.2);

/// Longest accepted cooldown (30 days).
pub const MAX_COOLDOWN_SECS: u64 = 30 * 24 * 3600;

/// Smallest NCD change worth applying.
const MIN_NCD_DELTA: f64 = 0.01;
/// Smallest p-value change worth applying.
const MIN_P_VALUE_DELTA: f64 = 0.005;
/// False-positive rate excess over target that triggers desensitising.
const FP_EXCESS_TRIGGER: f64 = 0.1;
/// False positives needed before their NCD cluster is considered.
const FP_CLUSTER_MIN_COUNT: usize = 5;

// ---------------------------------------------------------------------------
// Configuration and inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoTuneConfig {
    /// Feedback entries required before any adjustment.
    pub min_feedback_samples: usize,
    /// Acceptable false-positive rate, 0..=1.
    pub false_positive_target: f64,
    /// Fraction of the observed error applied per step.
    pub learning_rate: f64,
    /// Largest single step as a fraction of the current value.
    pub max_adjustment_percent: f64,
    pub cooldown_secs: u64,
}

impl Default for AutoTuneConfig {
    fn default() -> Self {
        Self {
            min_feedback_samples: 20,
            false_positive_target: 0.05,
            learning_rate: 0.15,
            max_adjustment_percent: 0.25,
            cooldown_secs: 3600,
        }
    }
}

impl AutoTuneConfig {
    pub fn validate(&self) -> Result<(), DetectError> {
        if !(0.0..=1.0).contains(&self.false_positive_target) {
            return Err(DetectError::InvalidConfig(format!(
                "autotune false_positive_target ({}) must be within [0, 1]",
                self.false_positive_target
            )));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return Err(DetectError::InvalidConfig(format!(
                "autotune learning_rate ({}) must be within (0, 1]",
                self.learning_rate
            )));
        }
        if !(self.max_adjustment_percent > 0.0 && self.max_adjustment_percent <= 1.0) {
            return Err(DetectError::InvalidConfig(format!(
                "autotune max_adjustment_percent ({}) must be within (0, 1]",
                self.max_adjustment_percent
            )));
        }
        if self.cooldown_secs > MAX_COOLDOWN_SECS {
            return Err(DetectError::InvalidConfig(format!(
                "autotune cooldown_secs ({}) exceeds {MAX_COOLDOWN_SECS}",
                self.cooldown_secs
            )));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_secs.min(MAX_COOLDOWN_SECS) as i64)
    }
}

/// Aggregated feedback for one stream over the evaluation period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackStats {
    pub total: usize,
    pub false_positives: usize,
    pub confirmed: usize,
    pub dismissed: usize,
    /// Mean NCD at detection time of the false positives, 0 when unknown.
    pub avg_fp_ncd: f64,
    pub avg_confirmed_ncd: f64,
}

impl FeedbackStats {
    pub fn new(total: usize, false_positives: usize, confirmed: usize) -> Self {
        Self {
            total,
            false_positives,
            confirmed,
            dismissed: total.saturating_sub(false_positives + confirmed),
            ..Self::default()
        }
    }

    pub fn with_avg_fp_ncd(mut self, ncd: f64) -> Self {
        self.avg_fp_ncd = ncd;
        self
    }

    pub fn false_positive_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.false_positives as f64 / self.total as f64
        }
    }
}

/// Current thresholds of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub ncd: f64,
    pub p_value: f64,
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Which rule produced a [`TuneDecision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuneReason {
    /// Fewer than `min_feedback_samples` entries; nothing evaluated.
    InsufficientFeedback,
    HighFalsePositiveRate,
    LowDetectionRate,
    /// False positives cluster just around the NCD threshold.
    FpNcdBoundary,
    WithinTarget,
}

impl TuneReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TuneReason::InsufficientFeedback => "insufficient_feedback",
            TuneReason::HighFalsePositiveRate => "high_false_positive_rate",
            TuneReason::LowDetectionRate => "low_detection_rate",
            TuneReason::FpNcdBoundary => "fp_ncd_boundary",
            TuneReason::WithinTarget => "within_target",
        }
    }
}

impl fmt::Display for TuneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TuneDecision {
    pub new_ncd: f64,
    pub new_p_value: f64,
    pub reason: TuneReason,
    pub should_adjust: bool,
}

impl TuneDecision {
    fn unchanged(current: Thresholds, reason: TuneReason) -> Self {
        Self {
            new_ncd: current.ncd,
            new_p_value: current.p_value,
            reason,
            should_adjust: false,
        }
    }

    pub fn ncd_changed(&self, current: Thresholds) -> bool {
        (self.new_ncd - current.ncd).abs() > MIN_NCD_DELTA
    }

    pub fn p_value_changed(&self, current: Thresholds) -> bool {
        (self.new_p_value - current.p_value).abs() > MIN_P_VALUE_DELTA
    }
}

/// Compute threshold adjustments from feedback. Pure.
pub fn evaluate(stats: &FeedbackStats, current: Thresholds, cfg: &AutoTuneConfig) -> TuneDecision {
    if stats.total < cfg.min_feedback_samples {
        return TuneDecision::unchanged(current, TuneReason::InsufficientFeedback);
    }

    let fp_rate = stats.false_positive_rate();
    let fp_excess = fp_rate - cfg.false_positive_target;

    let mut new_ncd = current.ncd;
    let mut new_p_value = current.p_value;
    let mut reason = TuneReason::WithinTarget;
    let mut should_adjust = false;

    if fp_excess > FP_EXCESS_TRIGGER {
        // Too noisy: raise NCD, tighten significance.
        let ncd_step = (current.ncd * cfg.max_adjustment_percent).min(fp_excess * cfg.learning_rate);
        new_ncd = current.ncd + ncd_step;

        let p_step = (current.p_value * cfg.max_adjustment_percent)
            .min(fp_excess * cfg.learning_rate * 0.5);
        new_p_value = (current.p_value - p_step).max(P_VALUE_THRESHOLD_BOUNDS.0);

        reason = TuneReason::HighFalsePositiveRate;
        should_adjust = true;
    } else if fp_rate < cfg.false_positive_target * 0.5 && stats.confirmed > 0 {
        // Quiet and confirmed hits exist: probably missing some.
        let ncd_step = current.ncd * cfg.learning_rate * 0.5;
        new_ncd = (current.ncd - ncd_step).max(NCD_THRESHOLD_BOUNDS.0);

        reason = TuneReason::LowDetectionRate;
        should_adjust = true;
    }

    if stats.false_positives > FP_CLUSTER_MIN_COUNT
        && stats.avg_fp_ncd > 0.0
        && stats.avg_fp_ncd > current.ncd * 0.8
    {
        let suggested = stats.avg_fp_ncd * 1.1;
        if suggested > new_ncd {
            new_ncd = (new_ncd * 1.2).min(suggested);
            reason = TuneReason::FpNcdBoundary;
            should_adjust = true;
        }
    }

    new_ncd = new_ncd.clamp(NCD_THRESHOLD_BOUNDS.0, NCD_THRESHOLD_BOUNDS.1);
    new_p_value = new_p_value.clamp(P_VALUE_THRESHOLD_BOUNDS.0, P_VALUE_THRESHOLD_BOUNDS.1);

    let decision = TuneDecision {
        new_ncd,
        new_p_value,
        reason,
        should_adjust,
    };
    if !decision.ncd_changed(current) && !decision.p_value_changed(current) {
        return TuneDecision {
            should_adjust: false,
            ..decision
        };
    }
    decision
}

/// True while `now` is within `cooldown` of the last applied adjustment.
pub fn should_throttle(last_tune: Option<DateTime<Utc>>, cooldown: Duration, now: DateTime<Utc>) -> bool {
    match last_tune {
        Some(last) => now - last < cooldown,
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuneState {
    Active,
    Cooling { remaining: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TuneOutcome {
    /// Evaluation skipped; the stream was tuned too recently.
    Cooling { remaining: Duration },
    Evaluated {
        decision: TuneDecision,
        /// One record per applied threshold change, ready to persist.
        records: Vec<TuneHistoryRecord>,
    },
}

impl TuneOutcome {
    pub fn records(&self) -> &[TuneHistoryRecord] {
        match self {
            TuneOutcome::Evaluated { records, .. } => records,
            TuneOutcome::Cooling { .. } => &[],
        }
    }
}

/// Per-stream cooldown bookkeeping around [`evaluate`].
pub struct AutoTuneController {
    config: AutoTuneConfig,
    last_tune: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl AutoTuneController {
    pub fn new(config: AutoTuneConfig) -> Self {
        Self {
            config,
            last_tune: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AutoTuneConfig {
        &self.config
    }

    pub fn last_tune(&self, stream: &str) -> Option<DateTime<Utc>> {
        self.last_tune.read().get(stream).copied()
    }

    /// Seed the cooldown from persisted history, e.g. after a restart.
    pub fn restore_last_tune(&self, stream: &str, at: DateTime<Utc>) {
        let mut map = self.last_tune.write();
        let entry = map.entry(stream.to_string()).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    pub fn state(&self, stream: &str, now: DateTime<Utc>) -> TuneState {
        let cooldown = self.config.cooldown();
        match self.last_tune(stream) {
            Some(last) if should_throttle(Some(last), cooldown, now) => TuneState::Cooling {
                remaining: cooldown - (now - last),
            },
            _ => TuneState::Active,
        }
    }

    /// Evaluate `stream` if it is `Active`; an applied adjustment moves it
    /// to `Cooling`.
    pub fn maybe_tune(
        &self,
        stream: &str,
        stats: &FeedbackStats,
        current: Thresholds,
        now: DateTime<Utc>,
    ) -> TuneOutcome {
        if let TuneState::Cooling { remaining } = self.state(stream, now) {
            debug!(
                stream = stream,
                remaining_sec = remaining.num_seconds(),
                "auto-tune cooling down"
            );
            return TuneOutcome::Cooling { remaining };
        }

        let decision = evaluate(stats, current, &self.config);
        if !decision.should_adjust {
            debug!(stream = stream, reason = %decision.reason, "no threshold adjustment");
            return TuneOutcome::Evaluated {
                decision,
                records: Vec::new(),
            };
        }

        let confidence = 1.0 - stats.false_positive_rate();
        let mut records = Vec::with_capacity(2);
        if decision.ncd_changed(current) {
            records.push(
                TuneHistoryRecord::new(TuneType::Ncd, current.ncd, decision.new_ncd, decision.reason, now)
                    .with_stream(stream)
                    .with_confidence(confidence),
            );
        }
        if decision.p_value_changed(current) {
            records.push(
                TuneHistoryRecord::new(
                    TuneType::PValue,
                    current.p_value,
                    decision.new_p_value,
                    decision.reason,
                    now,
                )
                .with_stream(stream)
                .with_confidence(confidence),
            );
        }

        self.last_tune.write().insert(stream.to_string(), now);
        info!(
            stream = stream,
            reason = %decision.reason,
            old_ncd = current.ncd,
            new_ncd = decision.new_ncd,
            old_p_value = current.p_value,
            new_p_value = decision.new_p_value,
            "thresholds adjusted"
        );

        TuneOutcome::Evaluated { decision, records }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const BALANCED: Thresholds = Thresholds {
        ncd: 0.3,
        p_value: 0.05,
    };

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_insufficient_feedback_is_noop() {
        let stats = FeedbackStats::new(19, 19, 0);
        let d = evaluate(&stats, BALANCED, &AutoTuneConfig::default());
        assert_eq!(d.reason, TuneReason::InsufficientFeedback);
        assert!(!d.should_adjust);
        assert_eq!(d.new_ncd, 0.3);
        assert_eq!(d.new_p_value, 0.05);
    }

    #[test]
    fn test_high_false_positive_rate_desensitises() {
        // fp rate 0.3, excess 0.25
        let stats = FeedbackStats::new(100, 30, 10).with_avg_fp_ncd(0.3);
        let d = evaluate(&stats, BALANCED, &AutoTuneConfig::default());
        assert_eq!(d.reason, TuneReason::HighFalsePositiveRate);
        assert!(d.should_adjust);
        assert!(close(d.new_ncd, 0.3375), "ncd {}", d.new_ncd);
        assert!(close(d.new_p_value, 0.0375), "p {}", d.new_p_value);
        assert!(d.new_ncd > BALANCED.ncd && d.new_ncd <= BALANCED.ncd * 1.25);
        assert!(d.new_p_value < BALANCED.p_value && d.new_p_value >= BALANCED.p_value * 0.75 - 1e-12);
    }

    #[test]
    fn test_low_false_positive_rate_sensitises() {
        let stats = FeedbackStats::new(50, 1, 20);
        let d = evaluate(&stats, BALANCED, &AutoTuneConfig::default());
        assert_eq!(d.reason, TuneReason::LowDetectionRate);
        assert!(d.should_adjust);
        assert!(close(d.new_ncd, 0.3 - 0.3 * 0.075));
        assert_eq!(d.new_p_value, 0.05);
    }

    #[test]
    fn test_fp_cluster_near_threshold_raises_above_it() {
        let stats = FeedbackStats::new(100, 30, 10).with_avg_fp_ncd(0.5);
        let d = evaluate(&stats, BALANCED, &AutoTuneConfig::default());
        assert_eq!(d.reason, TuneReason::FpNcdBoundary);
        assert!(d.should_adjust);
        // min(0.3375 * 1.2, 0.55)
        assert!(close(d.new_ncd, 0.405), "ncd {}", d.new_ncd);
    }

    #[test]
    fn test_on_target_is_within_target() {
        // rate 0.05, no confirmed
        let stats = FeedbackStats::new(40, 2, 0);
        let d = evaluate(&stats, BALANCED, &AutoTuneConfig::default());
        assert_eq!(d.reason, TuneReason::WithinTarget);
        assert!(!d.should_adjust);
    }

    #[test]
    fn test_tiny_changes_suppressed() {
        // Already at the NCD floor.
        let current = Thresholds {
            ncd: 0.1,
            p_value: 0.05,
        };
        let d = evaluate(&FeedbackStats::new(50, 0, 5), current, &AutoTuneConfig::default());
        assert_eq!(d.reason, TuneReason::LowDetectionRate);
        assert!(!d.should_adjust);
    }

    #[test]
    fn test_outputs_clamped() {
        let current = Thresholds {
            ncd: 0.79,
            p_value: 0.0012,
        };
        let d = evaluate(&FeedbackStats::new(20, 20, 0), current, &AutoTuneConfig::default());
        assert!(d.new_ncd <= 0.8);
        assert!(d.new_p_value >= 0.001);
    }

    #[test]
    fn test_should_throttle() {
        let now = Utc::now();
        let hour = Duration::hours(1);
        assert!(!should_throttle(None, hour, now));
        assert!(should_throttle(Some(now - Duration::minutes(59)), hour, now));
        assert!(!should_throttle(Some(now - Duration::minutes(60)), hour, now));
        assert!(!should_throttle(Some(now - Duration::hours(2)), hour, now));
    }

    #[test]
    fn test_controller_cools_after_adjustment() {
        let ctl = AutoTuneController::new(AutoTuneConfig::default());
        let now = Utc::now();
        let stats = FeedbackStats::new(100, 30, 10);
        assert_eq!(ctl.state("s1", now), TuneState::Active);

        let outcome = ctl.maybe_tune("s1", &stats, BALANCED, now);
        let records = outcome.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tune_type, TuneType::Ncd);
        assert_eq!(records[1].tune_type, TuneType::PValue);
        assert!(close(records[0].confidence, 0.7));
        assert_eq!(records[0].stream.as_deref(), Some("s1"));

        let later = now + Duration::minutes(10);
        match ctl.maybe_tune("s1", &stats, BALANCED, later) {
            TuneOutcome::Cooling { remaining } => assert_eq!(remaining, Duration::minutes(50)),
            other => panic!("expected cooling, got {other:?}"),
        }
        // Other streams are unaffected.
        assert_eq!(ctl.state("s2", later), TuneState::Active);

        assert_eq!(ctl.state("s1", now + Duration::hours(1)), TuneState::Active);
    }

    #[test]
    fn test_controller_noop_does_not_start_cooldown() {
        let ctl = AutoTuneController::new(AutoTuneConfig::default());
        let now = Utc::now();
        let outcome = ctl.maybe_tune("s1", &FeedbackStats::new(3, 3, 0), BALANCED, now);
        assert!(outcome.records().is_empty());
        assert!(ctl.last_tune("s1").is_none());
        assert_eq!(ctl.state("s1", now), TuneState::Active);
    }

    #[test]
    fn test_restore_keeps_latest() {
        let ctl = AutoTuneController::new(AutoTuneConfig::default());
        let now = Utc::now();
        ctl.restore_last_tune("s1", now - Duration::minutes(30));
        ctl.restore_last_tune("s1", now - Duration::hours(3));
        assert_eq!(ctl.last_tune("s1"), Some(now - Duration::minutes(30)));
        assert!(matches!(ctl.state("s1", now), TuneState::Cooling { .. }));
    }

    #[test]
    fn test_config_validation() {
        AutoTuneConfig::default().validate().unwrap();
        let bad = AutoTuneConfig {
            learning_rate: 0.0,
            ..AutoTuneConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
