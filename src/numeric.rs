//! Per-field numeric outlier tracking.
//!
//! Runs beside the compression path: every numeric leaf of a JSON event is
//! folded into running statistics (Welford) keyed by stream and dot path,
//! and values outside a k-sigma band are reported.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Observations required before [`NumericStats::is_outlier`] will flag
/// anything.
pub const MIN_OUTLIER_SAMPLES: u64 = 30;

/// Running statistics for one field path.
///
/// `min` and `max` are meaningless while `n == 0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NumericStats {
    pub n: u64,
    pub mean: f64,
    /// Sum of squared deviations from the mean.
    pub m2: f64,
    pub min: f64,
    pub max: f64,
}

impl NumericStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Welford update.
    pub fn update(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (x - self.mean);

        if self.n == 1 {
            self.min = x;
            self.max = x;
        } else {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
        }
    }

    /// Sample variance, `m2 / (n - 1)`. Zero below two observations.
    pub fn variance(&self) -> f64 {
        if self.n < 2 {
            return 0.0;
        }
        self.m2 / (self.n - 1) as f64
    }

    /// Sample standard deviation.
    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Population variance, `m2 / n`.
    pub fn population_variance(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        self.m2 / self.n as f64
    }

    pub fn population_std_dev(&self) -> f64 {
        self.population_variance().sqrt()
    }

    /// Whether `x` lies outside `mean ± k_sigma × std_dev`.
    ///
    /// Always false below [`MIN_OUTLIER_SAMPLES`]. With zero spread any
    /// value different from the mean is an outlier.
    pub fn is_outlier(&self, x: f64, k_sigma: f64) -> bool {
        if self.n < MIN_OUTLIER_SAMPLES {
            return false;
        }
        let sd = self.std_dev();
        if sd == 0.0 {
            return x != self.mean;
        }
        (x - self.mean).abs() > k_sigma * sd
    }

    /// Standard deviations between `x` and the mean. Zero when the spread
    /// is undefined or zero.
    pub fn z_score(&self, x: f64) -> f64 {
        let sd = self.std_dev();
        if self.n < 2 || sd == 0.0 {
            return 0.0;
        }
        (x - self.mean) / sd
    }
}

/// One numeric field that fell outside its band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueOutlier {
    pub field_path: String,
    pub value: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub z_score: f64,
    /// Observations the verdict was based on (excluding this value).
    pub sample_count: u64,
}

type FieldMap = HashMap<String, Arc<Mutex<NumericStats>>>;

/// Shared registry of [`NumericStats`] keyed by stream, then field path.
///
/// Lookups take the read lock; only the first sighting of a path takes the
/// write lock. Each entry has its own mutex so updates on different fields
/// never contend.
#[derive(Default)]
pub struct NumericOutlierTracker {
    streams: RwLock<HashMap<String, FieldMap>>,
}

impl NumericOutlierTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, stream: &str, field_path: &str) -> Arc<Mutex<NumericStats>> {
        if let Some(stats) = self
            .streams
            .read()
            .get(stream)
            .and_then(|fields| fields.get(field_path))
        {
            return Arc::clone(stats);
        }

        let mut streams = self.streams.write();
        let entry = streams
            .entry(stream.to_string())
            .or_default()
            .entry(field_path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(NumericStats::new())));
        Arc::clone(entry)
    }

    /// Fold one observation into `stream`/`field_path`.
    pub fn update(&self, stream: &str, field_path: &str, value: f64) {
        self.get_or_create(stream, field_path).lock().update(value);
    }

    /// Test every numeric leaf of `event` against the statistics gathered
    /// so far, then (if `update`) fold the values in.
    ///
    /// Each value is tested before it is added, so it is never compared
    /// against itself. Non-JSON events have no numeric fields.
    pub fn check(
        &self,
        stream: &str,
        event: &[u8],
        k_sigma: f64,
        update: bool,
    ) -> Vec<ValueOutlier> {
        let fields = extract_numeric_fields(event);
        let mut outliers = Vec::new();

        for (path, value) in fields {
            let entry = self.get_or_create(stream, &path);
            let mut stats = entry.lock();

            if stats.is_outlier(value, k_sigma) {
                outliers.push(ValueOutlier {
                    value,
                    mean: stats.mean,
                    std_dev: stats.std_dev(),
                    z_score: stats.z_score(value),
                    sample_count: stats.n,
                    field_path: path,
                });
            }
            if update {
                stats.update(value);
            }
        }

        if !outliers.is_empty() {
            debug!(stream, count = outliers.len(), "numeric outliers found");
        }
        outliers
    }

    /// Point-in-time copy of every field tracked for `stream`.
    pub fn stream_stats(&self, stream: &str) -> BTreeMap<String, NumericStats> {
        self.streams
            .read()
            .get(stream)
            .map(|fields| {
                fields
                    .iter()
                    .map(|(path, stats)| (path.clone(), *stats.lock()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Forget everything tracked for `stream`.
    pub fn clear(&self, stream: &str) -> bool {
        self.streams.write().remove(stream).is_some()
    }

    pub fn streams(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Collect numeric leaves of a JSON event as `(dot.path, value)`.
///
/// Arrays are skipped entirely.
pub fn extract_numeric_fields(event: &[u8]) -> Vec<(String, f64)> {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(event) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    walk(&value, String::new(), &mut out);
    out
}

fn walk(value: &serde_json::Value, path: String, out: &mut Vec<(String, f64)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                walk(child, child_path, out);
            }
        }
        serde_json::Value::Number(n) if !path.is_empty() => {
            if let Some(x) = n.as_f64() {
                out.push((path, x));
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_of(values: &[f64]) -> NumericStats {
        let mut s = NumericStats::new();
        for &v in values {
            s.update(v);
        }
        s
    }

    #[test]
    fn test_welford_known_sequence() {
        let s = stats_of(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(s.n, 8);
        assert!((s.mean - 5.0).abs() < 1e-12);
        assert!((s.population_variance() - 4.0).abs() < 1e-12);
        assert!((s.population_std_dev() - 2.0).abs() < 1e-12);
        assert!((s.variance() - 32.0 / 7.0).abs() < 1e-12);
        assert_eq!(s.min, 2.0);
        assert_eq!(s.max, 9.0);
    }

    #[test]
    fn test_welford_matches_direct_computation() {
        let values: Vec<f64> = (0..500).map(|i| ((i * 7919) % 1000) as f64 / 3.0).collect();
        let s = stats_of(&values);
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
        assert!((s.mean - mean).abs() < 1e-9);
        assert!((s.variance() - var).abs() < 1e-6);
    }

    #[test]
    fn test_no_outliers_below_min_samples() {
        let s = stats_of(&[10.0; 29]);
        assert!(!s.is_outlier(1e12, 3.0));
        assert!(!s.is_outlier(-1e12, 0.0));
    }

    #[test]
    fn test_zero_spread_flags_any_difference() {
        let s = stats_of(&[10.0; 30]);
        assert!(s.is_outlier(10.5, 3.0));
        assert!(!s.is_outlier(10.0, 3.0));
        assert_eq!(s.z_score(11.0), 0.0);
    }

    #[test]
    fn test_k_sigma_band() {
        let values: Vec<f64> = (0..100).map(|i| 100.0 + (i % 10) as f64).collect();
        let s = stats_of(&values);
        let sd = s.std_dev();
        assert!(!s.is_outlier(s.mean + 2.9 * sd, 3.0));
        assert!(s.is_outlier(s.mean + 3.1 * sd, 3.0));
        assert!(s.is_outlier(s.mean - 3.1 * sd, 3.0));
        assert!((s.z_score(s.mean + 2.0 * sd) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_extract_numeric_fields() {
        let event = br#"{"latency":12.5,"http":{"status":200,"ok":true},"tags":[1,2,3],"name":"x"}"#;
        let mut fields = extract_numeric_fields(event);
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            fields,
            vec![("http.status".to_string(), 200.0), ("latency".to_string(), 12.5)]
        );
        assert!(extract_numeric_fields(b"not json").is_empty());
        assert!(extract_numeric_fields(b"42").is_empty());
    }

    #[test]
    fn test_check_tests_before_updating() {
        let tracker = NumericOutlierTracker::new();
        for i in 0..40 {
            let event = format!(r#"{{"latency":{}}}"#, 100 + i % 5);
            assert!(tracker.check("api", event.as_bytes(), 3.0, true).is_empty());
        }

        let outliers = tracker.check("api", br#"{"latency":5000}"#, 3.0, true);
        assert_eq!(outliers.len(), 1);
        assert_eq!(outliers[0].field_path, "latency");
        assert_eq!(outliers[0].sample_count, 40);
        assert!(outliers[0].z_score > 3.0);

        assert_eq!(tracker.stream_stats("api")["latency"].n, 41);
    }

    #[test]
    fn test_check_without_update_leaves_stats() {
        let tracker = NumericOutlierTracker::new();
        tracker.check("s", br#"{"v":1}"#, 3.0, false);
        assert_eq!(tracker.stream_stats("s")["v"].n, 0);
    }

    #[test]
    fn test_streams_are_isolated_and_clearable() {
        let tracker = NumericOutlierTracker::new();
        tracker.update("a", "x", 1.0);
        tracker.update("b", "x", 2.0);
        assert_eq!(tracker.streams(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(tracker.stream_stats("a")["x"].mean, 1.0);

        assert!(tracker.clear("a"));
        assert!(!tracker.clear("a"));
        assert!(tracker.stream_stats("a").is_empty());
        assert_eq!(tracker.stream_stats("b")["x"].n, 1);
    }

    #[test]
    fn test_concurrent_updates() {
        let tracker = Arc::new(NumericOutlierTracker::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        let event = format!(r#"{{"cpu":{},"worker":{t}}}"#, i % 10);
                        tracker.check("host", event.as_bytes(), 3.0, true);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = tracker.stream_stats("host");
        assert_eq!(stats["cpu"].n, 2000);
        assert!((stats["cpu"].mean - 4.5).abs() < 1e-9);
        assert_eq!(stats["worker"].n, 2000);
    }
}
