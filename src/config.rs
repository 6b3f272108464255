//! TOML configuration for driftwatch.
//!
//! Every section has compiled-in defaults, so a partial file (or no file at
//! all) yields a working engine. Detector settings are validated before any
//! detector is built; invalid values are rejected, never clamped.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::adaptive::AdaptiveWindowConfig;
use crate::autotune::AutoTuneConfig;
use crate::compression::CompressionAlgorithm;
use crate::detect::DetectError;
use crate::privacy::PrivacyConfig;
use crate::tokenizer::TokenizerConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "DRIFTWATCH_CONFIG";

/// Standard system location for the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/driftwatch/driftwatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
    #[serde(default)]
    pub privacy: PrivacyConfig,
    #[serde(default)]
    pub numeric: NumericConfig,
    #[serde(default)]
    pub adaptive: AdaptiveWindowConfig,
    #[serde(default)]
    pub autotune: AutoTuneConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded driftwatch configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in `DRIFTWATCH_CONFIG`.
    /// 2. `/etc/driftwatch/driftwatch.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "DRIFTWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Validate every section that has invariants.
    pub fn validate(&self) -> std::result::Result<(), DetectError> {
        self.detector.validate()?;
        self.adaptive.validate()?;
        self.autotune.validate()?;
        self.privacy.validate()?;
        if !self.numeric.k_sigma.is_finite() || self.numeric.k_sigma <= 0.0 {
            return Err(DetectError::InvalidConfig(format!(
                "numeric.k_sigma must be positive, got {}",
                self.numeric.k_sigma
            )));
        }
        Ok(())
    }

    /// Serialize to TOML, e.g. to print the effective configuration.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize configuration")
    }
}

// ---------------------------------------------------------------------------
// Detection profiles
// ---------------------------------------------------------------------------

/// Named presets trading sensitivity for false-positive rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionProfile {
    Sensitive,
    #[default]
    Balanced,
    Strict,
    /// Hand-tuned thresholds; starts from the balanced preset.
    Custom,
}

/// Parameters a profile pins down.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfilePreset {
    pub ncd_threshold: f64,
    pub p_value_threshold: f64,
    pub baseline_size: usize,
    pub window_size: usize,
    pub hop_size: usize,
    pub permutation_count: usize,
}

impl DetectionProfile {
    pub fn preset(&self) -> ProfilePreset {
        match self {
            DetectionProfile::Sensitive => ProfilePreset {
                ncd_threshold: 0.20,
                p_value_threshold: 0.10,
                baseline_size: 200,
                window_size: 30,
                hop_size: 10,
                permutation_count: 500,
            },
            DetectionProfile::Balanced | DetectionProfile::Custom => ProfilePreset {
                ncd_threshold: 0.30,
                p_value_threshold: 0.05,
                baseline_size: 400,
                window_size: 50,
                hop_size: 10,
                permutation_count: 100,
            },
            DetectionProfile::Strict => ProfilePreset {
                ncd_threshold: 0.45,
                p_value_threshold: 0.01,
                baseline_size: 800,
                window_size: 100,
                hop_size: 20,
                permutation_count: 1000,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionProfile::Sensitive => "sensitive",
            DetectionProfile::Balanced => "balanced",
            DetectionProfile::Strict => "strict",
            DetectionProfile::Custom => "custom",
        }
    }
}

impl fmt::Display for DetectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionProfile {
    type Err = DetectError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sensitive" => Ok(DetectionProfile::Sensitive),
            "balanced" => Ok(DetectionProfile::Balanced),
            "strict" => Ok(DetectionProfile::Strict),
            "custom" => Ok(DetectionProfile::Custom),
            other => Err(DetectError::InvalidConfig(format!(
                "unknown detection profile: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

pub const MIN_BASELINE_SIZE: usize = 10;
pub const MAX_BASELINE_SIZE: usize = 50_000;
pub const MAX_PERMUTATIONS: usize = 10_000;
/// Default per-event ceiling. Leaves room for a single event four orders of
/// magnitude larger than a typical log line.
pub const DEFAULT_MAX_EVENT_BYTES: usize = 64 * 1024 * 1024;

/// Weights for the composite score. Normalized by their sum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositeWeights {
    pub ncd: f64,
    pub compression: f64,
    pub entropy: f64,
}

impl Default for CompositeWeights {
    fn default() -> Self {
        Self {
            ncd: 1.0,
            compression: 1.0,
            entropy: 1.0,
        }
    }
}

/// Per-detector settings. Immutable once a detector is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub baseline_size: usize,
    pub window_size: usize,
    /// Events between detection cycles.
    pub hop_size: usize,
    /// Hard ceiling on retained events.
    pub max_capacity: usize,
    pub p_value_threshold: f64,
    pub ncd_threshold: f64,
    /// Relative change in compression ratio counted as a full signal.
    pub compression_ratio_drop_threshold: f64,
    /// Change in bits/byte counted as a full signal.
    pub entropy_change_threshold: f64,
    pub composite_threshold: f64,
    pub permutation_count: usize,
    pub seed: u64,
    pub require_statistical_significance: bool,
    pub compression_algorithm: CompressionAlgorithm,
    /// Events larger than this are dropped at ingest.
    pub max_event_bytes: usize,
    pub composite_weights: CompositeWeights,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self::for_profile(DetectionProfile::Balanced)
    }
}

impl DetectorConfig {
    /// Build a config from a profile preset with shared defaults for
    /// everything the preset does not pin.
    pub fn for_profile(profile: DetectionProfile) -> Self {
        let p = profile.preset();
        Self {
            baseline_size: p.baseline_size,
            window_size: p.window_size,
            hop_size: p.hop_size,
            max_capacity: (p.baseline_size + 4 * p.window_size).next_power_of_two(),
            p_value_threshold: p.p_value_threshold,
            ncd_threshold: p.ncd_threshold,
            compression_ratio_drop_threshold: 0.15,
            entropy_change_threshold: 0.5,
            composite_threshold: 1.0,
            permutation_count: p.permutation_count,
            seed: 42,
            require_statistical_significance: true,
            compression_algorithm: CompressionAlgorithm::Zlib,
            max_event_bytes: DEFAULT_MAX_EVENT_BYTES,
            composite_weights: CompositeWeights::default(),
        }
    }

    /// Replace the preset-controlled fields with those of `profile`,
    /// keeping everything else (seed, algorithm, weights, ...).
    pub fn with_profile(self, profile: DetectionProfile) -> Self {
        let preset = Self::for_profile(profile);
        Self {
            baseline_size: preset.baseline_size,
            window_size: preset.window_size,
            hop_size: preset.hop_size,
            max_capacity: preset.max_capacity,
            p_value_threshold: preset.p_value_threshold,
            ncd_threshold: preset.ncd_threshold,
            permutation_count: preset.permutation_count,
            ..self
        }
    }

    /// Check every invariant. Returns the first violation found.
    pub fn validate(&self) -> std::result::Result<(), DetectError> {
        let fail = |msg: String| Err(DetectError::InvalidConfig(msg));

        if !(MIN_BASELINE_SIZE..=MAX_BASELINE_SIZE).contains(&self.baseline_size) {
            return fail(format!(
                "baseline_size ({}) must be within {MIN_BASELINE_SIZE}..={MAX_BASELINE_SIZE}",
                self.baseline_size
            ));
        }
        if self.window_size == 0 {
            return fail("window_size must be positive".into());
        }
        if self.window_size > self.baseline_size {
            return fail(format!(
                "window_size ({}) exceeds baseline_size ({})",
                self.window_size, self.baseline_size
            ));
        }
        if self.hop_size == 0 || self.hop_size > self.window_size {
            return fail(format!(
                "hop_size ({}) must be within 1..={}",
                self.hop_size, self.window_size
            ));
        }
        let required = self.baseline_size + 3 * self.window_size;
        if self.max_capacity < required {
            return fail(format!(
                "max_capacity ({}) must be at least baseline_size + 3 * window_size ({required})",
                self.max_capacity
            ));
        }
        if !(self.p_value_threshold > 0.0 && self.p_value_threshold <= 1.0) {
            return fail(format!(
                "p_value_threshold ({}) must be within (0, 1]",
                self.p_value_threshold
            ));
        }
        for (name, value) in [
            ("ncd_threshold", self.ncd_threshold),
            (
                "compression_ratio_drop_threshold",
                self.compression_ratio_drop_threshold,
            ),
            ("entropy_change_threshold", self.entropy_change_threshold),
            ("composite_threshold", self.composite_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return fail(format!("{name} must be a non-negative number, got {value}"));
            }
        }
        if self.composite_threshold == 0.0 {
            return fail("composite_threshold must be positive".into());
        }
        if self.permutation_count == 0 || self.permutation_count > MAX_PERMUTATIONS {
            return fail(format!(
                "permutation_count ({}) must be within 1..={MAX_PERMUTATIONS}",
                self.permutation_count
            ));
        }
        if self.max_event_bytes == 0 {
            return fail("max_event_bytes must be positive".into());
        }
        let w = &self.composite_weights;
        let weights = [w.ncd, w.compression, w.entropy];
        if weights.iter().any(|x| !x.is_finite() || *x < 0.0) || weights.iter().sum::<f64>() <= 0.0
        {
            return fail("composite_weights must be non-negative with a positive sum".into());
        }

        Ok(())
    }

    /// Events needed before the first detection can run.
    pub fn events_to_ready(&self) -> usize {
        self.baseline_size + self.window_size
    }
}

// ---------------------------------------------------------------------------
// Numeric outliers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NumericConfig {
    /// Feed numeric JSON fields through the outlier tracker on ingest.
    pub enabled: bool,
    /// Band width in standard deviations.
    pub k_sigma: f64,
}

impl Default for NumericConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            k_sigma: 3.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Pretty,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
