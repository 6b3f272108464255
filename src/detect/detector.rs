//! One stream's bounded baseline and window buffers plus the detection
//! cycle over them.
//!
//! Events fill the baseline first, then the window. Once both are full the
//! pair slides as one: each new event pushes the oldest window event into
//! the baseline, which drops its own oldest event. The two buffers are
//! therefore always the most recent `baseline_size + window_size` events,
//! with the baseline immediately preceding the window.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::policy::AnomalyDecisionPolicy;
use super::{DetectError, DetectionOutcome, Result};
use crate::compression::{CompressionAlgorithm, Compressor, CompressorRegistry};
use crate::config::DetectorConfig;
use crate::metrics::{frame_events, CompressionMetricsEngine, PermutationSignificanceTester};

/// Bookkeeping bytes charged per retained event on top of its payload.
const PER_EVENT_OVERHEAD: usize = std::mem::size_of::<Vec<u8>>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    Added,
    /// Refused by policy (oversized, or non-compliant with privacy rules).
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorStats {
    pub total_events: u64,
    pub dropped_events: u64,
    /// Estimated heap held by both buffers.
    pub memory_bytes: usize,
    pub is_ready: bool,
    pub baseline_len: usize,
    pub window_len: usize,
}

/// Streaming detector for a single stream.
///
/// Not internally synchronized: one owner calls `ingest` and `detect`.
pub struct StreamingDetector {
    config: DetectorConfig,
    baseline: VecDeque<Vec<u8>>,
    window: VecDeque<Vec<u8>>,
    buffered_bytes: usize,
    total_events: u64,
    dropped_events: u64,
    engine: CompressionMetricsEngine,
    tester: PermutationSignificanceTester,
    policy: AnomalyDecisionPolicy,
}

impl StreamingDetector {
    /// Validate `config` and pick its compressor from a freshly probed
    /// registry. Hosts building many detectors should share one registry
    /// through [`with_registry`](Self::with_registry).
    pub fn new(config: DetectorConfig) -> Result<Self> {
        Self::with_registry(config, &CompressorRegistry::new())
    }

    /// Validate `config` and select its compressor from `registry`.
    pub fn with_registry(config: DetectorConfig, registry: &CompressorRegistry) -> Result<Self> {
        config.validate()?;
        let compressor = registry.select(config.compression_algorithm)?;
        Self::with_compressor(config, compressor)
    }

    /// Validate `config` and use `compressor` regardless of the configured
    /// algorithm.
    pub fn with_compressor(config: DetectorConfig, compressor: Arc<dyn Compressor>) -> Result<Self> {
        config.validate()?;
        if compressor.algorithm() != config.compression_algorithm {
            debug!(
                configured = %config.compression_algorithm,
                actual = %compressor.algorithm(),
                "detector using substitute compressor"
            );
        }

        Ok(Self {
            baseline: VecDeque::with_capacity(config.baseline_size),
            window: VecDeque::with_capacity(config.window_size + 1),
            buffered_bytes: 0,
            total_events: 0,
            dropped_events: 0,
            engine: CompressionMetricsEngine::new(Arc::clone(&compressor)),
            tester: PermutationSignificanceTester::new(compressor),
            policy: AnomalyDecisionPolicy::from_config(&config),
            config,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn policy(&self) -> &AnomalyDecisionPolicy {
        &self.policy
    }

    /// Backend actually in use, which may differ from the configured one
    /// after a fallback.
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.engine.compressor().algorithm()
    }

    /// Append one event.
    ///
    /// Empty input is a caller error. Events over `max_event_bytes` are
    /// dropped without touching the buffers.
    pub fn ingest(&mut self, event: &[u8]) -> Result<IngestOutcome> {
        if event.is_empty() {
            return Err(DetectError::EmptyInput);
        }
        if event.len() > self.config.max_event_bytes {
            self.dropped_events += 1;
            warn!(
                len = event.len(),
                max = self.config.max_event_bytes,
                "oversized event dropped"
            );
            return Ok(IngestOutcome::Dropped);
        }

        self.total_events += 1;
        self.buffered_bytes += event.len();

        if self.baseline.len() < self.config.baseline_size {
            self.baseline.push_back(event.to_vec());
            return Ok(IngestOutcome::Added);
        }

        self.window.push_back(event.to_vec());
        if self.window.len() > self.config.window_size {
            if let Some(promoted) = self.window.pop_front() {
                self.baseline.push_back(promoted);
            }
            if let Some(evicted) = self.baseline.pop_front() {
                self.buffered_bytes -= evicted.len();
            }
        }

        debug_assert!(self.baseline.len() + self.window.len() <= self.config.max_capacity);
        Ok(IngestOutcome::Added)
    }

    /// Both buffers are full. Once true, stays true.
    pub fn is_ready(&self) -> bool {
        self.baseline.len() == self.config.baseline_size
            && self.window.len() == self.config.window_size
    }

    /// Run one detection cycle over the current buffers.
    ///
    /// Read-only: the buffers move only through [`ingest`](Self::ingest).
    pub fn detect(&self) -> Result<DetectionOutcome> {
        if !self.is_ready() {
            return Err(DetectError::NotReady {
                needed: self.config.events_to_ready(),
                have: self.baseline.len() + self.window.len(),
            });
        }

        let baseline: Vec<&[u8]> = self.baseline.iter().map(Vec::as_slice).collect();
        let window: Vec<&[u8]> = self.window.iter().map(Vec::as_slice).collect();

        let metrics = self
            .engine
            .compute(&frame_events(&baseline), &frame_events(&window))?;
        let significance = self.tester.test_against(
            metrics.ncd,
            &baseline,
            &window,
            self.config.seed,
            self.config.permutation_count,
        )?;

        let enhanced = self
            .policy
            .evaluate(&metrics, significance.p_value, significance.permutations);

        debug!(
            ncd = enhanced.ncd,
            p_value = enhanced.p_value,
            composite = enhanced.composite_score,
            is_anomaly = enhanced.is_anomaly,
            "detection cycle complete"
        );

        Ok(DetectionOutcome::from(enhanced))
    }

    pub fn stats(&self) -> DetectorStats {
        let retained = self.baseline.len() + self.window.len();
        DetectorStats {
            total_events: self.total_events,
            dropped_events: self.dropped_events,
            memory_bytes: self.buffered_bytes + retained * PER_EVENT_OVERHEAD,
            is_ready: self.is_ready(),
            baseline_len: self.baseline.len(),
            window_len: self.window.len(),
        }
    }

    /// Events currently in the baseline, oldest first.
    pub fn baseline_events(&self) -> impl Iterator<Item = &[u8]> {
        self.baseline.iter().map(Vec::as_slice)
    }

    /// Events currently in the window, oldest first.
    pub fn window_events(&self) -> impl Iterator<Item = &[u8]> {
        self.window.iter().map(Vec::as_slice)
    }
}
