//! Routing of raw events to per-stream detectors.
//!
//! Ingest path per event: whitespace check, privacy filter, tokenizer, then
//! the stream's [`StreamingDetector`]. Numeric outlier tracking sees the
//! redacted event only once the detector has kept it.
//! Detection cycles run on [`StreamManager::poll`] once a stream is ready
//! and at least `hop_size` events arrived since its previous cycle.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::detector::{DetectorStats, IngestOutcome, StreamingDetector};
use super::{DetectError, DetectionOutcome, Result};
use crate::compression::CompressorRegistry;
use crate::config::{DetectorConfig, EngineConfig, NumericConfig};
use crate::numeric::{NumericOutlierTracker, ValueOutlier};
use crate::privacy::{PrivacyFilter, PrivacyVerdict};
use crate::tokenizer::{Tokenizer, TokenizerCache, TokenizerConfig};

/// One detection cycle, as handed to the host for storage or alerting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: Uuid,
    pub stream: String,
    pub detected_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: DetectionOutcome,
}

struct StreamSession {
    detector: StreamingDetector,
    tokenizer: Option<Arc<Tokenizer>>,
    since_last_cycle: usize,
    /// Set by `remove_stream`; ingest calls that raced the removal see it
    /// once they get the lock.
    removed: bool,
}

pub struct StreamManager {
    sessions: RwLock<HashMap<String, Arc<Mutex<StreamSession>>>>,
    registry: CompressorRegistry,
    privacy: PrivacyFilter,
    tokenizers: TokenizerCache,
    default_tokenizer: TokenizerConfig,
    numeric: NumericOutlierTracker,
    numeric_config: NumericConfig,
}

impl StreamManager {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            sessions: RwLock::new(HashMap::new()),
            registry: CompressorRegistry::new(),
            privacy: PrivacyFilter::new(&config.privacy)?,
            tokenizers: TokenizerCache::new(),
            default_tokenizer: config.tokenizer,
            numeric: NumericOutlierTracker::new(),
            numeric_config: config.numeric.clone(),
        })
    }

    /// Register `stream` with the manager's default tokenizer settings.
    pub fn create_stream(&self, stream: &str, config: DetectorConfig) -> Result<()> {
        self.create_stream_with(stream, config, self.default_tokenizer)
    }

    pub fn create_stream_with(
        &self,
        stream: &str,
        config: DetectorConfig,
        tokenizer: TokenizerConfig,
    ) -> Result<()> {
        if stream.trim().is_empty() {
            return Err(DetectError::InvalidConfig("stream id must not be empty".into()));
        }
        if self.has_stream(stream) {
            return Err(DetectError::InvalidConfig(format!(
                "stream {stream:?} already exists"
            )));
        }

        let detector = StreamingDetector::with_registry(config, &self.registry)?;
        let tokenizer = if tokenizer.has_any_enabled() {
            Some(self.tokenizers.get_or_create(tokenizer)?)
        } else {
            None
        };

        let session = StreamSession {
            detector,
            tokenizer,
            since_last_cycle: 0,
            removed: false,
        };

        let mut sessions = self.sessions.write();
        if sessions.contains_key(stream) {
            return Err(DetectError::InvalidConfig(format!(
                "stream {stream:?} already exists"
            )));
        }
        sessions.insert(stream.to_string(), Arc::new(Mutex::new(session)));
        info!(stream, "stream created");
        Ok(())
    }

    /// Drop the stream and its numeric statistics. Returns whether it existed.
    ///
    /// Statistics are cleared under the session lock, so an ingest already
    /// in flight either finishes first or finds the session removed.
    pub fn remove_stream(&self, stream: &str) -> bool {
        let Some(session) = self.sessions.write().remove(stream) else {
            return false;
        };
        let mut session = session.lock();
        session.removed = true;
        self.numeric.clear(stream);
        info!(stream, "stream removed");
        true
    }

    pub fn has_stream(&self, stream: &str) -> bool {
        self.sessions.read().contains_key(stream)
    }

    /// Stream ids, sorted.
    pub fn list_streams(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn ingest(&self, stream: &str, event: &[u8]) -> Result<IngestOutcome> {
        if event.trim_ascii().is_empty() {
            return Err(DetectError::EmptyInput);
        }
        let session = self.session(stream)?;
        self.ingest_into(stream, &session, event)
    }

    fn ingest_into(
        &self,
        stream: &str,
        session: &Mutex<StreamSession>,
        event: &[u8],
    ) -> Result<IngestOutcome> {
        let event = match self.privacy.apply(event) {
            PrivacyVerdict::Pass(bytes) => bytes,
            PrivacyVerdict::Drop { findings } => {
                debug!(stream, findings, "event dropped by privacy policy");
                return Ok(IngestOutcome::Dropped);
            }
        };

        let mut session = session.lock();
        if session.removed {
            return Err(unknown_stream(stream));
        }
        let outcome = match session.tokenizer.clone() {
            Some(tokenizer) => session.detector.ingest(&tokenizer.tokenize(&event))?,
            None => session.detector.ingest(&event)?,
        };
        if outcome != IngestOutcome::Added {
            return Ok(outcome);
        }
        session.since_last_cycle += 1;

        // Only events the detector kept feed the numeric statistics.
        if self.numeric_config.enabled {
            let outliers = self
                .numeric
                .check(stream, &event, self.numeric_config.k_sigma, true);
            log_outliers(stream, &outliers);
        }
        Ok(outcome)
    }

    /// Run detection on `stream` now, regardless of hop cadence.
    pub fn detect(&self, stream: &str) -> Result<DetectionOutcome> {
        let session = self.session(stream)?;
        let session = session.lock();
        session.detector.detect()
    }

    /// Run a detection cycle if one is due.
    pub fn poll(&self, stream: &str) -> Result<Option<DetectionRecord>> {
        let session = self.session(stream)?;
        let mut session = session.lock();

        let hop = session.detector.config().hop_size;
        if !session.detector.is_ready() || session.since_last_cycle < hop {
            return Ok(None);
        }

        let outcome = session.detector.detect()?;
        session.since_last_cycle = 0;

        let record = DetectionRecord {
            id: Uuid::new_v4(),
            stream: stream.to_string(),
            detected_at: Utc::now(),
            outcome,
        };
        if record.outcome.is_anomaly {
            info!(
                stream,
                id = %record.id,
                ncd = record.outcome.metrics.ncd,
                p_value = record.outcome.metrics.p_value,
                confidence = record.outcome.metrics.confidence_level,
                "anomaly detected"
            );
        }
        Ok(Some(record))
    }

    pub fn stats(&self, stream: &str) -> Result<DetectorStats> {
        let session = self.session(stream)?;
        let stats = session.lock().detector.stats();
        Ok(stats)
    }

    pub fn numeric(&self) -> &NumericOutlierTracker {
        &self.numeric
    }

    pub fn tokenizers(&self) -> &TokenizerCache {
        &self.tokenizers
    }

    fn session(&self, stream: &str) -> Result<Arc<Mutex<StreamSession>>> {
        self.sessions
            .read()
            .get(stream)
            .cloned()
            .ok_or_else(|| unknown_stream(stream))
    }
}

fn unknown_stream(stream: &str) -> DetectError {
    DetectError::InvalidConfig(format!("unknown stream {stream:?}"))
}

fn log_outliers(stream: &str, outliers: &[ValueOutlier]) {
    for o in outliers {
        info!(
            stream,
            field = %o.field_path,
            value = o.value,
            mean = o.mean,
            z_score = o.z_score,
            samples = o.sample_count,
            "numeric outlier"
        );
    }
}
