//! Append-only audit trail of applied threshold adjustments.
//!
//! One JSON line per [`TuneHistoryRecord`]. The most recent record of a
//! stream doubles as its last-tune time after a restart.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::TuneReason;

/// Which threshold a record adjusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TuneType {
    Ncd,
    #[serde(rename = "pvalue")]
    PValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneHistoryRecord {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    pub tune_type: TuneType,
    pub old_value: f64,
    pub new_value: f64,
    pub reason: TuneReason,
    /// `1 - false_positive_rate` of the feedback that drove the change.
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl TuneHistoryRecord {
    pub fn new(
        tune_type: TuneType,
        old_value: f64,
        new_value: f64,
        reason: TuneReason,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream: None,
            tune_type,
            old_value,
            new_value,
            reason,
            confidence: 0.0,
            created_at,
        }
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

/// JSON-lines file of [`TuneHistoryRecord`]s, shared across tasks.
pub struct TuneHistoryLog {
    path: PathBuf,
    writer: Mutex<tokio::fs::File>,
}

impl TuneHistoryLog {
    /// Open (or create) the log at `path` in append mode.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create tune history directory: {}", parent.display()))?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open tune history: {}", path.display()))?;

        debug!(path = %path.display(), "tune history opened");

        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    pub async fn append(&self, record: &TuneHistoryRecord) -> Result<()> {
        self.append_all(std::slice::from_ref(record)).await
    }

    /// Append several records under one lock so they stay adjacent.
    pub async fn append_all(&self, records: &[TuneHistoryRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for record in records {
            buf.push_str(&serde_json::to_string(record).context("failed to serialize tune record")?);
            buf.push('\n');
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(buf.as_bytes())
            .await
            .with_context(|| format!("failed to write tune history: {}", self.path.display()))?;
        writer
            .flush()
            .await
            .with_context(|| format!("failed to flush tune history: {}", self.path.display()))?;
        Ok(())
    }

    /// Every record in the file, oldest first. Blank lines are skipped.
    pub async fn read_all(&self) -> Result<Vec<TuneHistoryRecord>> {
        read_history(&self.path).await
    }

    /// Most recent `created_at` for `stream`, if any.
    pub async fn last_tune(&self, stream: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| r.stream.as_deref() == Some(stream))
            .map(|r| r.created_at)
            .max())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse a history file without opening it for writing.
pub async fn read_history(path: &Path) -> Result<Vec<TuneHistoryRecord>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read tune history: {}", path.display()))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: malformed tune record", path.display(), n + 1))
        })
        .collect()
}
