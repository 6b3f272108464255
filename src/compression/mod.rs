//! Pluggable compressor backends.
//!
//! The detector only needs `C(x)`, the compressed size of a byte string.
//! Every backend implements [`Compressor`]; the [`CompressorRegistry`]
//! probes which backends work at runtime and falls back in a fixed order
//! when the preferred one is unavailable.

pub mod deflate;
pub mod lz4;

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::detect::{DetectError, Result};

pub use deflate::{GzipCompressor, ZlibCompressor};
pub use lz4::Lz4Compressor;

/// Compressor families the detector can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    Zlib,
    Gzip,
    Lz4,
}

impl CompressionAlgorithm {
    /// Order in which backends are tried when the preferred one is missing.
    pub const FALLBACK_ORDER: [CompressionAlgorithm; 3] = [
        CompressionAlgorithm::Zlib,
        CompressionAlgorithm::Gzip,
        CompressionAlgorithm::Lz4,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zlib" | "deflate" => Ok(CompressionAlgorithm::Zlib),
            "gzip" | "gz" => Ok(CompressionAlgorithm::Gzip),
            "lz4" => Ok(CompressionAlgorithm::Lz4),
            other => Err(DetectError::InvalidConfig(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }
}

/// A byte-stream compressor.
///
/// Implementations must be deterministic: the same input always yields the
/// same compressed length, otherwise p-values stop being reproducible.
pub trait Compressor: Send + Sync {
    fn algorithm(&self) -> CompressionAlgorithm;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Compressed size of `data` in bytes.
    fn compressed_len(&self, data: &[u8]) -> Result<usize> {
        Ok(self.compress(data)?.len())
    }
}

/// Build a fresh backend for `algorithm` with its default settings.
pub fn backend(algorithm: CompressionAlgorithm) -> Arc<dyn Compressor> {
    match algorithm {
        CompressionAlgorithm::Zlib => Arc::new(ZlibCompressor::default()),
        CompressionAlgorithm::Gzip => Arc::new(GzipCompressor::default()),
        CompressionAlgorithm::Lz4 => Arc::new(Lz4Compressor),
    }
}

pub(crate) fn io_fault(algorithm: CompressionAlgorithm, err: io::Error) -> DetectError {
    DetectError::InternalFault(format!("{algorithm} compression failed: {err}"))
}

const PROBE_PAYLOAD: &[u8] = b"{\"probe\":\"driftwatch\",\"probe_again\":\"driftwatch\"}";

/// Runtime inventory of working compressor backends.
pub struct CompressorRegistry {
    available: Vec<Arc<dyn Compressor>>,
}

impl CompressorRegistry {
    /// Probe every built-in backend and keep the ones that work.
    pub fn new() -> Self {
        let candidates = CompressionAlgorithm::FALLBACK_ORDER
            .iter()
            .map(|&alg| backend(alg))
            .collect();
        Self::with_backends(candidates)
    }

    /// Build a registry from host-supplied backends. Each one is probed.
    pub fn with_backends(candidates: Vec<Arc<dyn Compressor>>) -> Self {
        let mut available = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let algorithm = candidate.algorithm();
            match candidate.compressed_len(PROBE_PAYLOAD) {
                Ok(len) if len > 0 => {
                    debug!(%algorithm, probe_len = len, "compressor backend available");
                    available.push(candidate);
                }
                Ok(_) => warn!(%algorithm, "compressor produced empty output, disabling"),
                Err(e) => warn!(%algorithm, error = %e, "compressor probe failed, disabling"),
            }
        }

        debug!(
            backends = ?available.iter().map(|c| c.algorithm().as_str()).collect::<Vec<_>>(),
            "compressor registry initialized"
        );

        Self { available }
    }

    pub fn is_available(&self, algorithm: CompressionAlgorithm) -> bool {
        self.find(algorithm).is_some()
    }

    /// Return the preferred backend, or the first working one in
    /// [`CompressionAlgorithm::FALLBACK_ORDER`].
    pub fn select(&self, preferred: CompressionAlgorithm) -> Result<Arc<dyn Compressor>> {
        if let Some(found) = self.find(preferred) {
            return Ok(found);
        }

        for alg in CompressionAlgorithm::FALLBACK_ORDER {
            if let Some(found) = self.find(alg) {
                warn!(
                    preferred = %preferred,
                    fallback = %alg,
                    "preferred compressor unavailable, falling back"
                );
                return Ok(found);
            }
        }

        // Host-injected backends outside the fixed order.
        if let Some(first) = self.available.first() {
            warn!(preferred = %preferred, fallback = %first.algorithm(), "falling back to first available compressor");
            return Ok(Arc::clone(first));
        }

        Err(DetectError::InternalFault(
            "no compressor backend available".into(),
        ))
    }

    fn find(&self, algorithm: CompressionAlgorithm) -> Option<Arc<dyn Compressor>> {
        self.available
            .iter()
            .find(|c| c.algorithm() == algorithm)
            .cloned()
    }
}

impl Default for CompressorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// `io::Write` sink that only counts bytes, so encoders can report a
/// compressed length without keeping the output.
#[derive(Debug, Default)]
pub(crate) struct CountingWriter {
    pub written: usize,
}

impl io::Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
