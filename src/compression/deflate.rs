//! DEFLATE-family backends (zlib and gzip framing) over `flate2`.

use std::io::Write;

use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

use super::{io_fault, CompressionAlgorithm, Compressor, CountingWriter};
use crate::detect::Result;

const DEFAULT_LEVEL: u32 = 6;

/// zlib-framed DEFLATE.
#[derive(Debug, Clone, Copy)]
pub struct ZlibCompressor {
    level: u32,
}

impl ZlibCompressor {
    /// `level` is clamped to 0..=9.
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        Self::new(DEFAULT_LEVEL)
    }
}

impl Compressor for ZlibCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Zlib
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
        encoder
            .write_all(data)
            .map_err(|e| io_fault(self.algorithm(), e))?;
        encoder.finish().map_err(|e| io_fault(self.algorithm(), e))
    }

    fn compressed_len(&self, data: &[u8]) -> Result<usize> {
        let mut encoder =
            ZlibEncoder::new(CountingWriter::default(), Compression::new(self.level));
        encoder
            .write_all(data)
            .map_err(|e| io_fault(self.algorithm(), e))?;
        let sink = encoder.finish().map_err(|e| io_fault(self.algorithm(), e))?;
        Ok(sink.written)
    }
}

/// gzip-framed DEFLATE. The header carries no timestamp, so output is
/// reproducible.
#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    level: u32,
}

impl GzipCompressor {
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new(DEFAULT_LEVEL)
    }
}

impl Compressor for GzipCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Gzip
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
        encoder
            .write_all(data)
            .map_err(|e| io_fault(self.algorithm(), e))?;
        encoder.finish().map_err(|e| io_fault(self.algorithm(), e))
    }

    fn compressed_len(&self, data: &[u8]) -> Result<usize> {
        let mut encoder = GzEncoder::new(CountingWriter::default(), Compression::new(self.level));
        encoder
            .write_all(data)
            .map_err(|e| io_fault(self.algorithm(), e))?;
        let sink = encoder.finish().map_err(|e| io_fault(self.algorithm(), e))?;
        Ok(sink.written)
    }
}
