//! Per-entry compression
//!
//! Large WAL payloads may be wrapped in a compression envelope recording
//! the algorithm, the original size, and the compressed size. Compression
//! applies only when the raw payload exceeds the configured threshold AND
//! the compressed form is strictly smaller; incompressible data (already
//! compressed, random) is framed raw. Decompression is driven entirely by
//! the envelope.

use folio_core::{FolioError, FolioResult};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Supported compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// DEFLATE via gzip
    Gzip,
    /// LZ4 block format with a size prefix
    Lz4,
    /// Compression disabled
    #[default]
    None,
}

/// A compressed payload plus the bookkeeping needed to reverse it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionEnvelope {
    /// Algorithm that produced `bytes`
    pub algorithm: CompressionAlgorithm,
    /// Size of the payload before compression
    pub original_len: u32,
    /// Size of `bytes`
    pub compressed_len: u32,
    /// The compressed payload
    pub bytes: Vec<u8>,
}

/// Compression policy: algorithm plus the size threshold below which
/// payloads are never compressed.
#[derive(Debug, Clone, Copy)]
pub struct CompressionCodec {
    /// Selected algorithm
    pub algorithm: CompressionAlgorithm,
    /// Minimum raw payload size to attempt compression
    pub threshold_bytes: usize,
}

impl Default for CompressionCodec {
    fn default() -> Self {
        CompressionCodec::disabled()
    }
}

impl CompressionCodec {
    /// Codec that never compresses.
    pub fn disabled() -> Self {
        CompressionCodec {
            algorithm: CompressionAlgorithm::None,
            threshold_bytes: usize::MAX,
        }
    }

    /// Codec for an algorithm and threshold.
    pub fn new(algorithm: CompressionAlgorithm, threshold_bytes: usize) -> Self {
        CompressionCodec {
            algorithm,
            threshold_bytes,
        }
    }

    /// Try to compress `raw`. Returns `None` when the payload is under the
    /// threshold, compression is disabled, or the result would not be
    /// strictly smaller (compression ratio <= 1 bypass).
    pub fn maybe_compress(&self, raw: &[u8]) -> FolioResult<Option<CompressionEnvelope>> {
        if self.algorithm == CompressionAlgorithm::None || raw.len() <= self.threshold_bytes {
            return Ok(None);
        }

        let compressed = match self.algorithm {
            CompressionAlgorithm::Gzip => gzip_compress(raw)?,
            CompressionAlgorithm::Lz4 => lz4_flex::compress_prepend_size(raw),
            CompressionAlgorithm::None => unreachable!(),
        };

        if compressed.len() >= raw.len() {
            return Ok(None);
        }

        Ok(Some(CompressionEnvelope {
            algorithm: self.algorithm,
            original_len: raw.len() as u32,
            compressed_len: compressed.len() as u32,
            bytes: compressed,
        }))
    }
}

/// Reverse an envelope back to the raw payload.
pub fn decompress(envelope: &CompressionEnvelope) -> FolioResult<Vec<u8>> {
    let raw = match envelope.algorithm {
        CompressionAlgorithm::Gzip => gzip_decompress(&envelope.bytes)?,
        CompressionAlgorithm::Lz4 => lz4_flex::decompress_size_prepended(&envelope.bytes)
            .map_err(|e| FolioError::corruption(format!("lz4 decompression failed: {}", e)))?,
        CompressionAlgorithm::None => envelope.bytes.clone(),
    };
    if raw.len() != envelope.original_len as usize {
        return Err(FolioError::corruption(format!(
            "decompressed length {} does not match envelope original_len {}",
            raw.len(),
            envelope.original_len
        )));
    }
    Ok(raw)
}

fn gzip_compress(raw: &[u8]) -> FolioResult<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(raw)
        .map_err(|e| FolioError::wal_io(format!("gzip compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| FolioError::wal_io(format!("gzip compression failed: {}", e)))
}

fn gzip_decompress(bytes: &[u8]) -> FolioResult<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| FolioError::corruption(format!("gzip decompression failed: {}", e)))?;
    Ok(raw)
}
