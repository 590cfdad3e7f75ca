//! WAL configuration

use crate::compression::{CompressionAlgorithm, CompressionCodec};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Compression section of the WAL options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Algorithm for oversized payloads
    #[serde(default)]
    pub algorithm: CompressionAlgorithm,
    /// Minimum raw payload size to attempt compression
    #[serde(default = "default_threshold")]
    pub threshold_bytes: usize,
}

fn default_threshold() -> usize {
    1024
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            algorithm: CompressionAlgorithm::None,
            threshold_bytes: default_threshold(),
        }
    }
}

impl CompressionConfig {
    /// Build the runtime codec for this config.
    pub fn codec(&self) -> CompressionCodec {
        CompressionCodec::new(self.algorithm, self.threshold_bytes)
    }
}

/// Options for the write-ahead log and transaction manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalOptions {
    /// Path of the log file
    #[serde(rename = "walPath")]
    pub wal_path: PathBuf,
    /// Milliseconds between fsyncs for non-commit entries; `0` syncs every
    /// append. Commit and checkpoint markers always sync.
    #[serde(rename = "flushIntervalMs", default)]
    pub flush_interval_ms: u64,
    /// Automatic checkpoint after this many appended entries
    #[serde(rename = "checkpointIntervalEntries", default)]
    pub checkpoint_interval_entries: Option<u64>,
    /// Compression policy
    #[serde(default)]
    pub compression: CompressionConfig,
    /// Default transaction timeout in milliseconds
    #[serde(rename = "defaultTimeoutMs", default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl WalOptions {
    /// Options with defaults for a log at `wal_path`.
    pub fn new(wal_path: impl Into<PathBuf>) -> Self {
        WalOptions {
            wal_path: wal_path.into(),
            flush_interval_ms: 0,
            checkpoint_interval_entries: None,
            compression: CompressionConfig::default(),
            default_timeout_ms: default_timeout_ms(),
        }
    }

    /// Default transaction timeout as a duration.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = WalOptions::new("/tmp/folio.wal");
        assert_eq!(options.flush_interval_ms, 0);
        assert_eq!(options.compression.algorithm, CompressionAlgorithm::None);
        assert_eq!(options.default_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn deserializes_wire_names() {
        let options: WalOptions = serde_json::from_str(
            r#"{
                "walPath": "/data/folio.wal",
                "flushIntervalMs": 100,
                "checkpointIntervalEntries": 1000,
                "compression": {"algorithm": "lz4", "threshold_bytes": 512}
            }"#,
        )
        .unwrap();
        assert_eq!(options.flush_interval_ms, 100);
        assert_eq!(options.checkpoint_interval_entries, Some(1000));
        assert_eq!(options.compression.algorithm, CompressionAlgorithm::Lz4);
        assert_eq!(options.compression.threshold_bytes, 512);
    }
}
