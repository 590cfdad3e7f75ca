//! The append-only log file
//!
//! One exclusive writer (the transaction manager) appends frames; readers
//! are the recovery path and the debug `entries_from` iterator. On open
//! the tail is scanned: the next sequence number is recovered from the
//! last valid entry, and a torn or corrupt tail is truncated to the last
//! CRC-valid frame with a warning.

use crate::compression::CompressionCodec;
use crate::encoding::{decode_frame, encode_frame, FRAME_HEADER};
use crate::entry::{WalEntry, WalEntryKind};
use folio_core::{now_millis, FolioError, FolioResult};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// What `WalFile::open` found on disk.
#[derive(Debug, Clone)]
pub struct OpenReport {
    /// Highest valid sequence number found (0 when the log was empty)
    pub last_sequence: u64,
    /// Bytes of valid frames retained
    pub valid_bytes: u64,
    /// Whether a torn or corrupt tail was truncated
    pub truncated: bool,
    /// Why the tail was truncated, when it was
    pub truncated_reason: Option<String>,
}

/// Append-only WAL file with tail recovery.
pub struct WalFile {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
    codec: CompressionCodec,
    flush_interval: Duration,
    last_sync: Instant,
    report: OpenReport,
}

impl WalFile {
    /// Open (or create) the log, scanning the tail for the last valid
    /// sequence number and truncating torn frames.
    pub fn open(
        path: impl Into<PathBuf>,
        codec: CompressionCodec,
        flush_interval_ms: u64,
    ) -> FolioResult<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| FolioError::wal_io(format!("create {:?}: {}", dir, e)))?;
            }
        }

        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(FolioError::wal_io(format!("read {:?}: {}", path, e))),
        };

        let mut offset: usize = 0;
        let mut last_sequence: u64 = 0;
        let mut truncated_reason = None;
        while offset < bytes.len() {
            match decode_frame(&bytes[offset..], offset as u64) {
                Ok(frame) => {
                    if let Some(entry) = &frame.entry {
                        last_sequence = entry.sequence_number;
                    }
                    offset += frame.consumed;
                }
                Err(e) => {
                    warn!(log = ?path, error = %e, "truncating WAL tail to last valid frame");
                    truncated_reason = Some(e.to_string());
                    break;
                }
            }
        }

        let truncated = truncated_reason.is_some();
        if truncated {
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| FolioError::wal_io(format!("open {:?}: {}", path, e)))?;
            file.set_len(offset as u64)
                .map_err(|e| FolioError::wal_io(format!("truncate {:?}: {}", path, e)))?;
            file.sync_all()
                .map_err(|e| FolioError::wal_io(format!("sync {:?}: {}", path, e)))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| FolioError::wal_io(format!("open {:?}: {}", path, e)))?;

        if last_sequence > 0 || truncated {
            info!(
                log = ?path,
                last_sequence,
                truncated,
                "opened WAL"
            );
        }

        Ok(WalFile {
            path,
            writer: BufWriter::new(file),
            next_sequence: last_sequence + 1,
            codec,
            flush_interval: Duration::from_millis(flush_interval_ms),
            last_sync: Instant::now(),
            report: OpenReport {
                last_sequence,
                valid_bytes: offset as u64,
                truncated,
                truncated_reason,
            },
        })
    }

    /// What open found on disk.
    pub fn open_report(&self) -> &OpenReport {
        &self.report
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest sequence number assigned so far (0 = none).
    pub fn current_sequence(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Append an entry, assigning its sequence number, and flush.
    ///
    /// Commit and checkpoint markers are always synced to disk before the
    /// call returns; other entries sync per the flush interval.
    pub fn append(&mut self, transaction_id: &str, kind: WalEntryKind) -> FolioResult<WalEntry> {
        let kind_bytes = bincode::serialize(&kind)
            .map_err(|e| FolioError::serialization(format!("encode WAL kind: {}", e)))?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&kind_bytes);

        let entry = WalEntry {
            transaction_id: transaction_id.to_string(),
            sequence_number: self.next_sequence,
            timestamp: now_millis(),
            kind,
            checksum: hasher.finalize(),
        };

        let frame = encode_frame(&entry, &self.codec)?;
        self.writer
            .write_all(&frame)
            .map_err(|e| FolioError::wal_io(format!("append to {:?}: {}", self.path, e)))?;
        self.writer
            .flush()
            .map_err(|e| FolioError::wal_io(format!("flush {:?}: {}", self.path, e)))?;

        let interval_due = self.flush_interval.is_zero()
            || self.last_sync.elapsed() >= self.flush_interval;
        if entry.requires_sync() || interval_due {
            self.sync()?;
        }

        self.next_sequence += 1;
        Ok(entry)
    }

    /// Force everything to disk.
    pub fn sync(&mut self) -> FolioResult<()> {
        self.writer
            .flush()
            .map_err(|e| FolioError::wal_io(format!("flush {:?}: {}", self.path, e)))?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| FolioError::wal_io(format!("sync {:?}: {}", self.path, e)))?;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Lazy iteration over entries with sequence >= `from`.
    ///
    /// The iterator is finite and not restartable; it stops (with a
    /// warning) at the first corrupt frame. It cannot yield anything
    /// earlier than the last truncation point.
    pub fn entries_from(&mut self, from: u64) -> FolioResult<WalIterator> {
        self.writer
            .flush()
            .map_err(|e| FolioError::wal_io(format!("flush {:?}: {}", self.path, e)))?;
        let file = File::open(&self.path)
            .map_err(|e| FolioError::wal_io(format!("open {:?}: {}", self.path, e)))?;
        Ok(WalIterator {
            reader: BufReader::new(file),
            offset: 0,
            from,
            finished: false,
            corruption: None,
        })
    }

    /// Collect all entries with sequence >= `from`, reporting whether a
    /// corrupt frame cut the scan short.
    pub fn read_from(&mut self, from: u64) -> FolioResult<(Vec<WalEntry>, Option<String>)> {
        let mut iter = self.entries_from(from)?;
        let entries: Vec<WalEntry> = iter.by_ref().collect();
        Ok((entries, iter.corruption().map(|s| s.to_string())))
    }

    /// Discard entries with sequence <= `through` by rewriting the
    /// retained suffix to a temp file and renaming it into place.
    pub fn truncate_through(&mut self, through: u64) -> FolioResult<()> {
        self.sync()?;
        let (retained, _) = self.read_from(through + 1)?;

        let tmp = self.path.with_extension("wal.tmp");
        {
            let file = File::create(&tmp)
                .map_err(|e| FolioError::wal_io(format!("create {:?}: {}", tmp, e)))?;
            let mut writer = BufWriter::new(file);
            for entry in &retained {
                let frame = encode_frame(entry, &self.codec)?;
                writer
                    .write_all(&frame)
                    .map_err(|e| FolioError::wal_io(format!("write {:?}: {}", tmp, e)))?;
            }
            writer
                .flush()
                .map_err(|e| FolioError::wal_io(format!("flush {:?}: {}", tmp, e)))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| FolioError::wal_io(format!("sync {:?}: {}", tmp, e)))?;
        }
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| FolioError::wal_io(format!("rename {:?}: {}", tmp, e)))?;

        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| FolioError::wal_io(format!("reopen {:?}: {}", self.path, e)))?;
        self.writer = BufWriter::new(file);
        info!(log = ?self.path, through, retained = retained.len(), "truncated WAL");
        Ok(())
    }
}

/// Lazy, finite, non-restartable WAL scan.
pub struct WalIterator {
    reader: BufReader<File>,
    offset: u64,
    from: u64,
    finished: bool,
    corruption: Option<String>,
}

impl WalIterator {
    /// The corruption that stopped the scan, if any.
    pub fn corruption(&self) -> Option<&str> {
        self.corruption.as_deref()
    }

    fn read_frame(&mut self) -> FolioResult<Option<(Option<WalEntry>, usize)>> {
        let mut header = [0u8; FRAME_HEADER];
        match self.reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => {
                return Err(FolioError::wal_io(format!(
                    "read at offset {}: {}",
                    self.offset, e
                )))
            }
        }
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len == 0 {
            return Err(FolioError::corruption(format!(
                "offset {}: zero-length frame",
                self.offset
            )));
        }
        let mut buf = Vec::with_capacity(FRAME_HEADER + len);
        buf.extend_from_slice(&header);
        buf.resize(FRAME_HEADER + len, 0);
        self.reader
            .read_exact(&mut buf[FRAME_HEADER..])
            .map_err(|e| {
                FolioError::wal_io(format!(
                    "incomplete frame at offset {}: {}",
                    self.offset, e
                ))
            })?;
        let frame = decode_frame(&buf, self.offset)?;
        Ok(Some((frame.entry, frame.consumed)))
    }
}

impl Iterator for WalIterator {
    type Item = WalEntry;

    fn next(&mut self) -> Option<WalEntry> {
        loop {
            if self.finished {
                return None;
            }
            match self.read_frame() {
                Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Ok(Some((entry, consumed))) => {
                    self.offset += consumed as u64;
                    match entry {
                        Some(entry) if entry.sequence_number >= self.from => return Some(entry),
                        Some(_) => continue,
                        None => {
                            warn!(offset = self.offset, "skipped WAL entry with unknown type");
                            continue;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "WAL scan stopped at corrupt frame");
                    self.corruption = Some(e.to_string());
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}
