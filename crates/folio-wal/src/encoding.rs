//! WAL frame codec
//!
//! On-disk frame layout:
//!
//! ```text
//! [len: u32 LE][crc32(payload): u32 LE][payload]
//! ```
//!
//! The payload starts with a one-byte compression flag (0 = raw,
//! 1 = envelope), followed by either the versioned entry bytes or a
//! bincode compression envelope wrapping them. The versioned entry is
//!
//! ```text
//! bincode { format_version: u16, tag: u8, body: Vec<u8> }
//! ```
//!
//! where `body` is the bincode-encoded `WalEntry`. The tag sits outside
//! the body so unknown entry types can be skipped with a warning during
//! recovery without attempting to decode them.
//!
//! Error discipline mirrors the storage layer: a frame that is merely
//! incomplete (torn tail) surfaces as `WalIo`, a frame that is present
//! but wrong (CRC mismatch, bad tag) as `WalCorruption`. Both carry the
//! file offset.

use crate::compression::{decompress, CompressionCodec, CompressionEnvelope};
use crate::entry::{WalEntry, WalEntryKind};
use folio_core::{FolioError, FolioResult};
use serde::{Deserialize, Serialize};

/// Current payload format version.
pub const FORMAT_VERSION: u16 = 1;

const FLAG_RAW: u8 = 0;
const FLAG_COMPRESSED: u8 = 1;

/// Frame header size: length + CRC.
pub const FRAME_HEADER: usize = 8;

#[derive(Serialize, Deserialize)]
struct VersionedEntry {
    format_version: u16,
    tag: u8,
    body: Vec<u8>,
}

/// Result of decoding one frame.
#[derive(Debug)]
pub struct DecodedFrame {
    /// The entry, or `None` when the tag was unknown and skipped
    pub entry: Option<WalEntry>,
    /// Total bytes consumed including the header
    pub consumed: usize,
}

fn bincode_err(context: &str, offset: u64, e: impl std::fmt::Display) -> FolioError {
    FolioError::corruption(format!("offset {}: {}: {}", offset, context, e))
}

/// Encode an entry into a full frame, compressing when the codec decides.
pub fn encode_frame(entry: &WalEntry, codec: &CompressionCodec) -> FolioResult<Vec<u8>> {
    let body = bincode::serialize(entry)
        .map_err(|e| FolioError::serialization(format!("encode WAL entry: {}", e)))?;
    let versioned = bincode::serialize(&VersionedEntry {
        format_version: FORMAT_VERSION,
        tag: entry.kind.tag(),
        body,
    })
    .map_err(|e| FolioError::serialization(format!("encode WAL frame: {}", e)))?;

    let mut payload;
    match codec.maybe_compress(&versioned)? {
        Some(envelope) => {
            let env_bytes = bincode::serialize(&envelope)
                .map_err(|e| FolioError::serialization(format!("encode envelope: {}", e)))?;
            payload = Vec::with_capacity(1 + env_bytes.len());
            payload.push(FLAG_COMPRESSED);
            payload.extend_from_slice(&env_bytes);
        }
        None => {
            payload = Vec::with_capacity(1 + versioned.len());
            payload.push(FLAG_RAW);
            payload.extend_from_slice(&versioned);
        }
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode one frame from the head of `buf`.
///
/// `offset` is the frame's position in the file, for diagnostics.
pub fn decode_frame(buf: &[u8], offset: u64) -> FolioResult<DecodedFrame> {
    if buf.len() < FRAME_HEADER {
        return Err(FolioError::wal_io(format!(
            "incomplete frame at offset {}: need {} header bytes, have {}",
            offset,
            FRAME_HEADER,
            buf.len()
        )));
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let expected_crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

    if len == 0 {
        return Err(FolioError::corruption(format!(
            "offset {}: zero-length frame",
            offset
        )));
    }
    if buf.len() < FRAME_HEADER + len {
        return Err(FolioError::wal_io(format!(
            "incomplete frame at offset {}: need {} bytes, have {}",
            offset,
            FRAME_HEADER + len,
            buf.len()
        )));
    }

    let payload = &buf[FRAME_HEADER..FRAME_HEADER + len];
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    let actual_crc = hasher.finalize();
    if actual_crc != expected_crc {
        return Err(FolioError::corruption(format!(
            "offset {}: CRC mismatch: expected {:08x}, got {:08x}",
            offset, expected_crc, actual_crc
        )));
    }

    let (flag, rest) = payload
        .split_first()
        .ok_or_else(|| FolioError::corruption(format!("offset {}: empty payload", offset)))?;
    let versioned_bytes = match *flag {
        FLAG_RAW => rest.to_vec(),
        FLAG_COMPRESSED => {
            let envelope: CompressionEnvelope = bincode::deserialize(rest)
                .map_err(|e| bincode_err("decode compression envelope", offset, e))?;
            decompress(&envelope)?
        }
        other => {
            return Err(FolioError::corruption(format!(
                "offset {}: unknown compression flag {}",
                offset, other
            )))
        }
    };

    let versioned: VersionedEntry = bincode::deserialize(&versioned_bytes)
        .map_err(|e| bincode_err("decode versioned entry", offset, e))?;

    if !WalEntryKind::is_known_tag(versioned.tag) {
        // Forward compatibility: skip, but consume the frame.
        return Ok(DecodedFrame {
            entry: None,
            consumed: FRAME_HEADER + len,
        });
    }

    let entry: WalEntry = bincode::deserialize(&versioned.body)
        .map_err(|e| bincode_err("decode WAL entry", offset, e))?;

    if entry.kind.tag() != versioned.tag {
        return Err(FolioError::corruption(format!(
            "offset {}: tag mismatch: frame says {}, entry is {}",
            offset,
            versioned.tag,
            entry.kind.tag()
        )));
    }

    Ok(DecodedFrame {
        entry: Some(entry),
        consumed: FRAME_HEADER + len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::now_millis;

    fn entry(kind: WalEntryKind) -> WalEntry {
        WalEntry {
            transaction_id: "tx-1".into(),
            sequence_number: 7,
            timestamp: now_millis(),
            kind,
            checksum: 0,
        }
    }

    #[test]
    fn round_trip_all_kinds() {
        let codec = CompressionCodec::disabled();
        let kinds = [
            WalEntryKind::Begin { timeout_ms: 5000 },
            WalEntryKind::Data {
                collection: "users".into(),
                operation: br#"{"seq":0,"op":"insert","document":{"id":1}}"#.to_vec(),
            },
            WalEntryKind::Prepare,
            WalEntryKind::Commit,
            WalEntryKind::Rollback,
            WalEntryKind::Checkpoint {
                checkpoint_id: "cp-1".into(),
                persisted_sequence: 6,
            },
        ];
        for kind in kinds {
            let original = entry(kind);
            let frame = encode_frame(&original, &codec).unwrap();
            let decoded = decode_frame(&frame, 0).unwrap();
            assert_eq!(decoded.entry, Some(original));
            assert_eq!(decoded.consumed, frame.len());
        }
    }

    #[test]
    fn crc_detects_bit_flip() {
        let codec = CompressionCodec::disabled();
        let mut frame = encode_frame(&entry(WalEntryKind::Commit), &codec).unwrap();
        let mid = frame.len() / 2;
        frame[mid] ^= 0xff;
        let err = decode_frame(&frame, 512).unwrap_err();
        match err {
            FolioError::WalCorruption { message } => {
                assert!(message.contains("512"));
            }
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn truncated_frame_is_incomplete_not_corrupt() {
        let codec = CompressionCodec::disabled();
        let frame = encode_frame(&entry(WalEntryKind::Commit), &codec).unwrap();
        let err = decode_frame(&frame[..frame.len() - 3], 0).unwrap_err();
        assert!(matches!(err, FolioError::WalIo { .. }));

        let err = decode_frame(&frame[..4], 0).unwrap_err();
        assert!(matches!(err, FolioError::WalIo { .. }));
    }

    #[test]
    fn zero_length_frame_is_corruption() {
        let mut buf = vec![0u8; 16];
        buf[0..4].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            decode_frame(&buf, 0),
            Err(FolioError::WalCorruption { .. })
        ));
    }

    #[test]
    fn large_entry_travels_compressed() {
        let codec = CompressionCodec::new(
            crate::compression::CompressionAlgorithm::Gzip,
            256,
        );
        let payload = vec![b'x'; 8192];
        let original = entry(WalEntryKind::Data {
            collection: "logs".into(),
            operation: payload,
        });
        let frame = encode_frame(&original, &codec).unwrap();
        assert!(frame.len() < 8192, "frame should be compressed");
        assert_eq!(frame[FRAME_HEADER], 1, "compression flag expected");
        let decoded = decode_frame(&frame, 0).unwrap();
        assert_eq!(decoded.entry, Some(original));
    }

    #[test]
    fn unknown_tag_is_skipped() {
        // hand-build a frame whose versioned tag is outside the known range
        let versioned = bincode::serialize(&VersionedEntry {
            format_version: FORMAT_VERSION,
            tag: 42,
            body: vec![1, 2, 3],
        })
        .unwrap();
        let mut payload = vec![FLAG_RAW];
        payload.extend_from_slice(&versioned);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();
        let mut frame = Vec::new();
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&payload);

        let decoded = decode_frame(&frame, 0).unwrap();
        assert!(decoded.entry.is_none());
        assert_eq!(decoded.consumed, frame.len());
    }
}
