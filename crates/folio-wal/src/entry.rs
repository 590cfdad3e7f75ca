//! WAL entry types
//!
//! Every entry carries the owning transaction id, its log-assigned
//! sequence number, a timestamp, and a checksum over the encoded kind.
//! Entry kinds:
//!
//! - `Begin`: transaction opened
//! - `Data`: one staged mutation (the operation travels as JSON bytes)
//! - `Prepare`: all participants are about to vote
//! - `Commit`: the durable commit marker
//! - `Rollback`: transaction discarded
//! - `Checkpoint`: snapshot boundary; earlier entries may be truncated

use serde::{Deserialize, Serialize};

/// Entry type tags, stable across versions for forward compatibility.
pub const TAG_BEGIN: u8 = 1;
/// Tag for `Data` entries.
pub const TAG_DATA: u8 = 2;
/// Tag for `Prepare` entries.
pub const TAG_PREPARE: u8 = 3;
/// Tag for `Commit` entries.
pub const TAG_COMMIT: u8 = 4;
/// Tag for `Rollback` entries.
pub const TAG_ROLLBACK: u8 = 5;
/// Tag for `Checkpoint` entries.
pub const TAG_CHECKPOINT: u8 = 6;

/// One write-ahead-log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Transaction this entry belongs to (checkpoints use their own id)
    pub transaction_id: String,
    /// Log-assigned, strictly increasing sequence number
    pub sequence_number: u64,
    /// Append time, epoch milliseconds
    pub timestamp: u64,
    /// What happened
    pub kind: WalEntryKind,
    /// CRC32 over the bincode-encoded kind
    pub checksum: u32,
}

/// The payload of a WAL entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// Transaction opened
    Begin {
        /// Transaction timeout in milliseconds
        timeout_ms: u64,
    },
    /// One staged mutation
    Data {
        /// Collection the mutation targets
        collection: String,
        /// JSON-encoded `WriteOperation` (self-describing so documents
        /// survive the binary framing)
        operation: Vec<u8>,
    },
    /// Prepare phase entered; the transaction can no longer be timed out
    Prepare,
    /// Durable commit marker
    Commit,
    /// Transaction discarded
    Rollback,
    /// Snapshot boundary
    Checkpoint {
        /// Identifier of the persisted snapshot set
        checkpoint_id: String,
        /// Highest sequence number covered by the snapshots
        persisted_sequence: u64,
    },
}

impl WalEntryKind {
    /// The stable on-disk tag for this kind.
    pub fn tag(&self) -> u8 {
        match self {
            WalEntryKind::Begin { .. } => TAG_BEGIN,
            WalEntryKind::Data { .. } => TAG_DATA,
            WalEntryKind::Prepare => TAG_PREPARE,
            WalEntryKind::Commit => TAG_COMMIT,
            WalEntryKind::Rollback => TAG_ROLLBACK,
            WalEntryKind::Checkpoint { .. } => TAG_CHECKPOINT,
        }
    }

    /// Whether this tag is known to this version of the codec.
    pub fn is_known_tag(tag: u8) -> bool {
        (TAG_BEGIN..=TAG_CHECKPOINT).contains(&tag)
    }
}

impl WalEntry {
    /// Whether this entry marks a transaction boundary.
    pub fn is_boundary(&self) -> bool {
        matches!(
            self.kind,
            WalEntryKind::Begin { .. }
                | WalEntryKind::Commit
                | WalEntryKind::Rollback
                | WalEntryKind::Prepare
        )
    }

    /// Whether this entry must be synced to disk before the append returns.
    pub fn requires_sync(&self) -> bool {
        matches!(
            self.kind,
            WalEntryKind::Commit | WalEntryKind::Checkpoint { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_distinct_and_known() {
        let kinds = [
            WalEntryKind::Begin { timeout_ms: 1000 },
            WalEntryKind::Data {
                collection: "users".into(),
                operation: vec![1, 2, 3],
            },
            WalEntryKind::Prepare,
            WalEntryKind::Commit,
            WalEntryKind::Rollback,
            WalEntryKind::Checkpoint {
                checkpoint_id: "c".into(),
                persisted_sequence: 9,
            },
        ];
        let mut seen = std::collections::HashSet::new();
        for kind in &kinds {
            assert!(seen.insert(kind.tag()), "duplicate tag {}", kind.tag());
            assert!(WalEntryKind::is_known_tag(kind.tag()));
        }
        assert!(!WalEntryKind::is_known_tag(0));
        assert!(!WalEntryKind::is_known_tag(99));
    }

    #[test]
    fn sync_only_on_durability_points() {
        let commit = WalEntry {
            transaction_id: "t".into(),
            sequence_number: 1,
            timestamp: 0,
            kind: WalEntryKind::Commit,
            checksum: 0,
        };
        assert!(commit.requires_sync());

        let data = WalEntry {
            kind: WalEntryKind::Data {
                collection: "c".into(),
                operation: vec![],
            },
            ..commit.clone()
        };
        assert!(!data.requires_sync());
    }
}
