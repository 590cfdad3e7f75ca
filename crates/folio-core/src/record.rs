//! The stored-record envelope
//!
//! Every document in a collection's primary list is wrapped in a
//! `StoredRecord` carrying slot, timestamps, and a version. In audit mode
//! removal tombstones the record in place (`deleted_at` set, indexes
//! cleared) instead of deleting the slot, and a checksum of the document
//! bytes is maintained for tamper evidence.
//!
//! Record state machine:
//!
//! ```text
//! (absent) --create--> live
//! live --update--> live
//! live --remove--> (absent)            [non-audit]
//! live --remove | TTL expiry--> tombstoned   [audit]
//! tombstoned --purge--> (absent)
//! ```

use crate::ttl::now_millis;
use crate::types::{Document, SlotId};
use serde::{Deserialize, Serialize};

/// A document plus its audit envelope, as held in the primary list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Slot in the primary list (internal, never reused)
    pub slot: SlotId,
    /// The user document
    pub data: Document,
    /// Creation time, epoch milliseconds
    pub created_at: u64,
    /// Last update time, epoch milliseconds
    pub updated_at: u64,
    /// Tombstone marker; only ever set in audit mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<u64>,
    /// Monotonic per-record version, starts at 1
    pub version: u64,
    /// CRC32 of the canonical document bytes; only kept in audit mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<u32>,
}

impl StoredRecord {
    /// Wrap a freshly inserted document.
    pub fn new(slot: SlotId, data: Document, audit: bool) -> Self {
        let now = now_millis();
        let checksum = audit.then(|| checksum_of(&data));
        StoredRecord {
            slot,
            data,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 1,
            checksum,
        }
    }

    /// A record is live unless tombstoned.
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Replace the document, bumping version and `updated_at`.
    pub fn replace_data(&mut self, data: Document, audit: bool) {
        self.data = data;
        self.version += 1;
        self.updated_at = now_millis();
        if audit {
            self.checksum = Some(checksum_of(&self.data));
        }
    }

    /// Tombstone the record in place (audit mode removal).
    pub fn tombstone(&mut self) {
        self.deleted_at = Some(now_millis());
        self.version += 1;
    }
}

/// CRC32 over the canonical JSON bytes of a document.
pub fn checksum_of(data: &Document) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    // to_string on a Value cannot fail
    hasher.update(data.to_string().as_bytes());
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_record_is_live_version_one() {
        let rec = StoredRecord::new(SlotId(1), json!({"a": 1}), false);
        assert!(rec.is_live());
        assert_eq!(rec.version, 1);
        assert!(rec.checksum.is_none());
    }

    #[test]
    fn audit_mode_tracks_checksum() {
        let mut rec = StoredRecord::new(SlotId(1), json!({"a": 1}), true);
        let first = rec.checksum.unwrap();
        rec.replace_data(json!({"a": 2}), true);
        assert_ne!(rec.checksum.unwrap(), first);
        assert_eq!(rec.version, 2);
    }

    #[test]
    fn tombstone_marks_deleted() {
        let mut rec = StoredRecord::new(SlotId(3), json!({"a": 1}), true);
        rec.tombstone();
        assert!(!rec.is_live());
        assert!(rec.deleted_at.is_some());
    }

    #[test]
    fn envelope_serde_skips_absent_fields() {
        let rec = StoredRecord::new(SlotId(1), json!({"a": 1}), false);
        let text = serde_json::to_string(&rec).unwrap();
        assert!(!text.contains("deleted_at"));
        assert!(!text.contains("checksum"));
        let back: StoredRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(rec, back);
    }
}
