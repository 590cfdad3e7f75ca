//! The primary list: ordered record storage under a monotonic counter
//!
//! The list maps slot IDs to stored records. Slot IDs come from a counter
//! that never decreases and never reuses values within a collection
//! lifetime, including across deletes and reloads. Iteration is a lazy,
//! finite, non-restartable pass in forward or backward slot order.
//!
//! Two variants exist: the in-memory list here, and a per-record file list
//! in the storage crate.

use crate::error::{FolioError, FolioResult};
use crate::idgen::ListStats;
use crate::record::StoredRecord;
use crate::types::SlotId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Contract of a collection's primary list.
pub trait RecordList: Send {
    /// Fetch a record by slot.
    fn get(&self, slot: SlotId) -> Option<StoredRecord>;

    /// Store a record at a slot (insert path).
    fn set(&mut self, slot: SlotId, record: StoredRecord) -> FolioResult<()>;

    /// Replace an existing record (update path). Fails with `NotFound` when
    /// the slot is vacant.
    fn update(&mut self, slot: SlotId, record: StoredRecord) -> FolioResult<()>;

    /// Remove and return the record at a slot.
    fn delete(&mut self, slot: SlotId) -> FolioResult<StoredRecord>;

    /// Drop all records. The counter is preserved: slot IDs are never
    /// reused, even across resets.
    fn reset(&mut self) -> FolioResult<()>;

    /// Number of records currently stored.
    fn len(&self) -> usize;

    /// True when no records are stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current counter value (the next slot to be allocated).
    fn counter(&self) -> u64;

    /// Allocate the next slot, advancing the counter.
    fn next_slot(&mut self) -> SlotId;

    /// Counters snapshot for ID generators.
    fn stats(&self) -> ListStats {
        ListStats {
            counter: self.counter(),
            len: self.len(),
        }
    }

    /// Lazy forward iteration in slot order.
    fn iter_forward(&self) -> Box<dyn Iterator<Item = StoredRecord> + '_>;

    /// Lazy backward iteration in slot order.
    fn iter_backward(&self) -> Box<dyn Iterator<Item = StoredRecord> + '_>;

    /// Snapshot the list into its persisted form.
    fn to_persist(&self) -> ListPersistForm;

    /// Replace the list contents from a persisted form.
    fn load_persist(&mut self, form: ListPersistForm) -> FolioResult<()>;
}

/// Serialized form of a list: the counter plus every record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ListPersistForm {
    /// Monotonic counter at snapshot time
    pub counter: u64,
    /// Records in slot order
    pub records: Vec<StoredRecord>,
}

/// Fully in-memory list over a slot-ordered tree.
#[derive(Debug, Clone, Default)]
pub struct MemoryList {
    records: BTreeMap<SlotId, StoredRecord>,
    counter: u64,
}

impl MemoryList {
    /// Empty list with the counter at zero.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordList for MemoryList {
    fn get(&self, slot: SlotId) -> Option<StoredRecord> {
        self.records.get(&slot).cloned()
    }

    fn set(&mut self, slot: SlotId, record: StoredRecord) -> FolioResult<()> {
        self.records.insert(slot, record);
        Ok(())
    }

    fn update(&mut self, slot: SlotId, record: StoredRecord) -> FolioResult<()> {
        match self.records.get_mut(&slot) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(FolioError::not_found(format!("list slot {}", slot))),
        }
    }

    fn delete(&mut self, slot: SlotId) -> FolioResult<StoredRecord> {
        self.records
            .remove(&slot)
            .ok_or_else(|| FolioError::not_found(format!("list slot {}", slot)))
    }

    fn reset(&mut self) -> FolioResult<()> {
        self.records.clear();
        Ok(())
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn counter(&self) -> u64 {
        self.counter
    }

    fn next_slot(&mut self) -> SlotId {
        let slot = SlotId(self.counter);
        self.counter += 1;
        slot
    }

    fn iter_forward(&self) -> Box<dyn Iterator<Item = StoredRecord> + '_> {
        Box::new(self.records.values().cloned())
    }

    fn iter_backward(&self) -> Box<dyn Iterator<Item = StoredRecord> + '_> {
        Box::new(self.records.values().rev().cloned())
    }

    fn to_persist(&self) -> ListPersistForm {
        ListPersistForm {
            counter: self.counter,
            records: self.records.values().cloned().collect(),
        }
    }

    fn load_persist(&mut self, form: ListPersistForm) -> FolioResult<()> {
        self.records.clear();
        // Counter only moves forward: a reload may never shrink it below
        // what this process already allocated.
        self.counter = self.counter.max(form.counter);
        for record in form.records {
            self.records.insert(record.slot, record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(list: &mut MemoryList, value: i64) -> SlotId {
        let slot = list.next_slot();
        list.set(slot, StoredRecord::new(slot, json!({"v": value}), false))
            .unwrap();
        slot
    }

    #[test]
    fn counter_never_reuses_slots() {
        let mut list = MemoryList::new();
        let a = record(&mut list, 1);
        let b = record(&mut list, 2);
        list.delete(a).unwrap();
        let c = record(&mut list, 3);
        assert!(c > b);
        assert_eq!(list.counter(), 3);
    }

    #[test]
    fn reset_preserves_counter() {
        let mut list = MemoryList::new();
        record(&mut list, 1);
        record(&mut list, 2);
        list.reset().unwrap();
        assert_eq!(list.len(), 0);
        assert_eq!(list.counter(), 2);
        let next = list.next_slot();
        assert_eq!(next, SlotId(2));
    }

    #[test]
    fn update_requires_existing_slot() {
        let mut list = MemoryList::new();
        let slot = record(&mut list, 1);
        let mut rec = list.get(slot).unwrap();
        rec.data = json!({"v": 10});
        list.update(slot, rec).unwrap();
        assert_eq!(list.get(slot).unwrap().data, json!({"v": 10}));

        let err = list
            .update(SlotId(99), StoredRecord::new(SlotId(99), json!({}), false))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn iteration_directions() {
        let mut list = MemoryList::new();
        for v in 0..4 {
            record(&mut list, v);
        }
        let forward: Vec<i64> = list
            .iter_forward()
            .map(|r| r.data["v"].as_i64().unwrap())
            .collect();
        let backward: Vec<i64> = list
            .iter_backward()
            .map(|r| r.data["v"].as_i64().unwrap())
            .collect();
        assert_eq!(forward, vec![0, 1, 2, 3]);
        assert_eq!(backward, vec![3, 2, 1, 0]);
    }

    #[test]
    fn persist_round_trip_keeps_counter_monotonic() {
        let mut list = MemoryList::new();
        record(&mut list, 1);
        record(&mut list, 2);
        let form = list.to_persist();

        let mut reloaded = MemoryList::new();
        reloaded.load_persist(form.clone()).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.counter(), 2);

        // loading an older snapshot into a further-advanced list must not
        // rewind the counter
        let mut advanced = MemoryList::new();
        for v in 0..5 {
            record(&mut advanced, v);
        }
        advanced.load_persist(form).unwrap();
        assert_eq!(advanced.counter(), 5);
    }
}
