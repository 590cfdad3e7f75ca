//! Cross-adapter behavior tests

use folio_core::{IndexDefinition, IndexKey, SecondaryIndex, SlotId, StoredRecord};
use folio_storage::{
    FileAdapter, MemoryAdapter, PerRecordAdapter, StorageAdapter, StoredState,
    TransactionalAdapter, WriteKind, WriteOperation,
};
use serde_json::json;

fn sample_state() -> StoredState {
    let def = IndexDefinition::new("name").ignore_case();
    let mut index = SecondaryIndex::for_definition(&def);
    index.insert(IndexKey::from("ada"), IndexKey::Int(0));
    index.insert(IndexKey::from("bo"), IndexKey::Int(1));

    let mut state = StoredState::empty("id");
    state.ttl_ms = Some(60_000);
    state.index_defs.insert("name".into(), def.clone());
    state.indexes.insert("name".into(), index.to_portable(&def));
    state.list.counter = 2;
    for (slot, id, name) in [(0u64, 0i64, "Ada"), (1, 1, "Bo")] {
        state.list.records.push(StoredRecord::new(
            SlotId(slot),
            json!({"id": id, "name": name}),
            false,
        ));
    }
    state
}

#[test]
fn every_backend_round_trips_the_same_state() {
    let dir = tempfile::tempdir().unwrap();
    let state = sample_state();

    let mut adapters: Vec<Box<dyn StorageAdapter>> = vec![
        Box::new(MemoryAdapter::new("users")),
        Box::new(FileAdapter::new(dir.path().join("file"), "users")),
        Box::new(PerRecordAdapter::new(dir.path().join("per-record"), "users")),
    ];

    for adapter in adapters.iter_mut() {
        assert!(adapter.restore(None).unwrap().is_none());
        adapter.store(&state, None).unwrap();
        let restored = adapter.restore(None).unwrap().unwrap();
        assert_eq!(restored, state, "{:?} backend", adapter.kind());

        // restored trees re-materialize with the same contents
        let portable = &restored.indexes["name"];
        let tree = SecondaryIndex::from_portable(portable);
        assert_eq!(tree.lookup(&IndexKey::from("ada")), &[IndexKey::Int(0)]);
    }
}

#[test]
fn cloned_adapters_share_nothing_forward() {
    let dir = tempfile::tempdir().unwrap();
    let mut original = FileAdapter::new(dir.path(), "users");
    original.store(&sample_state(), None).unwrap();

    let mut cloned = original.clone_adapter();
    // the clone reads what the original wrote
    assert!(cloned.restore(None).unwrap().is_some());
    // and writes under another name without touching the original slot
    cloned
        .store(&StoredState::empty("id"), Some("users-copy"))
        .unwrap();
    assert_eq!(
        original.restore(None).unwrap().unwrap().list.records.len(),
        2
    );
}

#[test]
fn staged_operations_are_isolated_per_transaction() {
    let mut adapter = TransactionalAdapter::new(Box::new(MemoryAdapter::new("users")));
    adapter.begin_transaction("t1");
    adapter.begin_transaction("t2");

    adapter
        .write_operation(
            "t1",
            WriteKind::Insert {
                document: json!({"id": 1}),
            },
        )
        .unwrap();
    adapter
        .write_operation(
            "t2",
            WriteKind::Remove {
                primary_key: IndexKey::Int(9),
                previous: json!({"id": 9}),
            },
        )
        .unwrap();

    assert_eq!(adapter.staged_ops("t1").len(), 1);
    assert_eq!(adapter.staged_ops("t2").len(), 1);
    assert!(matches!(
        adapter.staged_ops("t1")[0].kind,
        WriteKind::Insert { .. }
    ));
    assert!(matches!(
        adapter.staged_ops("t2")[0].kind,
        WriteKind::Remove { .. }
    ));

    // finalize one, roll the other back
    assert!(adapter.prepare_commit("t1").unwrap());
    let stage = adapter.take_staged("t1").unwrap();
    assert_eq!(stage.ops.len(), 1);
    adapter.rollback("t2");
    assert!(adapter.staged_ops("t2").is_empty());
}

#[test]
fn replayed_operations_keep_their_sequence_order() {
    let mut adapter = TransactionalAdapter::new(Box::new(MemoryAdapter::new("users")));
    // replay arrives out of order
    for seq in [2u64, 0, 1] {
        adapter
            .write_operation_replayed(
                "t1",
                WriteOperation {
                    seq,
                    kind: WriteKind::Insert {
                        document: json!({"id": seq}),
                    },
                },
            )
            .unwrap();
    }
    let sequences: Vec<u64> = adapter.staged_ops("t1").iter().map(|op| op.seq).collect();
    assert_eq!(sequences, vec![0, 1, 2]);
    assert!(adapter.prepare_commit("t1").unwrap());
}

#[test]
fn tombstoned_records_survive_per_record_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut adapter = PerRecordAdapter::new(dir.path(), "ledger");

    let mut live = StoredRecord::new(SlotId(0), json!({"id": 0, "v": 1}), true);
    live.tombstone();
    let mut state = StoredState::empty("id");
    state.list.counter = 1;
    state.list.records.push(live);
    adapter.store(&state, None).unwrap();

    let restored = adapter.restore(None).unwrap().unwrap();
    assert_eq!(restored.list.records.len(), 1);
    assert!(restored.list.records[0].deleted_at.is_some());
    assert!(restored.list.records[0].checksum.is_some());
}
