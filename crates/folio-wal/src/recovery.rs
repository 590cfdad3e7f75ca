//! Crash recovery by forward WAL replay
//!
//! Scans the log from the front: `BEGIN` opens an in-flight buffer,
//! `DATA` entries accumulate per transaction, `COMMIT` replays the
//! buffered operations into the owning participants in order, `ROLLBACK`
//! drops the buffer. Whatever is still in flight at the end of the log,
//! including a `PREPARE` without a `COMMIT`, is presumed aborted.
//!
//! A corrupt frame stops the scan at the last valid entry; recovery
//! reports the truncation and proceeds with the prefix rather than
//! refusing to start. Replay is idempotent because operations carry full
//! post-images, so running the same WAL twice lands on the same state.

use crate::entry::WalEntryKind;
use crate::log::WalFile;
use crate::manager::TransactionParticipant;
use folio_core::FolioResult;
use folio_storage::WriteOperation;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// What recovery did.
#[derive(Debug, Clone, Default)]
pub struct RecoverySummary {
    /// Entries scanned (unknown-type entries excluded)
    pub entries_scanned: usize,
    /// Committed transactions replayed
    pub transactions_committed: usize,
    /// Individual operations applied
    pub operations_replayed: usize,
    /// In-flight transactions presumed aborted at end of log
    pub transactions_aborted: usize,
    /// Highest sequence number seen
    pub last_sequence: u64,
    /// Corruption that cut the scan short, if any
    pub corrupt_tail: Option<String>,
}

impl RecoverySummary {
    /// One-line human summary.
    pub fn summary(&self) -> String {
        format!(
            "recovered {} entries: {} transactions committed ({} operations), {} aborted, last sequence {}{}",
            self.entries_scanned,
            self.transactions_committed,
            self.operations_replayed,
            self.transactions_aborted,
            self.last_sequence,
            match &self.corrupt_tail {
                Some(reason) => format!(", corrupt tail: {}", reason),
                None => String::new(),
            }
        )
    }
}

#[derive(Default)]
struct InFlight {
    prepared: bool,
    ops: Vec<(String, WriteOperation)>,
}

/// Replay the log into `participants` (keyed by participant name, which
/// equals the collection name in DATA entries).
pub fn recover(
    wal: &mut WalFile,
    participants: &HashMap<String, Arc<dyn TransactionParticipant>>,
) -> FolioResult<RecoverySummary> {
    let (entries, corrupt_tail) = wal.read_from(0)?;

    let mut summary = RecoverySummary {
        corrupt_tail,
        ..Default::default()
    };
    let mut in_flight: HashMap<String, InFlight> = HashMap::new();
    let mut touched: Vec<String> = Vec::new();

    for entry in &entries {
        summary.entries_scanned += 1;
        summary.last_sequence = entry.sequence_number;
        let tx_id = entry.transaction_id.clone();
        match &entry.kind {
            WalEntryKind::Begin { .. } => {
                in_flight.entry(tx_id).or_default();
            }
            WalEntryKind::Data {
                collection,
                operation,
            } => {
                let op: WriteOperation = match serde_json::from_slice(operation) {
                    Ok(op) => op,
                    Err(e) => {
                        warn!(tx = %tx_id, error = %e, "undecodable DATA operation skipped");
                        continue;
                    }
                };
                in_flight
                    .entry(tx_id)
                    .or_default()
                    .ops
                    .push((collection.clone(), op));
            }
            WalEntryKind::Prepare => {
                if let Some(buffer) = in_flight.get_mut(&tx_id) {
                    buffer.prepared = true;
                }
            }
            WalEntryKind::Commit => {
                let Some(buffer) = in_flight.remove(&tx_id) else {
                    continue;
                };
                for (collection, op) in &buffer.ops {
                    let Some(participant) = participants.get(collection) else {
                        warn!(
                            tx = %tx_id,
                            collection = %collection,
                            "no participant registered for replay; operation dropped"
                        );
                        continue;
                    };
                    participant.apply_replay(op)?;
                    summary.operations_replayed += 1;
                    if !touched.contains(collection) {
                        touched.push(collection.clone());
                    }
                }
                summary.transactions_committed += 1;
            }
            WalEntryKind::Rollback => {
                in_flight.remove(&tx_id);
            }
            WalEntryKind::Checkpoint { .. } => {}
        }
    }

    // Presumed abort: whatever is still open (prepared or not) is gone.
    // Its staged state died with the crashed process, so there is nothing
    // to undo.
    summary.transactions_aborted = in_flight.len();
    for (tx_id, buffer) in &in_flight {
        warn!(
            tx = %tx_id,
            prepared = buffer.prepared,
            buffered_ops = buffer.ops.len(),
            "in-flight transaction presumed aborted"
        );
    }

    // Persist the replayed state so a second crash does not need this WAL.
    for collection in &touched {
        if let Some(participant) = participants.get(collection) {
            participant.persist_snapshot()?;
        }
    }

    info!("{}", summary.summary());
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionCodec;
    use crate::entry::WalEntryKind;
    use folio_core::FolioResult;
    use folio_storage::WriteKind;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Participant that records replayed operations.
    struct ReplaySink {
        name: String,
        replayed: Mutex<Vec<WriteOperation>>,
        persisted: Mutex<usize>,
    }

    impl ReplaySink {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(ReplaySink {
                name: name.to_string(),
                replayed: Mutex::new(Vec::new()),
                persisted: Mutex::new(0),
            })
        }
    }

    impl TransactionParticipant for ReplaySink {
        fn participant_name(&self) -> String {
            self.name.clone()
        }
        fn begin_transaction(&self, _tx_id: &str) -> FolioResult<()> {
            Ok(())
        }
        fn prepare_commit(&self, _tx_id: &str) -> FolioResult<bool> {
            Ok(true)
        }
        fn finalize_commit(&self, _tx_id: &str) -> FolioResult<()> {
            Ok(())
        }
        fn rollback(&self, _tx_id: &str) -> FolioResult<()> {
            Ok(())
        }
        fn apply_replay(&self, op: &WriteOperation) -> FolioResult<()> {
            self.replayed.lock().push(op.clone());
            Ok(())
        }
        fn persist_snapshot(&self) -> FolioResult<()> {
            *self.persisted.lock() += 1;
            Ok(())
        }
    }

    fn data_entry(v: i64) -> Vec<u8> {
        serde_json::to_vec(&WriteOperation {
            seq: 0,
            kind: WriteKind::Insert {
                document: json!({"id": v}),
            },
        })
        .unwrap()
    }

    fn wal(dir: &std::path::Path) -> WalFile {
        WalFile::open(dir.join("folio.wal"), CompressionCodec::disabled(), 0).unwrap()
    }

    #[test]
    fn committed_replays_prepared_without_commit_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = wal(dir.path());

        // T1 commits
        log.append("t1", WalEntryKind::Begin { timeout_ms: 1000 }).unwrap();
        log.append(
            "t1",
            WalEntryKind::Data {
                collection: "users".into(),
                operation: data_entry(1),
            },
        )
        .unwrap();
        log.append("t1", WalEntryKind::Prepare).unwrap();
        log.append("t1", WalEntryKind::Commit).unwrap();

        // T2 crashes between PREPARE and COMMIT
        log.append("t2", WalEntryKind::Begin { timeout_ms: 1000 }).unwrap();
        log.append(
            "t2",
            WalEntryKind::Data {
                collection: "users".into(),
                operation: data_entry(2),
            },
        )
        .unwrap();
        log.append("t2", WalEntryKind::Prepare).unwrap();

        let sink = ReplaySink::new("users");
        let mut participants: HashMap<String, Arc<dyn TransactionParticipant>> = HashMap::new();
        participants.insert("users".into(), sink.clone());

        let summary = recover(&mut log, &participants).unwrap();
        assert_eq!(summary.transactions_committed, 1);
        assert_eq!(summary.operations_replayed, 1);
        assert_eq!(summary.transactions_aborted, 1);
        assert!(summary.corrupt_tail.is_none());

        let replayed = sink.replayed.lock();
        assert_eq!(replayed.len(), 1);
        assert!(matches!(
            &replayed[0].kind,
            WriteKind::Insert { document } if document["id"] == 1
        ));
        assert_eq!(*sink.persisted.lock(), 1);
    }

    #[test]
    fn rolled_back_transactions_do_not_replay() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = wal(dir.path());
        log.append("t1", WalEntryKind::Begin { timeout_ms: 1000 }).unwrap();
        log.append(
            "t1",
            WalEntryKind::Data {
                collection: "users".into(),
                operation: data_entry(1),
            },
        )
        .unwrap();
        log.append("t1", WalEntryKind::Rollback).unwrap();

        let sink = ReplaySink::new("users");
        let mut participants: HashMap<String, Arc<dyn TransactionParticipant>> = HashMap::new();
        participants.insert("users".into(), sink.clone());

        let summary = recover(&mut log, &participants).unwrap();
        assert_eq!(summary.transactions_committed, 0);
        assert_eq!(summary.transactions_aborted, 0);
        assert!(sink.replayed.lock().is_empty());
    }

    #[test]
    fn replay_order_follows_data_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = wal(dir.path());
        log.append("t1", WalEntryKind::Begin { timeout_ms: 1000 }).unwrap();
        for v in 1..=3 {
            log.append(
                "t1",
                WalEntryKind::Data {
                    collection: "users".into(),
                    operation: data_entry(v),
                },
            )
            .unwrap();
        }
        log.append("t1", WalEntryKind::Commit).unwrap();

        let sink = ReplaySink::new("users");
        let mut participants: HashMap<String, Arc<dyn TransactionParticipant>> = HashMap::new();
        participants.insert("users".into(), sink.clone());
        recover(&mut log, &participants).unwrap();

        let ids: Vec<i64> = sink
            .replayed
            .lock()
            .iter()
            .map(|op| match &op.kind {
                WriteKind::Insert { document } => document["id"].as_i64().unwrap(),
                _ => panic!("unexpected kind"),
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
