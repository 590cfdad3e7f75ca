//! Transactional staging wrapper
//!
//! Wraps any storage adapter with per-transaction staging for the WAL
//! commit protocol. Staged operations and staged snapshots are keyed by
//! transaction id and invisible to everything outside that transaction
//! until `finalize`; `rollback` discards them wholesale.
//!
//! The wrapper is deliberately passive: it stages and validates, but the
//! collection applies the staged operations to its in-memory state during
//! finalize, and the transaction manager drives the phase ordering.

use crate::adapter::StorageAdapter;
use crate::state::StoredState;
use folio_core::{Document, FolioError, FolioResult, IndexKey};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// One staged logical mutation.
///
/// Documents are carried as full post-images so replay is a plain `set`,
/// which keeps recovery idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOperation {
    /// Position within the transaction, assigned at staging time
    pub seq: u64,
    /// The mutation itself
    #[serde(flatten)]
    pub kind: WriteKind,
}

/// Mutation kinds staged under a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteKind {
    /// Insert a new document (post-generation, so ids are final)
    Insert {
        /// The complete document being inserted
        document: Document,
    },
    /// Replace an existing document
    Update {
        /// Primary key of the document being replaced
        primary_key: IndexKey,
        /// Post-image
        document: Document,
        /// Pre-image, for change records
        previous: Document,
    },
    /// Remove a document
    Remove {
        /// Primary key of the document being removed
        primary_key: IndexKey,
        /// Pre-image, for change records
        previous: Document,
    },
}

/// Staging area for one transaction.
#[derive(Debug, Default)]
pub struct TxStage {
    /// Operations in staging order
    pub ops: Vec<WriteOperation>,
    /// Snapshots stored under this transaction only
    pub stored: FxHashMap<String, StoredState>,
    /// Set once `prepare_commit` voted yes
    pub prepared: bool,
    next_seq: u64,
}

/// Adapter wrapper adding the prepare/finalize/rollback protocol.
pub struct TransactionalAdapter {
    inner: Box<dyn StorageAdapter>,
    stages: FxHashMap<String, TxStage>,
}

impl TransactionalAdapter {
    /// Wrap an inner adapter.
    pub fn new(inner: Box<dyn StorageAdapter>) -> Self {
        TransactionalAdapter {
            inner,
            stages: FxHashMap::default(),
        }
    }

    /// The wrapped adapter, for non-transactional restore/store.
    pub fn inner(&mut self) -> &mut dyn StorageAdapter {
        self.inner.as_mut()
    }

    /// Allocate a staging area. Idempotent.
    pub fn begin_transaction(&mut self, tx_id: &str) {
        self.stages.entry(tx_id.to_string()).or_default();
    }

    /// True when a staging area exists for the transaction.
    pub fn has_transaction(&self, tx_id: &str) -> bool {
        self.stages.contains_key(tx_id)
    }

    /// Stage a mutation, assigning its in-transaction sequence.
    pub fn write_operation(&mut self, tx_id: &str, kind: WriteKind) -> FolioResult<u64> {
        let stage = self.stage_mut(tx_id)?;
        if stage.prepared {
            return Err(FolioError::aborted(
                tx_id,
                "write after prepare is not allowed",
            ));
        }
        let seq = stage.next_seq;
        stage.next_seq += 1;
        stage.ops.push(WriteOperation { seq, kind });
        Ok(seq)
    }

    /// Re-stage an operation during recovery replay. Idempotent on the
    /// operation's sequence number: replaying the same WAL twice stages
    /// each operation once.
    pub fn write_operation_replayed(
        &mut self,
        tx_id: &str,
        op: WriteOperation,
    ) -> FolioResult<()> {
        self.begin_transaction(tx_id);
        let stage = self.stage_mut(tx_id)?;
        if stage.ops.iter().any(|existing| existing.seq == op.seq) {
            return Ok(());
        }
        stage.next_seq = stage.next_seq.max(op.seq + 1);
        stage.ops.push(op);
        stage.ops.sort_by_key(|o| o.seq);
        Ok(())
    }

    /// Operations staged so far, in order.
    pub fn staged_ops(&self, tx_id: &str) -> &[WriteOperation] {
        self.stages
            .get(tx_id)
            .map(|s| s.ops.as_slice())
            .unwrap_or(&[])
    }

    /// Verify the staging area is internally consistent and persistable.
    /// Returns `false` to veto the commit.
    pub fn prepare_commit(&mut self, tx_id: &str) -> FolioResult<bool> {
        let stage = self.stage_mut(tx_id)?;
        // Consistency: staging order must be gap-free from zero. Gaps mean
        // lost operations (a torn replay) and veto the commit.
        for (i, op) in stage.ops.iter().enumerate() {
            if op.seq != i as u64 {
                return Ok(false);
            }
        }
        stage.prepared = true;
        Ok(true)
    }

    /// Detach the staging area for finalize. The collection applies the
    /// operations and persists through the inner adapter.
    pub fn take_staged(&mut self, tx_id: &str) -> FolioResult<TxStage> {
        self.stages
            .remove(tx_id)
            .ok_or_else(|| FolioError::not_found(format!("transaction staging {}", tx_id)))
    }

    /// Discard the staging area.
    pub fn rollback(&mut self, tx_id: &str) {
        self.stages.remove(tx_id);
    }

    /// Stage a snapshot visible only under this transaction. It is written
    /// through the inner adapter at finalize.
    pub fn store_in_transaction(
        &mut self,
        tx_id: &str,
        state: StoredState,
        name: &str,
    ) -> FolioResult<()> {
        let stage = self.stage_mut(tx_id)?;
        stage.stored.insert(name.to_string(), state);
        Ok(())
    }

    /// Write every snapshot staged by `stage` through the inner adapter.
    pub fn flush_staged_stores(&mut self, stage: &TxStage) -> FolioResult<()> {
        for (name, state) in &stage.stored {
            self.inner.store(state, Some(name))?;
        }
        Ok(())
    }

    fn stage_mut(&mut self, tx_id: &str) -> FolioResult<&mut TxStage> {
        self.stages
            .get_mut(tx_id)
            .ok_or_else(|| FolioError::not_found(format!("transaction staging {}", tx_id)))
    }
}
