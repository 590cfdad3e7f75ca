//! Shared collection handle
//!
//! Wraps a collection in `Arc<Mutex<..>>` so the transaction manager can
//! hold a weak reference to it as a participant, and rotation/timer
//! threads can reach it. The manager never owns the collection; callers
//! must not hold the lock across `TransactionManager::commit`, which
//! re-enters through the participant hooks.

use crate::engine::Collection;
use folio_core::FolioResult;
use folio_storage::WriteOperation;
use folio_wal::{TransactionManager, TransactionParticipant};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// `Arc<Mutex<Collection>>` with the participant protocol attached.
pub struct SharedCollection {
    name: String,
    inner: Mutex<Collection>,
}

impl SharedCollection {
    /// Wrap a collection for sharing.
    pub fn new(collection: Collection) -> Arc<Self> {
        Arc::new(SharedCollection {
            name: collection.name().to_string(),
            inner: Mutex::new(collection),
        })
    }

    /// Wrap and register with a transaction manager in one step. The
    /// collection is bound to the manager for its `_tx` write paths.
    pub fn new_registered(
        mut collection: Collection,
        manager: &Arc<TransactionManager>,
    ) -> Arc<Self> {
        collection.bind_wal(Arc::clone(manager));
        let shared = Self::new(collection);
        let as_participant: Arc<dyn TransactionParticipant> = shared.clone();
        manager.register_participant(&as_participant);
        shared
    }

    /// Lock the collection for direct use.
    pub fn lock(&self) -> MutexGuard<'_, Collection> {
        self.inner.lock()
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl TransactionParticipant for SharedCollection {
    fn participant_name(&self) -> String {
        self.name.clone()
    }

    fn begin_transaction(&self, tx_id: &str) -> FolioResult<()> {
        self.inner.lock().begin_participant(tx_id)
    }

    fn prepare_commit(&self, tx_id: &str) -> FolioResult<bool> {
        self.inner.lock().prepare_participant(tx_id)
    }

    fn finalize_commit(&self, tx_id: &str) -> FolioResult<()> {
        self.inner.lock().finalize_participant(tx_id)
    }

    fn rollback(&self, tx_id: &str) -> FolioResult<()> {
        self.inner.lock().rollback_participant(tx_id)
    }

    fn apply_replay(&self, op: &WriteOperation) -> FolioResult<()> {
        self.inner.lock().replay_participant(op)
    }

    fn persist_snapshot(&self) -> FolioResult<()> {
        self.inner.lock().persist()
    }
}
