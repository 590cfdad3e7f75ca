//! The storage adapter contract and the in-memory backend
//!
//! Adapter kinds are a closed set matched exhaustively; there is no
//! duck-typed capability probing. The transactional wrapper is a separate
//! type (`transactional::TransactionalAdapter`), chosen by configuration.

use crate::state::StoredState;
use folio_core::FolioResult;
use rustc_hash::FxHashMap;

/// Closed set of persistence backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    /// Nothing persists across restarts
    Memory,
    /// One JSON document per collection
    File,
    /// One JSON file per record plus a manifest
    PerRecord,
}

/// Persistence contract for a collection's full state.
///
/// The collection owns its adapter and hands the snapshot in on `store`;
/// adapters hold no reference back to the collection. `name` selects a
/// snapshot; `None` means the adapter's default (the collection name it
/// was constructed with). Rotation stores copies under suffixed names.
pub trait StorageAdapter: Send {
    /// Which backend this is.
    fn kind(&self) -> AdapterKind;

    /// Load a previously stored snapshot, or `None` when nothing exists.
    fn restore(&mut self, name: Option<&str>) -> FolioResult<Option<StoredState>>;

    /// Persist a snapshot.
    ///
    /// Must be atomic from the reader's point of view: a crashed store
    /// leaves either the old snapshot or the new one, never a torn file.
    fn store(&mut self, state: &StoredState, name: Option<&str>) -> FolioResult<()>;

    /// Object-safe clone, for rotation copies and collection duplication.
    fn clone_adapter(&self) -> Box<dyn StorageAdapter>;
}

/// In-memory backend: state survives only as long as the adapter.
#[derive(Debug, Default, Clone)]
pub struct MemoryAdapter {
    default_name: String,
    snapshots: FxHashMap<String, StoredState>,
}

impl MemoryAdapter {
    /// Adapter whose unnamed snapshot slot is `default_name`.
    pub fn new(default_name: impl Into<String>) -> Self {
        MemoryAdapter {
            default_name: default_name.into(),
            snapshots: FxHashMap::default(),
        }
    }

    fn slot<'a>(&'a self, name: Option<&'a str>) -> &'a str {
        name.unwrap_or(&self.default_name)
    }
}

impl StorageAdapter for MemoryAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Memory
    }

    fn restore(&mut self, name: Option<&str>) -> FolioResult<Option<StoredState>> {
        Ok(self.snapshots.get(self.slot(name)).cloned())
    }

    fn store(&mut self, state: &StoredState, name: Option<&str>) -> FolioResult<()> {
        let slot = self.slot(name).to_string();
        self.snapshots.insert(slot, state.clone());
        Ok(())
    }

    fn clone_adapter(&self) -> Box<dyn StorageAdapter> {
        Box::new(self.clone())
    }
}
