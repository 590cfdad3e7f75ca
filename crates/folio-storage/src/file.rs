//! Single-file JSON adapter
//!
//! The whole collection snapshot is written as one JSON document at
//! `<root>/<name>.json`. Atomicity comes from writing to a temp file in
//! the same directory and renaming over the target; concurrent writers on
//! the same path are undefined behavior and the caller's responsibility.

use crate::adapter::{AdapterKind, StorageAdapter};
use crate::state::StoredState;
use folio_core::{FolioError, FolioResult};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Whole-collection JSON file backend.
#[derive(Debug, Clone)]
pub struct FileAdapter {
    root: PathBuf,
    default_name: String,
}

impl FileAdapter {
    /// Adapter rooted at `root`, defaulting to `<root>/<default_name>.json`.
    pub fn new(root: impl Into<PathBuf>, default_name: impl Into<String>) -> Self {
        FileAdapter {
            root: root.into(),
            default_name: default_name.into(),
        }
    }

    fn path_for(&self, name: Option<&str>) -> PathBuf {
        let name = name.unwrap_or(&self.default_name);
        self.root.join(format!("{}.json", name))
    }
}

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// flushed and synced, then renamed over the target.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> FolioResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| FolioError::adapter_io(format!("no parent directory for {:?}", path)))?;
    fs::create_dir_all(dir)
        .map_err(|e| FolioError::adapter_io(format!("create {:?}: {}", dir, e)))?;

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)
            .map_err(|e| FolioError::adapter_io(format!("create {:?}: {}", tmp, e)))?;
        file.write_all(bytes)
            .map_err(|e| FolioError::adapter_io(format!("write {:?}: {}", tmp, e)))?;
        file.sync_all()
            .map_err(|e| FolioError::adapter_io(format!("sync {:?}: {}", tmp, e)))?;
    }
    fs::rename(&tmp, path)
        .map_err(|e| FolioError::adapter_io(format!("rename {:?} -> {:?}: {}", tmp, path, e)))
}

impl StorageAdapter for FileAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::File
    }

    fn restore(&mut self, name: Option<&str>) -> FolioResult<Option<StoredState>> {
        let path = self.path_for(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(FolioError::adapter_io(format!("read {:?}: {}", path, e)));
            }
        };
        let state: StoredState = serde_json::from_slice(&bytes).map_err(|e| {
            FolioError::adapter_io(format!("parse snapshot {:?}: {}", path, e))
        })?;
        Ok(Some(state))
    }

    fn store(&mut self, state: &StoredState, name: Option<&str>) -> FolioResult<()> {
        let path = self.path_for(name);
        let bytes = serde_json::to_vec(state)?;
        atomic_write(&path, &bytes)
    }

    fn clone_adapter(&self) -> Box<dyn StorageAdapter> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{StoredRecord, SlotId};
    use serde_json::json;

    #[test]
    fn store_then_restore() {
        let dir = tempfile::tempdir().unwrap();
        let mut adapter = FileAdapter::new(dir.path(), "users");

        assert!(adapter.restore(None).unwrap().is_none());

        let mut state = StoredState::empty("id");
        state.list.counter = 2;
        state
            .list
            .records
            .push(StoredRecord::new(SlotId(0), json!({"id": 1}), false));
        adapter.store(&state, None).unwrap();

        let restored = adapter.restore(None).unwrap().unwrap();
        assert_eq!(restored, state);
        assert!(dir.path().join("users.json").exists());
    }

    #[test]
    fn named_snapshots_live_side_by_side() {
        let dir = tempfile::tempdir().unwrap();
        let mut adapter = FileAdapter::new(dir.path(), "users");
        let state = StoredState::empty("id");
        adapter.store(&state, None).unwrap();
        adapter.store(&state, Some("users-1700000000")).unwrap();
        assert!(dir.path().join("users.json").exists());
        assert!(dir.path().join("users-1700000000.json").exists());
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut adapter = FileAdapter::new(dir.path(), "users");
        adapter.store(&StoredState::empty("id"), None).unwrap();
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map_or(false, |x| x == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn corrupt_snapshot_surfaces_adapter_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("users.json"), b"{ not json").unwrap();
        let mut adapter = FileAdapter::new(dir.path(), "users");
        let err = adapter.restore(None).unwrap_err();
        assert!(matches!(err, FolioError::AdapterIo { .. }));
    }
}
