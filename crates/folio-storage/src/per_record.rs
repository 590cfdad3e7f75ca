//! Per-record file backend
//!
//! Every record lives in its own JSON file under `<root>/<collection>/`,
//! named by its immutable slot number. A manifest carries the counter, the
//! index definitions, the portable trees, and the primary-key → filename
//! mapping. Audit-mode tombstones are ordinary record files whose envelope
//! has `deleted_at` set; they stay on disk until purged. Non-audit deletes
//! unlink the file.
//!
//! `FileList` is the record-list variant over the same layout: a
//! slot-ordered tree from slot ID to filename, reading record files on
//! demand.

use crate::adapter::{AdapterKind, StorageAdapter};
use crate::file::atomic_write;
use crate::state::StoredState;
use folio_core::{
    FolioError, FolioResult, IndexDefinition, IndexKey, ListPersistForm, PortableIndex,
    RecordList, SlotId, StoredRecord,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const MANIFEST_FILE: &str = "_manifest.json";
const LIST_META_FILE: &str = "_list.json";

fn record_filename(slot: SlotId) -> String {
    format!("record-{}.json", slot.0)
}

fn read_record(path: &Path) -> FolioResult<StoredRecord> {
    let bytes =
        fs::read(path).map_err(|e| FolioError::adapter_io(format!("read {:?}: {}", path, e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| FolioError::adapter_io(format!("parse record {:?}: {}", path, e)))
}

// ============================================================================
// Whole-state adapter
// ============================================================================

/// Manifest written next to the record files.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    counter: u64,
    #[serde(rename = "id")]
    id_field: String,
    #[serde(rename = "ttl", default, skip_serializing_if = "Option::is_none")]
    ttl_ms: Option<u64>,
    #[serde(rename = "indexDefs")]
    index_defs: BTreeMap<String, IndexDefinition>,
    indexes: BTreeMap<String, PortableIndex>,
    /// Primary key -> record filename, in key order
    files: Vec<(IndexKey, String)>,
}

/// One-file-per-record backend.
#[derive(Debug, Clone)]
pub struct PerRecordAdapter {
    root: PathBuf,
    default_name: String,
}

impl PerRecordAdapter {
    /// Adapter rooted at `<root>/<collection>/`.
    pub fn new(root: impl Into<PathBuf>, default_name: impl Into<String>) -> Self {
        PerRecordAdapter {
            root: root.into(),
            default_name: default_name.into(),
        }
    }

    fn dir_for(&self, name: Option<&str>) -> PathBuf {
        self.root.join(name.unwrap_or(&self.default_name))
    }
}

impl StorageAdapter for PerRecordAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::PerRecord
    }

    fn restore(&mut self, name: Option<&str>) -> FolioResult<Option<StoredState>> {
        let dir = self.dir_for(name);
        let manifest_path = dir.join(MANIFEST_FILE);
        let bytes = match fs::read(&manifest_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(FolioError::adapter_io(format!(
                    "read {:?}: {}",
                    manifest_path, e
                )))
            }
        };
        let manifest: Manifest = serde_json::from_slice(&bytes).map_err(|e| {
            FolioError::adapter_io(format!("parse manifest {:?}: {}", manifest_path, e))
        })?;

        let mut records = Vec::with_capacity(manifest.files.len());
        for (_, filename) in &manifest.files {
            records.push(read_record(&dir.join(filename))?);
        }
        records.sort_by_key(|r| r.slot);

        Ok(Some(StoredState {
            list: ListPersistForm {
                counter: manifest.counter,
                records,
            },
            indexes: manifest.indexes,
            index_defs: manifest.index_defs,
            id_field: manifest.id_field,
            ttl_ms: manifest.ttl_ms,
        }))
    }

    fn store(&mut self, state: &StoredState, name: Option<&str>) -> FolioResult<()> {
        let dir = self.dir_for(name);
        fs::create_dir_all(&dir)
            .map_err(|e| FolioError::adapter_io(format!("create {:?}: {}", dir, e)))?;

        let mut files = Vec::with_capacity(state.list.records.len());
        let mut keep: Vec<String> = Vec::with_capacity(state.list.records.len());
        for record in &state.list.records {
            let filename = record_filename(record.slot);
            let primary = IndexKey::from_value(folio_core::get_path(
                &record.data,
                &state.id_field,
            ));
            atomic_write(&dir.join(&filename), &serde_json::to_vec(record)?)?;
            files.push((primary, filename.clone()));
            keep.push(filename);
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let manifest = Manifest {
            counter: state.list.counter,
            id_field: state.id_field.clone(),
            ttl_ms: state.ttl_ms,
            index_defs: state.index_defs.clone(),
            indexes: state.indexes.clone(),
            files,
        };
        atomic_write(&dir.join(MANIFEST_FILE), &serde_json::to_vec(&manifest)?)?;

        // Unlink record files no longer referenced. Tombstones in audit mode
        // are still part of the state, so they are naturally kept.
        let entries = fs::read_dir(&dir)
            .map_err(|e| FolioError::adapter_io(format!("scan {:?}: {}", dir, e)))?;
        for entry in entries.filter_map(|e| e.ok()) {
            let filename = entry.file_name().to_string_lossy().into_owned();
            if filename.starts_with("record-") && !keep.contains(&filename) {
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!(file = %filename, error = %e, "failed to unlink stale record file");
                }
            }
        }
        Ok(())
    }

    fn clone_adapter(&self) -> Box<dyn StorageAdapter> {
        Box::new(self.clone())
    }
}

// ============================================================================
// File-backed record list
// ============================================================================

/// Metadata file for the file-backed list.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ListMeta {
    counter: u64,
    files: Vec<(SlotId, String)>,
}

/// Record list storing one file per record, indexed by an in-memory
/// slot → filename tree.
#[derive(Debug)]
pub struct FileList {
    dir: PathBuf,
    files: BTreeMap<SlotId, String>,
    counter: u64,
}

impl FileList {
    /// Open (or create) a file list rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> FolioResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| FolioError::adapter_io(format!("create {:?}: {}", dir, e)))?;

        let meta_path = dir.join(LIST_META_FILE);
        let meta: ListMeta = match fs::read(&meta_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| FolioError::adapter_io(format!("parse {:?}: {}", meta_path, e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ListMeta::default(),
            Err(e) => {
                return Err(FolioError::adapter_io(format!(
                    "read {:?}: {}",
                    meta_path, e
                )))
            }
        };

        Ok(FileList {
            dir,
            files: meta.files.into_iter().collect(),
            counter: meta.counter,
        })
    }

    fn sync_meta(&self) -> FolioResult<()> {
        let meta = ListMeta {
            counter: self.counter,
            files: self.files.iter().map(|(s, f)| (*s, f.clone())).collect(),
        };
        atomic_write(&self.dir.join(LIST_META_FILE), &serde_json::to_vec(&meta)?)
    }
}

impl RecordList for FileList {
    fn get(&self, slot: SlotId) -> Option<StoredRecord> {
        let filename = self.files.get(&slot)?;
        match read_record(&self.dir.join(filename)) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(slot = %slot, error = %e, "unreadable record file");
                None
            }
        }
    }

    fn set(&mut self, slot: SlotId, record: StoredRecord) -> FolioResult<()> {
        let filename = record_filename(slot);
        atomic_write(&self.dir.join(&filename), &serde_json::to_vec(&record)?)?;
        self.files.insert(slot, filename);
        self.sync_meta()
    }

    fn update(&mut self, slot: SlotId, record: StoredRecord) -> FolioResult<()> {
        if !self.files.contains_key(&slot) {
            return Err(FolioError::not_found(format!("list slot {}", slot)));
        }
        let filename = record_filename(slot);
        atomic_write(&self.dir.join(&filename), &serde_json::to_vec(&record)?)
    }

    fn delete(&mut self, slot: SlotId) -> FolioResult<StoredRecord> {
        let filename = self
            .files
            .remove(&slot)
            .ok_or_else(|| FolioError::not_found(format!("list slot {}", slot)))?;
        let path = self.dir.join(&filename);
        let record = read_record(&path)?;
        fs::remove_file(&path)
            .map_err(|e| FolioError::adapter_io(format!("unlink {:?}: {}", path, e)))?;
        self.sync_meta()?;
        Ok(record)
    }

    fn reset(&mut self) -> FolioResult<()> {
        for filename in self.files.values() {
            let path = self.dir.join(filename);
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = ?path, error = %e, "failed to unlink record file on reset");
            }
        }
        self.files.clear();
        self.sync_meta()
    }

    fn len(&self) -> usize {
        self.files.len()
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
        Box::new(
            self.files
                .values()
                .filter_map(move |filename| read_record(&self.dir.join(filename)).ok()),
        )
    }

    fn iter_backward(&self) -> Box<dyn Iterator<Item = StoredRecord> + '_> {
        Box::new(
            self.files
                .values()
                .rev()
                .filter_map(move |filename| read_record(&self.dir.join(filename)).ok()),
        )
    }

    fn to_persist(&self) -> ListPersistForm {
        ListPersistForm {
            counter: self.counter,
            records: self.iter_forward().collect(),
        }
    }

    fn load_persist(&mut self, form: ListPersistForm) -> FolioResult<()> {
        self.reset()?;
        self.counter = self.counter.max(form.counter);
        for record in form.records {
            let slot = record.slot;
            let filename = record_filename(slot);
            atomic_write(&self.dir.join(&filename), &serde_json::to_vec(&record)?)?;
            self.files.insert(slot, filename);
        }
        self.sync_meta()
    }
}
