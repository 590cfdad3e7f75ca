//! Storage adapters for FolioDB collections
//!
//! An adapter persists and restores a collection's full state: the primary
//! list, the materialized secondary indexes in portable form, the index
//! definitions, the primary-key field name, and the TTL. Three backends:
//!
//! - `MemoryAdapter`: keeps nothing across process restarts
//! - `FileAdapter`: one JSON document per collection, atomic via
//!   write-to-temp-then-rename
//! - `PerRecordAdapter`: one JSON file per record plus a manifest
//!
//! `TransactionalAdapter` wraps any of them with per-transaction staging
//! for the write-ahead-log commit protocol. The collection owns its
//! adapter and passes snapshots in; adapters never hold a reference back
//! to the collection.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod file;
pub mod per_record;
pub mod state;
pub mod transactional;

pub use adapter::{AdapterKind, MemoryAdapter, StorageAdapter};
pub use file::FileAdapter;
pub use per_record::{FileList, PerRecordAdapter};
pub use state::StoredState;
pub use transactional::{TransactionalAdapter, TxStage, WriteKind, WriteOperation};
