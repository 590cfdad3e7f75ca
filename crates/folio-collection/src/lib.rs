//! The FolioDB collection engine
//!
//! A collection fronts a primary list and a set of secondary indexes with
//! CRUD operations, index maintenance driven off insert/update/remove, a
//! bounded TTL sweeper, timer-driven log rotation, and participation in
//! WAL-backed transactions with snapshot-isolation reads.
//!
//! Construction order is fixed: primary-key index (auto-increment when
//! configured), ttl index when TTL or rotation is enabled, user indexes,
//! `ensure` hooks, then restore from the adapter.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod maintainer;
pub mod rotation;
pub mod shared;

pub use config::{AdapterChoice, CollectionConfig, IdFieldSpec, ListChoice, RotationSpec};
pub use engine::{Collection, CollectionAdapter, Condition};
pub use maintainer::{BTreeIndexMaintainer, IndexMaintainer};
pub use rotation::schedule_rotation;
pub use shared::SharedCollection;
