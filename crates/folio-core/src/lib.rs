//! Core types and traits for FolioDB
//!
//! This crate defines the foundational pieces used throughout the system:
//! - SlotId / IndexKey: internal slot counter and ordered index scalar
//! - StoredRecord: the audit envelope wrapped around every stored document
//! - ChangeRecord: externalized description of a committed mutation
//! - FolioError: the unified error type
//! - Capability traits: authorization, audit logging, timers, schema
//!   validation, change sinks
//! - RecordList: the primary list contract plus the in-memory variant
//! - SecondaryIndex: ordered value -> primary-key index with portable form
//! - GeneratorRegistry: named ID generators and value transforms
//! - PerformanceMonitor: in-process counters and sliding-window stats

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capabilities;
pub mod change;
pub mod error;
pub mod idgen;
pub mod index;
pub mod list;
pub mod monitor;
pub mod record;
pub mod ttl;
pub mod types;

pub use capabilities::{
    AllowAll, AuditEvent, AuditLogger, AuthAction, Authorization, IntervalTimer, ManualTimer,
    NullAuditLogger, PermissionDecision, ResourceDescriptor, SchemaValidator, ThreadTimer,
    TimerGuard, TracingAuditLogger,
};
pub use change::{diff_fields, ChangeOperation, ChangeRecord, ChangeSink, NullSink, ResourceType};
pub use error::{FolioError, FolioResult};
pub use idgen::{GeneratorRegistry, IdGenerator, ListStats, ValueTransform, AUTO_INC, AUTO_TIMESTAMP};
pub use index::{
    resolve_index_value, IndexDefinition, Payloads, PortableIndex, ResolvedValue, SecondaryIndex,
    WILDCARD_KEY,
};
pub use list::{ListPersistForm, MemoryList, RecordList};
pub use monitor::{MonitorSnapshot, PerformanceMonitor};
pub use record::{checksum_of, StoredRecord};
pub use ttl::{is_expired, now_millis, parse_duration, TtlSpec};
pub use types::{
    deep_merge, get_path, set_path, shallow_assign, Document, F64Key, IndexKey, SlotId,
};
