//! # FolioDB
//!
//! An embedded document collection store: per-collection secondary
//! indexes, optional TTL, pluggable persistence, WAL-backed transactions,
//! and a change-notification core, all in-process, no separate server.
//!
//! # Quick Start
//!
//! ```no_run
//! use foliodb::{Folio, FolioOptions, CollectionConfig, IndexDefinition, IndexKey};
//! use serde_json::json;
//!
//! fn main() -> foliodb::FolioResult<()> {
//!     let folio = Folio::open(FolioOptions::new("./data"))?;
//!
//!     let users = folio.create_collection(
//!         CollectionConfig::new("users")
//!             .with_index(IndexDefinition::new("email").unique().ignore_case()),
//!     )?;
//!
//!     users.lock().push(json!({"email": "ada@example.com", "name": "Ada"}))?;
//!     let hits = users.lock().find_by("email", &json!("ADA@example.com"));
//!     assert_eq!(hits.len(), 1);
//!
//!     // transactional writes go through the WAL
//!     let tx = folio.begin()?;
//!     users.lock().push_tx(&tx, json!({"email": "bo@example.com"}))?;
//!     folio.commit(&tx)?;
//!
//!     // find one record by primary key
//!     assert!(users.lock().find_by_id(IndexKey::Int(0)).is_some());
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! | Crate | Responsibility |
//! |-------|----------------|
//! | `folio-core` | shared types, errors, indexes, capabilities |
//! | `folio-storage` | memory / file / per-record adapters, staging |
//! | `folio-wal` | WAL codec and log, transactions, recovery |
//! | `folio-collection` | the collection engine |
//! | `folio-subscriptions` | query parsing, filtering, dispatch |
//!
//! The [`Folio`] struct wires them together for embedding hosts; every
//! piece is also usable on its own through the re-exports below.

mod db;

pub use db::{Folio, FolioOptions};

pub use folio_core::{
    AllowAll, AuditEvent, AuditLogger, AuthAction, Authorization, ChangeOperation, ChangeRecord,
    ChangeSink, Document, FolioError, FolioResult, GeneratorRegistry, IndexDefinition, IndexKey,
    IntervalTimer, ManualTimer, MonitorSnapshot, NullAuditLogger, NullSink, PerformanceMonitor,
    PermissionDecision, ResourceDescriptor, ResourceType, SchemaValidator, SlotId, StoredRecord,
    ThreadTimer, TimerGuard, TracingAuditLogger, TtlSpec, WILDCARD_KEY,
};
pub use folio_collection::{
    schedule_rotation, AdapterChoice, Collection, CollectionConfig, Condition, IdFieldSpec,
    ListChoice, RotationSpec, SharedCollection,
};
pub use folio_storage::{
    AdapterKind, FileAdapter, MemoryAdapter, PerRecordAdapter, StorageAdapter, StoredState,
    TransactionalAdapter, WriteKind, WriteOperation,
};
pub use folio_subscriptions::{
    ConnectionRegistry, DispatcherStats, FieldOp, FilterSpec, MessageFormat, Notification,
    NotificationDispatcher, ParsedQuery, Priority, Protocol, QueryParser, Subscription,
    SubscriptionEngine, SubscriptionQuery, SubscriptionsConfig, Transport, UserOp,
};
pub use folio_wal::{
    CompressionAlgorithm, CompressionCodec, RecoverySummary, TransactionManager,
    TransactionOptions, TransactionParticipant, WalEntry, WalEntryKind, WalFile, WalOptions,
};
