//! The collection engine
//!
//! Orchestrates the primary list and the index maintainers, exposes CRUD,
//! maintains the constraint invariants, emits change records, sweeps TTL,
//! and participates in WAL transactions.
//!
//! Mutation discipline: every write validates all indexes before touching
//! any tree or the list, so a failed write leaves no partial state. Under
//! a transaction, writes stage through the transactional adapter after
//! their DATA entry reaches the WAL; unique constraints are re-validated
//! at prepare (last-writer-wins for plain overwrites), and the buffered
//! change records are released to the sink only after the durable commit.

use crate::config::{AdapterChoice, CollectionConfig, ListChoice};
use crate::maintainer::{BTreeIndexMaintainer, IndexMaintainer};
use folio_core::{
    deep_merge, get_path, now_millis, resolve_index_value, set_path, shallow_assign, ChangeRecord,
    ChangeSink, Document, FolioError, FolioResult, GeneratorRegistry, IndexDefinition, IndexKey,
    ListStats, MemoryList, NullSink, PerformanceMonitor, RecordList, SchemaValidator, SlotId,
    StoredRecord,
};
use folio_storage::{
    FileAdapter, FileList, MemoryAdapter, PerRecordAdapter, StorageAdapter, StoredState,
    TransactionalAdapter, WriteKind, WriteOperation,
};
use folio_wal::TransactionManager;
use rustc_hash::FxHashMap;
use serde_json::Map as JsonMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A find condition: a top-level equality map or an arbitrary predicate.
pub enum Condition {
    /// Every listed field must equal the given value. When one of the
    /// fields is indexed the engine starts from that index instead of
    /// scanning the list.
    Fields(JsonMap<String, serde_json::Value>),
    /// Arbitrary predicate; always a full scan.
    Predicate(Box<dyn Fn(&Document) -> bool + Send>),
}

impl Condition {
    /// Equality on a single field.
    pub fn field(name: impl Into<String>, value: serde_json::Value) -> Self {
        let mut map = JsonMap::new();
        map.insert(name.into(), value);
        Condition::Fields(map)
    }
}

/// The adapter a collection holds: plain, or wrapped for transactions.
/// Configuration decides; there is no runtime capability probing.
pub enum CollectionAdapter {
    /// Direct restore/store only
    Plain(Box<dyn StorageAdapter>),
    /// Staging wrapper for WAL commit
    Transactional(TransactionalAdapter),
}

impl CollectionAdapter {
    fn storage(&mut self) -> &mut dyn StorageAdapter {
        match self {
            CollectionAdapter::Plain(adapter) => adapter.as_mut(),
            CollectionAdapter::Transactional(adapter) => adapter.inner(),
        }
    }

    fn transactional(&mut self) -> FolioResult<&mut TransactionalAdapter> {
        match self {
            CollectionAdapter::Transactional(adapter) => Ok(adapter),
            CollectionAdapter::Plain(_) => Err(FolioError::config(
                "collection adapter is not transactional",
            )),
        }
    }
}

/// Per-transaction engine state: the begin snapshot and buffered changes.
struct TxLocal {
    /// Committed live records at `begin`, keyed by primary key
    snapshot: Arc<BTreeMap<IndexKey, StoredRecord>>,
    /// Change records held back until the durable commit
    changes: Vec<ChangeRecord>,
}

struct PreparedInsert {
    values: Vec<Option<IndexKey>>,
    primary: IndexKey,
}

/// A typed document collection with secondary indexes.
pub struct Collection {
    name: String,
    database: String,
    id_field: String,
    audit: bool,
    expire_tombstones: bool,
    auto_persist: bool,
    ttl: Option<Duration>,
    ttl_field: String,
    validator: Option<Arc<dyn SchemaValidator>>,
    registry: Arc<GeneratorRegistry>,
    list: Box<dyn RecordList>,
    adapter: CollectionAdapter,
    maintainers: Vec<Box<dyn IndexMaintainer>>,
    field_to_maintainer: FxHashMap<String, usize>,
    wildcard: Option<IndexDefinition>,
    sink: Arc<dyn ChangeSink>,
    monitor: Arc<PerformanceMonitor>,
    wal: Option<Arc<TransactionManager>>,
    tx_states: FxHashMap<String, TxLocal>,
    sweeping: bool,
}

impl Collection {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Build a collection: install the primary index, the ttl index when
    /// TTL or rotation is configured, the user indexes, run `ensure`, then
    /// restore from the adapter.
    pub fn open(config: CollectionConfig) -> FolioResult<Self> {
        config.validate()?;

        let id_field = config.id.field_name().to_string();
        let (id_auto, id_generator) = config.id.resolve_auto(config.auto);
        let ttl = match &config.ttl {
            Some(spec) => spec.resolve()?,
            None => None,
        };

        let list: Box<dyn RecordList> = match config.list {
            ListChoice::Memory => Box::new(MemoryList::new()),
            ListChoice::File => {
                let root = config.root.as_ref().expect("validated");
                Box::new(FileList::open(root.join(&config.name).join("records"))?)
            }
        };

        let inner: Box<dyn StorageAdapter> = match config.adapter {
            AdapterChoice::Memory => Box::new(MemoryAdapter::new(&config.name)),
            AdapterChoice::File => {
                let root = config.root.as_ref().expect("validated");
                Box::new(FileAdapter::new(root, &config.name))
            }
            AdapterChoice::PerRecord => {
                let root = config.root.as_ref().expect("validated");
                Box::new(PerRecordAdapter::new(root, &config.name))
            }
        };
        let adapter = if config.transactional {
            CollectionAdapter::Transactional(TransactionalAdapter::new(inner))
        } else {
            CollectionAdapter::Plain(inner)
        };

        let mut collection = Collection {
            name: config.name.clone(),
            database: config.database.clone(),
            id_field: id_field.clone(),
            audit: config.audit,
            expire_tombstones: config.expire_tombstones,
            auto_persist: config.auto_persist,
            ttl,
            ttl_field: config.ttl_field.clone(),
            validator: None,
            registry: Arc::new(GeneratorRegistry::with_builtins()),
            list,
            adapter,
            maintainers: Vec::new(),
            field_to_maintainer: FxHashMap::default(),
            wildcard: None,
            sink: Arc::new(NullSink),
            monitor: Arc::new(PerformanceMonitor::default()),
            wal: None,
            tx_states: FxHashMap::default(),
            sweeping: false,
        };

        // 1. primary index
        let mut primary = IndexDefinition::new(&id_field).unique().required();
        if id_auto {
            primary = primary.auto_with(id_generator);
        }
        collection.install_maintainer(primary);

        // 2. ttl index, when TTL or rotation needs timestamps
        if collection.ttl.is_some() || config.rotate.is_some() {
            let ttl_def = IndexDefinition::new(&config.ttl_field)
                .sparse()
                .auto_with(folio_core::AUTO_TIMESTAMP);
            collection.install_maintainer(ttl_def);
        }

        // 3. user indexes; the wildcard template is captured, not built
        for def in &config.index_list {
            if def.is_wildcard() {
                collection.wildcard = Some(def.clone());
                continue;
            }
            if collection.field_to_maintainer.contains_key(&def.key) {
                continue;
            }
            collection.install_maintainer(def.clone());
        }

        // 4. ensure hooks
        for maintainer in &mut collection.maintainers {
            maintainer.ensure();
        }

        // 5. restore persisted state
        collection.restore()?;
        Ok(collection)
    }

    /// Replace the change sink (defaults to a discarding sink).
    pub fn set_sink(&mut self, sink: Arc<dyn ChangeSink>) {
        self.sink = sink;
    }

    /// Install a schema validator.
    pub fn set_validator(&mut self, validator: Arc<dyn SchemaValidator>) {
        self.validator = Some(validator);
    }

    /// Replace the generator registry.
    pub fn set_registry(&mut self, registry: Arc<GeneratorRegistry>) {
        self.registry = registry;
    }

    /// Bind the transaction manager used by the `_tx` write paths.
    pub fn bind_wal(&mut self, manager: Arc<TransactionManager>) {
        self.wal = Some(manager);
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Primary-key field name.
    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    /// The performance monitor for this collection.
    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    fn install_maintainer(&mut self, def: IndexDefinition) {
        let field = def.key.clone();
        self.maintainers.push(Box::new(BTreeIndexMaintainer::new(def)));
        self.field_to_maintainer
            .insert(field, self.maintainers.len() - 1);
    }

    // ========================================================================
    // Value resolution helpers
    // ========================================================================

    /// Process a raw key through an index's `ignoreCase`/`process` chain.
    fn process_for(&self, idx: usize, raw: IndexKey) -> IndexKey {
        self.maintainers[idx]
            .definition()
            .process_value(raw, &self.registry)
    }

    /// Indexed key for a document under one definition: `None` = sparse
    /// null (not indexed), error = required null.
    fn key_for(&self, def: &IndexDefinition, doc: &Document) -> FolioResult<Option<IndexKey>> {
        let raw = IndexKey::from_value(get_path(doc, &def.key));
        if raw.is_null() {
            if def.required {
                return Err(FolioError::required_violation(&def.key));
            }
            if def.sparse {
                return Ok(None);
            }
        }
        Ok(Some(def.process_value(raw, &self.registry)))
    }

    fn primary_key_of(&self, doc: &Document) -> FolioResult<IndexKey> {
        let raw = IndexKey::from_value(get_path(doc, &self.id_field));
        if raw.is_null() {
            return Err(FolioError::validation(format!(
                "document has no '{}' primary key",
                self.id_field
            )));
        }
        Ok(self.process_for(0, raw))
    }

    fn slot_for_pk(&self, pk: &IndexKey) -> Option<SlotId> {
        match self.maintainers[0].lookup(pk).first() {
            Some(IndexKey::Int(slot)) => Some(SlotId(*slot as u64)),
            _ => None,
        }
    }

    fn live_record(&self, pk: &IndexKey) -> Option<StoredRecord> {
        let slot = self.slot_for_pk(pk)?;
        self.list.get(slot).filter(|r| r.is_live())
    }

    // ========================================================================
    // Wildcard meta-index
    // ========================================================================

    fn install_wildcard_indexes(&mut self, doc: &Document) -> FolioResult<()> {
        let Some(template) = self.wildcard.clone() else {
            return Ok(());
        };
        let Some(map) = doc.as_object() else {
            return Ok(());
        };
        let new_fields: Vec<String> = map
            .keys()
            .filter(|field| !self.field_to_maintainer.contains_key(*field))
            .cloned()
            .collect();
        for field in new_fields {
            debug!(collection = %self.name, field = %field, "installing wildcard index");
            let def = template.for_field(&field);
            self.install_maintainer(def);
            let idx = self.maintainers.len() - 1;
            self.maintainers[idx].ensure();
            self.rebuild_index(idx)?;
        }
        Ok(())
    }

    /// Rebuild one index by scanning the list.
    fn rebuild_index(&mut self, idx: usize) -> FolioResult<()> {
        let def = self.maintainers[idx].definition().clone();
        let mut entries: Vec<(IndexKey, IndexKey)> = Vec::new();
        for record in self.list.iter_forward() {
            if !record.is_live() {
                continue;
            }
            let Some(key) = self.key_for(&def, &record.data)? else {
                continue;
            };
            let payload = if idx == 0 {
                IndexKey::Int(record.slot.0 as i64)
            } else {
                self.primary_key_of(&record.data)?
            };
            entries.push((key, payload));
        }
        self.maintainers[idx].rebuild(&mut entries.into_iter());
        Ok(())
    }

    /// Rebuild every index by scanning the list.
    pub fn rebuild_indexes(&mut self) -> FolioResult<()> {
        for idx in 0..self.maintainers.len() {
            self.rebuild_index(idx)?;
        }
        Ok(())
    }

    // ========================================================================
    // Applied primitives (no sweep, no publish, no persist)
    // ========================================================================

    fn prepare_insert(&mut self, doc: &mut Document) -> FolioResult<PreparedInsert> {
        if !doc.is_object() {
            return Err(FolioError::validation("records must be JSON objects"));
        }
        let stats = self.list.stats();
        let mut values: Vec<Option<IndexKey>> = Vec::with_capacity(self.maintainers.len());
        for idx in 0..self.maintainers.len() {
            let def = self.maintainers[idx].definition().clone();
            let resolved = resolve_index_value(&def, doc, &stats, &self.registry)?;
            if resolved.generated {
                if let Some(key) = &resolved.key {
                    set_path(doc, &def.key, key.to_json()).map_err(FolioError::validation)?;
                }
            }
            values.push(resolved.key);
        }

        let primary = values[0]
            .clone()
            .ok_or_else(|| FolioError::required_violation(&self.id_field))?;

        // validate every index before mutating anything
        for idx in 0..self.maintainers.len() {
            if let Some(key) = &values[idx] {
                if idx == 0 {
                    if !self.maintainers[0].lookup(key).is_empty() {
                        return Err(FolioError::unique_violation(&self.id_field, key));
                    }
                } else {
                    self.maintainers[idx].check_insert(key, &primary)?;
                }
            }
        }

        if let Some(validator) = &self.validator {
            validator.validate(doc).map_err(FolioError::validation)?;
        }

        Ok(PreparedInsert { values, primary })
    }

    fn insert_applied(&mut self, mut doc: Document) -> FolioResult<StoredRecord> {
        self.install_wildcard_indexes(&doc)?;
        let prepared = self.prepare_insert(&mut doc)?;
        let slot = self.list.next_slot();
        let record = StoredRecord::new(slot, doc, self.audit);
        self.list.set(slot, record.clone())?;
        for idx in 0..self.maintainers.len() {
            if let Some(key) = prepared.values[idx].clone() {
                let payload = if idx == 0 {
                    IndexKey::Int(slot.0 as i64)
                } else {
                    prepared.primary.clone()
                };
                self.maintainers[idx].on_insert(key, payload);
            }
        }
        Ok(record)
    }

    fn replace_applied(
        &mut self,
        pk: &IndexKey,
        new_doc: Document,
    ) -> FolioResult<(StoredRecord, StoredRecord)> {
        let slot = self
            .slot_for_pk(pk)
            .ok_or_else(|| FolioError::not_found(format!("record {}", pk)))?;
        let old = self
            .list
            .get(slot)
            .filter(|r| r.is_live())
            .ok_or_else(|| FolioError::not_found(format!("record {}", pk)))?;

        if let Some(validator) = &self.validator {
            validator.validate(&new_doc).map_err(FolioError::validation)?;
        }
        let new_pk = self.primary_key_of(&new_doc)?;
        let pk_changed = new_pk != *pk;

        // diff indexed values; a primary-key change moves every payload
        let mut updates: Vec<(usize, Option<IndexKey>, Option<IndexKey>)> = Vec::new();
        for idx in 0..self.maintainers.len() {
            let def = self.maintainers[idx].definition().clone();
            let old_key = self.key_for(&def, &old.data)?;
            let new_key = self.key_for(&def, &new_doc)?;
            if old_key != new_key || pk_changed {
                updates.push((idx, old_key, new_key));
            }
        }

        // check everything before mutating anything
        for (idx, old_key, new_key) in &updates {
            let Some(new_key) = new_key else { continue };
            if *idx == 0 {
                if pk_changed && !self.maintainers[0].lookup(new_key).is_empty() {
                    return Err(FolioError::unique_violation(&self.id_field, new_key));
                }
            } else if old_key.as_ref() != Some(new_key) {
                self.maintainers[*idx].check_insert(new_key, &new_pk)?;
            }
        }

        for (idx, old_key, new_key) in updates {
            let (old_payload, new_payload) = if idx == 0 {
                let slot_key = IndexKey::Int(slot.0 as i64);
                (slot_key.clone(), slot_key)
            } else {
                (pk.clone(), new_pk.clone())
            };
            self.maintainers[idx].on_update(
                old_key.as_ref(),
                new_key,
                &old_payload,
                &new_payload,
            )?;
        }

        let mut record = old.clone();
        record.replace_data(new_doc, self.audit);
        self.list.update(slot, record.clone())?;
        Ok((old, record))
    }

    fn remove_applied(&mut self, pk: &IndexKey) -> FolioResult<StoredRecord> {
        let slot = self
            .slot_for_pk(pk)
            .ok_or_else(|| FolioError::not_found(format!("record {}", pk)))?;
        let record = self
            .list
            .get(slot)
            .filter(|r| r.is_live())
            .ok_or_else(|| FolioError::not_found(format!("record {}", pk)))?;

        for idx in 0..self.maintainers.len() {
            let def = self.maintainers[idx].definition().clone();
            if let Ok(Some(key)) = self.key_for(&def, &record.data) {
                let payload = if idx == 0 {
                    IndexKey::Int(slot.0 as i64)
                } else {
                    pk.clone()
                };
                self.maintainers[idx].on_remove(&key, &payload);
            }
        }

        if self.audit {
            let mut tombstone = record.clone();
            tombstone.tombstone();
            self.list.update(slot, tombstone)?;
        } else {
            self.list.delete(slot)?;
        }
        Ok(record)
    }

    /// Upsert used by commit finalize and recovery replay: full post-image
    /// documents make this idempotent.
    fn apply_operation(&mut self, kind: &WriteKind) -> FolioResult<()> {
        match kind {
            WriteKind::Insert { document } | WriteKind::Update { document, .. } => {
                let pk = self.primary_key_of(document)?;
                if self.slot_for_pk(&pk).is_some() {
                    self.replace_applied(&pk, document.clone())?;
                } else {
                    self.insert_applied(document.clone())?;
                }
                Ok(())
            }
            WriteKind::Remove { primary_key, .. } => {
                let pk = self.process_for(0, primary_key.clone());
                match self.remove_applied(&pk) {
                    Ok(_) => Ok(()),
                    Err(e) if e.is_not_found() => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    // ========================================================================
    // Public CRUD
    // ========================================================================

    /// Insert a document.
    pub fn push(&mut self, doc: Document) -> FolioResult<StoredRecord> {
        self.maybe_sweep();
        let record = self.insert_applied(doc)?;
        let pk = self.primary_key_of(&record.data)?;
        let change = ChangeRecord::insert(
            &self.database,
            &self.name,
            Some(pk.to_string()),
            record.data.clone(),
        );
        self.sink.publish(change);
        self.monitor.incr("inserts");
        self.persist_if_auto()?;
        Ok(record)
    }

    /// Patch a record found by primary key. `merge` selects deep merge;
    /// otherwise top-level assignment.
    pub fn update_with_id(
        &mut self,
        id: IndexKey,
        patch: Document,
        merge: bool,
    ) -> FolioResult<StoredRecord> {
        self.maybe_sweep();
        let pk = self.process_for(0, id);
        let old = self
            .live_record(&pk)
            .ok_or_else(|| FolioError::not_found(format!("record {}", pk)))?;

        let mut new_doc = old.data.clone();
        if merge {
            deep_merge(&mut new_doc, &patch);
        } else {
            shallow_assign(&mut new_doc, &patch);
        }

        let (old, record) = self.replace_applied(&pk, new_doc)?;
        let new_pk = self.primary_key_of(&record.data)?;
        let change = ChangeRecord::update(
            &self.database,
            &self.name,
            Some(new_pk.to_string()),
            old.data,
            record.data.clone(),
        );
        self.sink.publish(change);
        self.monitor.incr("updates");
        self.persist_if_auto()?;
        Ok(record)
    }

    /// Remove a record by primary key. Idempotent: a second call reports
    /// `NotFound`. Audit mode tombstones in place.
    pub fn remove_with_id(&mut self, id: IndexKey) -> FolioResult<StoredRecord> {
        self.maybe_sweep();
        let pk = self.process_for(0, id);
        let record = self.remove_applied(&pk)?;
        let change = ChangeRecord::delete(
            &self.database,
            &self.name,
            Some(pk.to_string()),
            record.data.clone(),
        );
        self.sink.publish(change);
        self.monitor.incr("removes");
        self.persist_if_auto()?;
        Ok(record)
    }

    /// Drop tombstoned records for good.
    pub fn purge_tombstones(&mut self) -> FolioResult<usize> {
        let slots: Vec<SlotId> = self
            .list
            .iter_forward()
            .filter(|r| !r.is_live())
            .map(|r| r.slot)
            .collect();
        for slot in &slots {
            self.list.delete(*slot)?;
        }
        if !slots.is_empty() {
            self.persist_if_auto()?;
        }
        Ok(slots.len())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Find one record by primary key.
    pub fn find_by_id(&mut self, id: IndexKey) -> Option<Document> {
        self.maybe_sweep();
        let pk = self.process_for(0, id);
        self.live_record(&pk).map(|r| r.data)
    }

    /// Find records whose `field` equals `value`, via the index when one
    /// exists.
    pub fn find_by(&mut self, field: &str, value: &serde_json::Value) -> Vec<Document> {
        self.maybe_sweep();
        let raw = IndexKey::from_value(Some(value));
        match self.field_to_maintainer.get(field).copied() {
            Some(idx) => {
                let key = self.process_for(idx, raw);
                self.docs_for_index_hit(idx, &key)
            }
            None => self
                .scan_live()
                .into_iter()
                .filter(|doc| IndexKey::from_value(get_path(doc, field)) == raw)
                .collect(),
        }
    }

    /// Evaluate a condition, choosing index lookup over a scan when a
    /// top-level equality hits an indexed field.
    pub fn find(&mut self, condition: &Condition) -> Vec<Document> {
        self.maybe_sweep();
        match condition {
            Condition::Predicate(pred) => {
                self.scan_live().into_iter().filter(|d| pred(d)).collect()
            }
            Condition::Fields(fields) => {
                let indexed = fields
                    .iter()
                    .find(|(field, _)| self.field_to_maintainer.contains_key(*field));
                let candidates = match indexed {
                    Some((field, value)) => {
                        let idx = self.field_to_maintainer[field];
                        let key = self.process_for(idx, IndexKey::from_value(Some(value)));
                        self.docs_for_index_hit(idx, &key)
                    }
                    None => self.scan_live(),
                };
                candidates
                    .into_iter()
                    .filter(|doc| {
                        fields.iter().all(|(field, value)| {
                            IndexKey::from_value(get_path(doc, field))
                                == IndexKey::from_value(Some(value))
                        })
                    })
                    .collect()
            }
        }
    }

    fn docs_for_index_hit(&self, idx: usize, key: &IndexKey) -> Vec<Document> {
        let payloads = self.maintainers[idx].lookup(key);
        payloads
            .iter()
            .filter_map(|payload| {
                if idx == 0 {
                    match payload {
                        IndexKey::Int(slot) => self
                            .list
                            .get(SlotId(*slot as u64))
                            .filter(|r| r.is_live())
                            .map(|r| r.data),
                        _ => None,
                    }
                } else {
                    self.live_record(payload).map(|r| r.data)
                }
            })
            .collect()
    }

    fn scan_live(&self) -> Vec<Document> {
        self.list
            .iter_forward()
            .filter(|r| r.is_live())
            .map(|r| r.data)
            .collect()
    }

    /// Number of live records. Triggers a TTL sweep first, so expired
    /// records never count.
    pub fn len(&mut self) -> usize {
        self.maybe_sweep();
        self.list.iter_forward().filter(|r| r.is_live()).count()
    }

    /// True when no live records remain.
    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// The list's monotonic counter.
    pub fn counter(&self) -> u64 {
        self.list.counter()
    }

    /// All live documents in slot order.
    pub fn records(&mut self) -> Vec<Document> {
        self.maybe_sweep();
        self.scan_live()
    }

    // ========================================================================
    // TTL sweeping
    // ========================================================================

    /// One bounded sweep: expired records are removed (tombstoned in audit
    /// mode) and, when configured, stale tombstones are purged. Re-entry
    /// is suppressed so a sweep can never trigger itself.
    fn maybe_sweep(&mut self) {
        if self.sweeping {
            return;
        }
        let Some(ttl) = self.ttl else { return };
        self.sweeping = true;
        let result = self.sweep_expired(ttl);
        self.sweeping = false;
        if let Err(e) = result {
            warn!(collection = %self.name, error = %e, "TTL sweep failed");
        }
    }

    fn sweep_expired(&mut self, ttl: Duration) -> FolioResult<usize> {
        let Some(ttl_idx) = self.field_to_maintainer.get(&self.ttl_field).copied() else {
            return Ok(0);
        };
        let now = now_millis();
        let Some(cutoff) = now.checked_sub(ttl.as_millis() as u64 + 1) else {
            return Ok(0);
        };

        let expired: Vec<IndexKey> = self.maintainers[ttl_idx]
            .range_through(&IndexKey::Int(cutoff as i64))
            .into_iter()
            .flat_map(|(_, pks)| pks)
            .collect();

        let mut removed = 0;
        for pk in expired {
            match self.remove_applied(&pk) {
                Ok(_) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        if self.audit && self.expire_tombstones {
            let stale: Vec<SlotId> = self
                .list
                .iter_forward()
                .filter(|r| {
                    r.deleted_at
                        .map_or(false, |deleted| folio_core::is_expired(deleted, ttl, now))
                })
                .map(|r| r.slot)
                .collect();
            for slot in stale {
                self.list.delete(slot)?;
                removed += 1;
            }
        }

        if removed > 0 {
            self.monitor.add("ttl_expired", removed as u64);
            self.persist_if_auto()?;
        }
        Ok(removed)
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Build the whole-collection snapshot.
    pub fn stored_state(&self) -> StoredState {
        let mut indexes = BTreeMap::new();
        let mut index_defs = BTreeMap::new();
        for maintainer in &self.maintainers {
            let def = maintainer.definition();
            index_defs.insert(def.key.clone(), def.clone());
            indexes.insert(def.key.clone(), maintainer.to_portable());
        }
        if let Some(template) = &self.wildcard {
            index_defs.insert(template.key.clone(), template.clone());
        }
        StoredState {
            list: self.list.to_persist(),
            indexes,
            index_defs,
            id_field: self.id_field.clone(),
            ttl_ms: self.ttl.map(|t| t.as_millis() as u64),
        }
    }

    /// Persist the snapshot through the adapter. In-memory state is
    /// untouched on failure.
    pub fn persist(&mut self) -> FolioResult<()> {
        let state = self.stored_state();
        self.adapter.storage().store(&state, None)
    }

    fn persist_if_auto(&mut self) -> FolioResult<()> {
        if self.auto_persist {
            self.persist()
        } else {
            Ok(())
        }
    }

    fn restore(&mut self) -> FolioResult<()> {
        let Some(state) = self.adapter.storage().restore(None)? else {
            return Ok(());
        };
        self.list.load_persist(state.list)?;
        // wildcard-installed indexes from a previous run
        for (field, def) in &state.index_defs {
            if def.is_wildcard() {
                if self.wildcard.is_none() {
                    self.wildcard = Some(def.clone());
                }
                continue;
            }
            if !self.field_to_maintainer.contains_key(field) {
                self.install_maintainer(def.clone());
                self.maintainers.last_mut().expect("just pushed").ensure();
            }
        }
        // re-materialize trees from their portable form, rebuilding by
        // scan where a tree is missing
        for idx in 0..self.maintainers.len() {
            let field = self.maintainers[idx].definition().key.clone();
            match state.indexes.get(&field) {
                Some(portable) => self.maintainers[idx].load_portable(portable),
                None => self.rebuild_index(idx)?,
            }
        }
        debug!(collection = %self.name, records = self.list.len(), "restored");
        Ok(())
    }

    /// Snapshot for rotation: metadata and definitions are copied, trees
    /// are rebuilt by scanning records, never serialized live.
    pub fn rotated_snapshot(&self) -> FolioResult<StoredState> {
        let mut indexes = BTreeMap::new();
        let mut index_defs = BTreeMap::new();
        for (idx, maintainer) in self.maintainers.iter().enumerate() {
            let def = maintainer.definition().clone();
            let mut fresh = folio_core::SecondaryIndex::for_definition(&def);
            for record in self.list.iter_forward() {
                if !record.is_live() {
                    continue;
                }
                let Some(key) = self.key_for(&def, &record.data)? else {
                    continue;
                };
                let payload = if idx == 0 {
                    IndexKey::Int(record.slot.0 as i64)
                } else {
                    self.primary_key_of(&record.data)?
                };
                fresh.insert(key, payload);
            }
            indexes.insert(def.key.clone(), fresh.to_portable(&def));
            index_defs.insert(def.key.clone(), def);
        }
        if let Some(template) = &self.wildcard {
            index_defs.insert(template.key.clone(), template.clone());
        }
        Ok(StoredState {
            list: self.list.to_persist(),
            indexes,
            index_defs,
            id_field: self.id_field.clone(),
            ttl_ms: self.ttl.map(|t| t.as_millis() as u64),
        })
    }

    /// Store a snapshot under an explicit name (rotation copies).
    pub fn store_named(&mut self, state: &StoredState, name: &str) -> FolioResult<()> {
        self.adapter.storage().store(state, Some(name))
    }

    /// Empty the collection: the list resets (counter preserved) and every
    /// index clears.
    pub fn reset(&mut self) -> FolioResult<()> {
        self.list.reset()?;
        for maintainer in &mut self.maintainers {
            maintainer.clear();
        }
        self.persist_if_auto()
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    fn manager(&self) -> FolioResult<Arc<TransactionManager>> {
        self.wal
            .clone()
            .ok_or_else(|| FolioError::config("collection is not bound to a transaction manager"))
    }

    fn ensure_tx(&mut self, tx_id: &str) -> FolioResult<()> {
        if self.tx_states.contains_key(tx_id) {
            return Ok(());
        }
        self.adapter.transactional()?;
        let manager = self.manager()?;
        manager.join(tx_id, &self.name)?;

        let mut snapshot = BTreeMap::new();
        for record in self.list.iter_forward() {
            if record.is_live() {
                let pk = self.primary_key_of(&record.data)?;
                snapshot.insert(pk, record);
            }
        }
        self.adapter.transactional()?.begin_transaction(tx_id);
        self.tx_states.insert(
            tx_id.to_string(),
            TxLocal {
                snapshot: Arc::new(snapshot),
                changes: Vec::new(),
            },
        );
        Ok(())
    }

    /// Effective view of a primary key inside a transaction: the begin
    /// snapshot overlaid with this transaction's staged operations.
    pub fn get_tx(&mut self, tx_id: &str, id: IndexKey) -> FolioResult<Option<Document>> {
        self.ensure_tx(tx_id)?;
        let pk = self.process_for(0, id);
        Ok(self.effective_tx_view(tx_id)?.remove(&pk))
    }

    /// All documents visible inside a transaction.
    pub fn find_tx(&mut self, tx_id: &str, condition: &Condition) -> FolioResult<Vec<Document>> {
        self.ensure_tx(tx_id)?;
        let view = self.effective_tx_view(tx_id)?;
        let docs = view.into_values();
        Ok(match condition {
            Condition::Predicate(pred) => docs.filter(|d| pred(d)).collect(),
            Condition::Fields(fields) => docs
                .filter(|doc| {
                    fields.iter().all(|(field, value)| {
                        IndexKey::from_value(get_path(doc, field))
                            == IndexKey::from_value(Some(value))
                    })
                })
                .collect(),
        })
    }

    fn effective_tx_view(&mut self, tx_id: &str) -> FolioResult<BTreeMap<IndexKey, Document>> {
        let state = self
            .tx_states
            .get(tx_id)
            .ok_or_else(|| FolioError::not_found(format!("transaction {}", tx_id)))?;
        let mut view: BTreeMap<IndexKey, Document> = state
            .snapshot
            .iter()
            .map(|(pk, record)| (pk.clone(), record.data.clone()))
            .collect();
        let staged: Vec<WriteOperation> = self
            .adapter
            .transactional()?
            .staged_ops(tx_id)
            .to_vec();
        for op in &staged {
            match &op.kind {
                WriteKind::Insert { document } | WriteKind::Update { document, .. } => {
                    let pk = self.primary_key_of(document)?;
                    view.insert(pk, document.clone());
                }
                WriteKind::Remove { primary_key, .. } => {
                    let pk = self.process_for(0, primary_key.clone());
                    view.remove(&pk);
                }
            }
        }
        Ok(view)
    }

    fn stage_op(&mut self, tx_id: &str, kind: WriteKind) -> FolioResult<WriteOperation> {
        let seq = self.adapter.transactional()?.staged_ops(tx_id).len() as u64;
        let op = WriteOperation { seq, kind };
        // DATA entry reaches the WAL before the operation touches staging
        self.manager()?.log_operation(tx_id, &self.name, &op)?;
        self.adapter
            .transactional()?
            .write_operation_replayed(tx_id, op.clone())?;
        Ok(op)
    }

    /// Insert under a transaction. Values are generated and the document
    /// completed now; unique constraints are enforced at prepare.
    pub fn push_tx(&mut self, tx_id: &str, doc: Document) -> FolioResult<Document> {
        self.ensure_tx(tx_id)?;
        let mut doc = doc;
        if !doc.is_object() {
            return Err(FolioError::validation("records must be JSON objects"));
        }
        self.install_wildcard_indexes(&doc)?;

        // staged inserts advance the visible counter so auto-increment ids
        // stay unique within the transaction
        let staged_inserts = self
            .adapter
            .transactional()?
            .staged_ops(tx_id)
            .iter()
            .filter(|op| matches!(op.kind, WriteKind::Insert { .. }))
            .count() as u64;
        let stats = ListStats {
            counter: self.list.counter() + staged_inserts,
            len: self.list.len(),
        };

        for idx in 0..self.maintainers.len() {
            let def = self.maintainers[idx].definition().clone();
            let resolved = resolve_index_value(&def, &doc, &stats, &self.registry)?;
            if resolved.generated {
                if let Some(key) = &resolved.key {
                    set_path(&mut doc, &def.key, key.to_json()).map_err(FolioError::validation)?;
                }
            }
        }
        if let Some(validator) = &self.validator {
            validator.validate(&doc).map_err(FolioError::validation)?;
        }

        let pk = self.primary_key_of(&doc)?;
        self.stage_op(
            tx_id,
            WriteKind::Insert {
                document: doc.clone(),
            },
        )?;
        let change = ChangeRecord::insert(
            &self.database,
            &self.name,
            Some(pk.to_string()),
            doc.clone(),
        )
        .in_transaction(tx_id);
        self.buffer_change(tx_id, change);
        Ok(doc)
    }

    /// Update under a transaction.
    pub fn update_tx(
        &mut self,
        tx_id: &str,
        id: IndexKey,
        patch: Document,
        merge: bool,
    ) -> FolioResult<Document> {
        self.ensure_tx(tx_id)?;
        let pk = self.process_for(0, id);
        let current = self
            .effective_tx_view(tx_id)?
            .remove(&pk)
            .ok_or_else(|| FolioError::not_found(format!("record {}", pk)))?;

        let mut new_doc = current.clone();
        if merge {
            deep_merge(&mut new_doc, &patch);
        } else {
            shallow_assign(&mut new_doc, &patch);
        }
        for idx in 0..self.maintainers.len() {
            let def = self.maintainers[idx].definition().clone();
            self.key_for(&def, &new_doc)?; // required-null surfaces now
        }
        if let Some(validator) = &self.validator {
            validator.validate(&new_doc).map_err(FolioError::validation)?;
        }

        self.stage_op(
            tx_id,
            WriteKind::Update {
                primary_key: pk.clone(),
                document: new_doc.clone(),
                previous: current.clone(),
            },
        )?;
        let change = ChangeRecord::update(
            &self.database,
            &self.name,
            Some(pk.to_string()),
            current,
            new_doc.clone(),
        )
        .in_transaction(tx_id);
        self.buffer_change(tx_id, change);
        Ok(new_doc)
    }

    /// Remove under a transaction.
    pub fn remove_tx(&mut self, tx_id: &str, id: IndexKey) -> FolioResult<()> {
        self.ensure_tx(tx_id)?;
        let pk = self.process_for(0, id);
        let current = self
            .effective_tx_view(tx_id)?
            .remove(&pk)
            .ok_or_else(|| FolioError::not_found(format!("record {}", pk)))?;

        self.stage_op(
            tx_id,
            WriteKind::Remove {
                primary_key: pk.clone(),
                previous: current.clone(),
            },
        )?;
        let change = ChangeRecord::delete(
            &self.database,
            &self.name,
            Some(pk.to_string()),
            current,
        )
        .in_transaction(tx_id);
        self.buffer_change(tx_id, change);
        Ok(())
    }

    fn buffer_change(&mut self, tx_id: &str, change: ChangeRecord) {
        if let Some(state) = self.tx_states.get_mut(tx_id) {
            state.changes.push(change);
        }
    }

    // ------------------------------------------------------------------------
    // Participant hooks (called through SharedCollection)
    // ------------------------------------------------------------------------

    pub(crate) fn begin_participant(&mut self, tx_id: &str) -> FolioResult<()> {
        self.ensure_tx(tx_id)
    }

    /// Prepare vote: staging must be consistent and unique constraints
    /// must hold against the latest committed state (last-writer-wins for
    /// plain overwrites; constraint conflicts surface here).
    pub(crate) fn prepare_participant(&mut self, tx_id: &str) -> FolioResult<bool> {
        if !self.adapter.transactional()?.prepare_commit(tx_id)? {
            return Ok(false);
        }

        // effective post-commit documents: committed live state + staging
        let mut effective: BTreeMap<IndexKey, Document> = BTreeMap::new();
        for record in self.list.iter_forward() {
            if record.is_live() {
                effective.insert(self.primary_key_of(&record.data)?, record.data);
            }
        }
        let staged: Vec<WriteOperation> =
            self.adapter.transactional()?.staged_ops(tx_id).to_vec();
        for op in &staged {
            match &op.kind {
                WriteKind::Insert { document } | WriteKind::Update { document, .. } => {
                    effective.insert(self.primary_key_of(document)?, document.clone());
                }
                WriteKind::Remove { primary_key, .. } => {
                    effective.remove(&self.process_for(0, primary_key.clone()));
                }
            }
        }

        for maintainer in &self.maintainers {
            let def = maintainer.definition().clone();
            if !def.unique {
                continue;
            }
            let mut seen: FxHashMap<IndexKey, IndexKey> = FxHashMap::default();
            for (pk, doc) in &effective {
                let Some(key) = self.key_for(&def, doc)? else {
                    continue;
                };
                if let Some(existing) = seen.insert(key.clone(), pk.clone()) {
                    if existing != *pk {
                        return Err(FolioError::unique_violation(&def.key, &key));
                    }
                }
            }
        }
        Ok(true)
    }

    pub(crate) fn finalize_participant(&mut self, tx_id: &str) -> FolioResult<()> {
        let stage = self.adapter.transactional()?.take_staged(tx_id)?;
        for op in &stage.ops {
            self.apply_operation(&op.kind)?;
        }
        self.adapter.transactional()?.flush_staged_stores(&stage)?;
        self.persist()?;
        if let Some(state) = self.tx_states.remove(tx_id) {
            self.sink.publish_batch(state.changes);
        }
        self.monitor.incr("transactions_committed");
        Ok(())
    }

    pub(crate) fn rollback_participant(&mut self, tx_id: &str) -> FolioResult<()> {
        if let Ok(adapter) = self.adapter.transactional() {
            adapter.rollback(tx_id);
        }
        self.tx_states.remove(tx_id);
        self.monitor.incr("transactions_rolled_back");
        Ok(())
    }

    pub(crate) fn replay_participant(&mut self, op: &WriteOperation) -> FolioResult<()> {
        self.apply_operation(&op.kind)
    }
}
