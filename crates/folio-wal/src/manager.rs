//! Transaction manager
//!
//! Owns the WAL file and the map of live transactions; coordinates
//! two-phase commit across registered participants. Participants are held
//! as weak references; the collection owns itself and its adapter, the
//! manager only coordinates.
//!
//! ## Commit sequence
//!
//! ```text
//! 1. state -> Preparing; append PREPARE
//! 2. prepare_commit() on every participant; any veto or error -> abort
//! 3. state -> Prepared; append COMMIT and sync  (DURABILITY POINT)
//! 4. state -> Committed; finalize_commit() on every participant in
//!    registration order; finalize errors are logged, not fatal;
//!    the durable marker means recovery will replay
//! ```
//!
//! A WAL write failure at any step before the commit marker forces a
//! rollback. Once PREPARE is appended a transaction can no longer be
//! timed out; it must travel the explicit commit or rollback path.

use crate::config::WalOptions;
use crate::entry::{WalEntry, WalEntryKind};
use crate::log::WalFile;
use crate::recovery::{self, RecoverySummary};
use dashmap::DashMap;
use folio_core::{now_millis, FolioError, FolioResult, IntervalTimer, TimerGuard};
use folio_storage::WriteOperation;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Supported isolation levels. Snapshot only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Reads see committed state at `begin` plus the transaction's own
    /// staged changes
    #[default]
    Snapshot,
}

/// Options accepted by `begin`.
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// Abort the transaction if it has not prepared within this window
    pub timeout: Duration,
    /// Isolation level (snapshot only)
    pub isolation: IsolationLevel,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        TransactionOptions {
            timeout: Duration::from_secs(30),
            isolation: IsolationLevel::Snapshot,
        }
    }
}

/// Live-transaction states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting operations
    Active,
    /// PREPARE appended, votes being collected
    Preparing,
    /// All participants voted yes
    Prepared,
    /// COMMIT marker durable
    Committed,
    /// Rolled back
    Aborted,
}

#[derive(Debug)]
struct TransactionRecord {
    state: TxState,
    started: Instant,
    started_at_ms: u64,
    timeout: Duration,
    isolation: IsolationLevel,
    participants: Vec<String>,
}

/// A party to two-phase commit; in practice, a collection.
///
/// `participant_name` must equal the collection name used in DATA entries
/// so recovery can route replayed operations.
pub trait TransactionParticipant: Send + Sync {
    /// Stable name, used for registration and replay routing.
    fn participant_name(&self) -> String;

    /// Open local staging for a transaction.
    fn begin_transaction(&self, tx_id: &str) -> FolioResult<()>;

    /// Vote on the commit. `false` vetoes.
    fn prepare_commit(&self, tx_id: &str) -> FolioResult<bool>;

    /// Apply staged changes; runs after the durable commit marker.
    fn finalize_commit(&self, tx_id: &str) -> FolioResult<()>;

    /// Discard staged changes.
    fn rollback(&self, tx_id: &str) -> FolioResult<()>;

    /// Re-apply one committed operation during recovery. Must be
    /// idempotent: replaying the same WAL twice yields the same state.
    fn apply_replay(&self, op: &WriteOperation) -> FolioResult<()>;

    /// Persist current state to storage (checkpoints, recovery epilogue).
    fn persist_snapshot(&self) -> FolioResult<()>;
}

/// Coordinates transactions, the WAL, checkpoints, and recovery.
pub struct TransactionManager {
    wal: Mutex<WalFile>,
    transactions: DashMap<String, TransactionRecord>,
    participants: Mutex<Vec<(String, Weak<dyn TransactionParticipant>)>>,
    options: WalOptions,
    appends_since_checkpoint: AtomicU64,
    checkpointing: AtomicBool,
}

impl TransactionManager {
    /// Open the WAL at the configured path and stand the manager up.
    pub fn open(options: WalOptions) -> FolioResult<Self> {
        let wal = WalFile::open(
            &options.wal_path,
            options.compression.codec(),
            options.flush_interval_ms,
        )?;
        Ok(TransactionManager {
            wal: Mutex::new(wal),
            transactions: DashMap::new(),
            participants: Mutex::new(Vec::new()),
            options,
            appends_since_checkpoint: AtomicU64::new(0),
            checkpointing: AtomicBool::new(false),
        })
    }

    /// Register a participant. Registration order is finalize order.
    /// Re-registering a name replaces the previous weak reference.
    pub fn register_participant(&self, participant: &Arc<dyn TransactionParticipant>) {
        let name = participant.participant_name();
        let mut participants = self.participants.lock();
        if let Some(slot) = participants.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = Arc::downgrade(participant);
        } else {
            participants.push((name, Arc::downgrade(participant)));
        }
    }

    fn resolve_participant(&self, name: &str) -> Option<Arc<dyn TransactionParticipant>> {
        self.participants
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, weak)| weak.upgrade())
    }

    fn live_participants(&self) -> Vec<(String, Arc<dyn TransactionParticipant>)> {
        self.participants
            .lock()
            .iter()
            .filter_map(|(name, weak)| weak.upgrade().map(|p| (name.clone(), p)))
            .collect()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Begin a transaction: append BEGIN, register the record.
    pub fn begin(&self, options: TransactionOptions) -> FolioResult<String> {
        let tx_id = Uuid::new_v4().to_string();
        self.append(
            &tx_id,
            WalEntryKind::Begin {
                timeout_ms: options.timeout.as_millis() as u64,
            },
        )?;
        self.transactions.insert(
            tx_id.clone(),
            TransactionRecord {
                state: TxState::Active,
                started: Instant::now(),
                started_at_ms: now_millis(),
                timeout: options.timeout,
                isolation: options.isolation,
                participants: Vec::new(),
            },
        );
        debug!(tx = %tx_id, "transaction started");
        Ok(tx_id)
    }

    /// Record that a participant joined a transaction (first write).
    pub fn join(&self, tx_id: &str, participant_name: &str) -> FolioResult<()> {
        let mut record = self
            .transactions
            .get_mut(tx_id)
            .ok_or_else(|| FolioError::not_found(format!("transaction {}", tx_id)))?;
        if record.state != TxState::Active {
            return Err(FolioError::aborted(
                tx_id,
                format!("cannot join in state {:?}", record.state),
            ));
        }
        if !record.participants.iter().any(|p| p == participant_name) {
            record.participants.push(participant_name.to_string());
        }
        Ok(())
    }

    /// Append a DATA entry for one staged operation. Runs before the
    /// operation is applied to staging. A WAL write failure forces the
    /// whole transaction into rollback.
    pub fn log_operation(
        &self,
        tx_id: &str,
        collection: &str,
        op: &WriteOperation,
    ) -> FolioResult<u64> {
        {
            let record = self
                .transactions
                .get(tx_id)
                .ok_or_else(|| FolioError::not_found(format!("transaction {}", tx_id)))?;
            if record.state != TxState::Active {
                return Err(FolioError::aborted(
                    tx_id,
                    format!("cannot write in state {:?}", record.state),
                ));
            }
        }

        let operation = serde_json::to_vec(op)?;
        match self.append(
            tx_id,
            WalEntryKind::Data {
                collection: collection.to_string(),
                operation,
            },
        ) {
            Ok(entry) => Ok(entry.sequence_number),
            Err(e) => {
                warn!(tx = %tx_id, error = %e, "WAL write failed; forcing rollback");
                let _ = self.rollback(tx_id);
                Err(FolioError::aborted(
                    tx_id,
                    format!("WAL write failed: {}", e),
                ))
            }
        }
    }

    /// Two-phase commit.
    pub fn commit(&self, tx_id: &str) -> FolioResult<()> {
        let participant_names = {
            let record = self
                .transactions
                .get(tx_id)
                .ok_or_else(|| FolioError::not_found(format!("transaction {}", tx_id)))?;
            if record.state != TxState::Active {
                return Err(FolioError::aborted(
                    tx_id,
                    format!("cannot commit in state {:?}", record.state),
                ));
            }
            record.participants.clone()
        };

        // Phase 1: PREPARE
        self.set_state(tx_id, TxState::Preparing);
        if let Err(e) = self.append(tx_id, WalEntryKind::Prepare) {
            self.abort_internal(tx_id, &participant_names, "WAL PREPARE write failed");
            return Err(FolioError::aborted(
                tx_id,
                format!("WAL PREPARE write failed: {}", e),
            ));
        }

        for name in &participant_names {
            let participant = match self.resolve_participant(name) {
                Some(p) => p,
                None => {
                    self.abort_internal(tx_id, &participant_names, "participant dropped");
                    return Err(FolioError::aborted(
                        tx_id,
                        format!("participant '{}' no longer exists", name),
                    ));
                }
            };
            match participant.prepare_commit(tx_id) {
                Ok(true) => {}
                Ok(false) => {
                    self.abort_internal(tx_id, &participant_names, "prepare veto");
                    return Err(FolioError::aborted(
                        tx_id,
                        format!("participant '{}' vetoed prepare", name),
                    ));
                }
                Err(e) => {
                    self.abort_internal(tx_id, &participant_names, "prepare error");
                    return Err(FolioError::aborted(
                        tx_id,
                        format!("participant '{}' failed prepare: {}", name, e),
                    ));
                }
            }
        }
        self.set_state(tx_id, TxState::Prepared);

        // Phase 2: durable COMMIT marker
        if let Err(e) = self.append(tx_id, WalEntryKind::Commit) {
            self.abort_internal(tx_id, &participant_names, "WAL COMMIT write failed");
            return Err(FolioError::aborted(
                tx_id,
                format!("WAL COMMIT write failed: {}", e),
            ));
        }
        self.set_state(tx_id, TxState::Committed);

        // Finalize in registration order. Once the marker is durable the
        // transaction is committed even if an observer fails here.
        let registration_order: Vec<String> = self
            .participants
            .lock()
            .iter()
            .map(|(n, _)| n.clone())
            .filter(|n| participant_names.contains(n))
            .collect();
        for name in &registration_order {
            if let Some(participant) = self.resolve_participant(name) {
                if let Err(e) = participant.finalize_commit(tx_id) {
                    error!(tx = %tx_id, participant = %name, error = %e,
                        "finalize failed after durable commit; recovery will replay");
                }
            }
        }

        self.transactions.remove(tx_id);
        debug!(tx = %tx_id, "transaction committed");
        self.maybe_auto_checkpoint();
        Ok(())
    }

    /// Roll a transaction back: append ROLLBACK, discard staging.
    pub fn rollback(&self, tx_id: &str) -> FolioResult<()> {
        let participant_names = {
            let record = self
                .transactions
                .get(tx_id)
                .ok_or_else(|| FolioError::not_found(format!("transaction {}", tx_id)))?;
            record.participants.clone()
        };
        if let Err(e) = self.append(tx_id, WalEntryKind::Rollback) {
            // the in-memory abort still proceeds; recovery treats a missing
            // ROLLBACK as presumed abort anyway
            warn!(tx = %tx_id, error = %e, "failed to append ROLLBACK");
        }
        self.abort_internal(tx_id, &participant_names, "explicit rollback");
        Ok(())
    }

    fn abort_internal(&self, tx_id: &str, participant_names: &[String], reason: &str) {
        for name in participant_names {
            if let Some(participant) = self.resolve_participant(name) {
                if let Err(e) = participant.rollback(tx_id) {
                    warn!(tx = %tx_id, participant = %name, error = %e, "participant rollback failed");
                }
            }
        }
        self.transactions.remove(tx_id);
        debug!(tx = %tx_id, reason, "transaction aborted");
    }

    fn set_state(&self, tx_id: &str, state: TxState) {
        if let Some(mut record) = self.transactions.get_mut(tx_id) {
            record.state = state;
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// State of a live transaction.
    pub fn state(&self, tx_id: &str) -> Option<TxState> {
        self.transactions.get(tx_id).map(|r| r.state)
    }

    /// Number of live transactions.
    pub fn active_count(&self) -> usize {
        self.transactions.len()
    }

    /// Whether any live transaction involves the named participant.
    ///
    /// Rotation uses this to defer while a transaction is in flight.
    pub fn has_active_for(&self, participant_name: &str) -> bool {
        self.transactions.iter().any(|entry| {
            entry
                .value()
                .participants
                .iter()
                .any(|p| p == participant_name)
        })
    }

    /// Wall-clock start time of a transaction, epoch milliseconds.
    pub fn started_at(&self, tx_id: &str) -> Option<u64> {
        self.transactions.get(tx_id).map(|r| r.started_at_ms)
    }

    /// Isolation level of a transaction.
    pub fn isolation(&self, tx_id: &str) -> Option<IsolationLevel> {
        self.transactions.get(tx_id).map(|r| r.isolation)
    }

    /// Debug view over the log.
    pub fn wal_entries(&self, from: u64) -> FolioResult<Vec<WalEntry>> {
        let (entries, _) = self.wal.lock().read_from(from)?;
        Ok(entries)
    }

    // ========================================================================
    // Timeouts
    // ========================================================================

    /// Abort every Active transaction past its deadline. Transactions at
    /// or beyond PREPARE are left alone. Returns the aborted ids.
    pub fn sweep_timeouts(&self) -> Vec<String> {
        let expired: Vec<String> = self
            .transactions
            .iter()
            .filter(|entry| {
                entry.value().state == TxState::Active
                    && entry.value().started.elapsed() > entry.value().timeout
            })
            .map(|entry| entry.key().clone())
            .collect();
        for tx_id in &expired {
            warn!(tx = %tx_id, "transaction timed out");
            let _ = self.rollback(tx_id);
        }
        expired
    }

    /// Run the timeout sweep on a timer.
    pub fn start_timeout_sweeper(
        self: &Arc<Self>,
        timer: &dyn IntervalTimer,
        period: Duration,
    ) -> TimerGuard {
        let manager = Arc::downgrade(self);
        timer.every(
            period,
            Box::new(move || {
                if let Some(manager) = manager.upgrade() {
                    manager.sweep_timeouts();
                }
            }),
        )
    }

    // ========================================================================
    // Checkpoints and recovery
    // ========================================================================

    /// Snapshot all live participants, append a CHECKPOINT entry, then
    /// truncate the log through the persisted sequence.
    pub fn create_checkpoint(&self) -> FolioResult<String> {
        if self.checkpointing.swap(true, Ordering::SeqCst) {
            return Err(FolioError::validation("checkpoint already in progress"));
        }
        let result = self.create_checkpoint_inner();
        self.checkpointing.store(false, Ordering::SeqCst);
        result
    }

    fn create_checkpoint_inner(&self) -> FolioResult<String> {
        for (name, participant) in self.live_participants() {
            participant.persist_snapshot().map_err(|e| {
                FolioError::adapter_io(format!("checkpoint persist of '{}' failed: {}", name, e))
            })?;
        }

        let checkpoint_id = Uuid::new_v4().to_string();
        let persisted_sequence = self.wal.lock().current_sequence();
        self.append(
            &checkpoint_id,
            WalEntryKind::Checkpoint {
                checkpoint_id: checkpoint_id.clone(),
                persisted_sequence,
            },
        )?;
        self.wal.lock().truncate_through(persisted_sequence)?;
        self.appends_since_checkpoint.store(0, Ordering::SeqCst);
        info!(checkpoint = %checkpoint_id, persisted_sequence, "checkpoint created");
        Ok(checkpoint_id)
    }

    fn maybe_auto_checkpoint(&self) {
        if let Some(threshold) = self.options.checkpoint_interval_entries {
            if self.appends_since_checkpoint.load(Ordering::SeqCst) >= threshold {
                if let Err(e) = self.create_checkpoint() {
                    warn!(error = %e, "automatic checkpoint failed");
                }
            }
        }
    }

    /// Replay the log into the registered participants.
    ///
    /// Call after every participant has restored its snapshot and
    /// registered. Committed transactions replay in order; anything still
    /// in flight at the end of the log is presumed aborted.
    pub fn recover(&self) -> FolioResult<RecoverySummary> {
        let participants: HashMap<String, Arc<dyn TransactionParticipant>> =
            self.live_participants().into_iter().collect();
        let mut wal = self.wal.lock();
        recovery::recover(&mut wal, &participants)
    }

    fn append(&self, tx_id: &str, kind: WalEntryKind) -> FolioResult<WalEntry> {
        let entry = self.wal.lock().append(tx_id, kind)?;
        self.appends_since_checkpoint.fetch_add(1, Ordering::SeqCst);
        Ok(entry)
    }
}
