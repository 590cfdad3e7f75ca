//! Timer-driven log rotation
//!
//! On each tick, a non-empty collection is deep-copied into a snapshot
//! named `<name>-<timestamp>`, the copy is persisted through the adapter,
//! and the source is reset and persisted. Copy semantics: index
//! definitions and metadata are copied; trees are rebuilt by scanning
//! records, never by serializing the live structures.
//!
//! Rotation defers while any transaction involving the collection is in
//! flight; the copy happens on a later tick instead.

use crate::shared::SharedCollection;
use folio_core::{now_millis, IntervalTimer, TimerGuard};
use folio_wal::TransactionManager;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{info, warn};

/// Callback invoked with the rotated snapshot's name after a rotation.
pub type RotateCallback = Box<dyn Fn(&str) + Send>;

/// Schedule rotation ticks for a collection.
///
/// The timer holds only a weak reference; dropping the collection ends
/// the ticks, and dropping the returned guard cancels them.
pub fn schedule_rotation(
    collection: &Arc<SharedCollection>,
    timer: &dyn IntervalTimer,
    period: Duration,
    manager: Option<Arc<TransactionManager>>,
    on_rotate: Option<RotateCallback>,
) -> TimerGuard {
    let weak: Weak<SharedCollection> = Arc::downgrade(collection);
    timer.every(
        period,
        Box::new(move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if let Some(manager) = &manager {
                if manager.has_active_for(shared.name()) {
                    // a transaction is in flight; rotate on a later tick
                    return;
                }
            }
            let mut collection = shared.lock();
            if collection.is_empty() {
                return;
            }

            let rotated_name = format!("{}-{}", collection.name(), now_millis());
            let snapshot = match collection.rotated_snapshot() {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(collection = %collection.name(), error = %e, "rotation snapshot failed");
                    return;
                }
            };
            if let Err(e) = collection.store_named(&snapshot, &rotated_name) {
                warn!(collection = %collection.name(), error = %e, "rotation store failed");
                return;
            }
            if let Err(e) = collection.reset() {
                warn!(collection = %collection.name(), error = %e, "rotation reset failed");
                return;
            }
            info!(collection = %collection.name(), rotated = %rotated_name, "rotated");
            drop(collection);
            if let Some(callback) = &on_rotate {
                callback(&rotated_name);
            }
        }),
    )
}
