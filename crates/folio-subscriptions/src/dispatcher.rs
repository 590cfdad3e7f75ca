//! Notification dispatch
//!
//! Per-connection batching with priority bypass. Normal-priority
//! notifications queue per connection and flush on the first of: batch
//! size reached, batch age exceeded, or an explicit flush (shutdown).
//! High-priority notifications send immediately.
//!
//! Transport failures retry with linear backoff up to the configured
//! limit, then the batch is counted as failed and dropped; there is no
//! dead-letter store. Within a batch the issuance order is preserved;
//! across batches ordering is best-effort. Independent connections flush
//! concurrently from the background flush loop.

use crate::config::NotificationsConfig;
use folio_core::{now_millis, ChangeRecord, FolioResult, IntervalTimer, TimerGuard};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Outgoing message serialization. `MessagePack` is accepted for
/// configuration parity but currently serializes as JSON; the profile is
/// an open placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageFormat {
    /// JSON payloads
    #[default]
    Json,
    /// Placeholder: serializes as JSON
    MessagePack,
}

/// Delivery priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Batched per connection
    Normal,
    /// Sent immediately, bypassing the batch
    High,
}

/// One outgoing notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Subscription that matched
    pub subscription_id: String,
    /// Target connection
    pub connection_id: String,
    /// Global issuance sequence
    pub sequence: u64,
    /// The change being delivered
    pub change: ChangeRecord,
    /// Subscription metadata, included when the query asked for it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<folio_core::Document>,
    /// Issuance time, epoch ms
    pub timestamp: u64,
}

/// Transport capability: the wire layer the core hands payloads to.
pub trait Transport: Send + Sync {
    /// Deliver a serialized batch to a connection.
    fn send(&self, connection_id: &str, payload: &[u8]) -> FolioResult<()>;
}

struct ConnQueue {
    items: Vec<Notification>,
    oldest: Instant,
}

/// Dispatcher statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct DispatcherStats {
    /// Notifications delivered
    pub delivered: u64,
    /// Notifications dropped after exhausting retries
    pub failed: u64,
    /// Notifications dropped by connection closure
    pub dropped: u64,
    /// Batches sent
    pub batches: u64,
    /// Notifications currently queued
    pub queued: usize,
}

/// Per-connection batching, throttling, and retry.
pub struct NotificationDispatcher {
    transport: Arc<dyn Transport>,
    config: NotificationsConfig,
    format: MessageFormat,
    queues: Mutex<FxHashMap<String, ConnQueue>>,
    sequence: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    batches: AtomicU64,
}

impl NotificationDispatcher {
    /// Dispatcher over a transport.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: NotificationsConfig,
        format: MessageFormat,
    ) -> Arc<Self> {
        Arc::new(NotificationDispatcher {
            transport,
            config,
            format,
            queues: Mutex::new(FxHashMap::default()),
            sequence: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            batches: AtomicU64::new(0),
        })
    }

    /// Queue (or immediately send) one notification.
    pub fn enqueue(
        &self,
        subscription_id: &str,
        connection_id: &str,
        change: ChangeRecord,
        priority: Priority,
    ) {
        self.enqueue_with_metadata(subscription_id, connection_id, change, priority, None)
    }

    /// Queue a notification carrying subscription metadata.
    pub fn enqueue_with_metadata(
        &self,
        subscription_id: &str,
        connection_id: &str,
        change: ChangeRecord,
        priority: Priority,
        metadata: Option<folio_core::Document>,
    ) {
        let notification = Notification {
            subscription_id: subscription_id.to_string(),
            connection_id: connection_id.to_string(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            change,
            metadata,
            timestamp: now_millis(),
        };

        match priority {
            Priority::High => {
                self.send_batch(connection_id, vec![notification]);
            }
            Priority::Normal => {
                let full = {
                    let mut queues = self.queues.lock();
                    let queue = queues.entry(connection_id.to_string()).or_insert_with(|| {
                        ConnQueue {
                            items: Vec::new(),
                            oldest: Instant::now(),
                        }
                    });
                    if queue.items.is_empty() {
                        queue.oldest = Instant::now();
                    }
                    queue.items.push(notification);
                    queue.items.len() >= self.config.batch_size
                };
                if full {
                    self.flush_connection(connection_id);
                }
            }
        }
    }

    /// Flush one connection's batch now.
    pub fn flush_connection(&self, connection_id: &str) {
        let batch = {
            let mut queues = self.queues.lock();
            match queues.remove(connection_id) {
                Some(queue) if !queue.items.is_empty() => queue.items,
                _ => return,
            }
        };
        self.send_batch(connection_id, batch);
    }

    /// Flush batches whose age exceeds the batch timeout. The send fan-out
    /// happens outside the queue lock, one thread per connection.
    pub fn flush_due(&self) {
        let timeout = Duration::from_millis(self.config.batch_timeout_ms);
        let due: Vec<(String, Vec<Notification>)> = {
            let mut queues = self.queues.lock();
            let connections: Vec<String> = queues
                .iter()
                .filter(|(_, q)| !q.items.is_empty() && q.oldest.elapsed() >= timeout)
                .map(|(c, _)| c.clone())
                .collect();
            connections
                .into_iter()
                .filter_map(|c| queues.remove(&c).map(|q| (c, q.items)))
                .collect()
        };
        self.fan_out(due);
    }

    /// Flush everything (shutdown).
    pub fn flush_all(&self) {
        let batches: Vec<(String, Vec<Notification>)> = {
            let mut queues = self.queues.lock();
            queues
                .drain()
                .filter(|(_, q)| !q.items.is_empty())
                .map(|(c, q)| (c, q.items))
                .collect()
        };
        self.fan_out(batches);
    }

    /// Run `flush_due` on a timer.
    pub fn start_flusher(self: &Arc<Self>, timer: &dyn IntervalTimer) -> TimerGuard {
        let period = Duration::from_millis((self.config.batch_timeout_ms / 2).max(10));
        let weak = Arc::downgrade(self);
        timer.every(
            period,
            Box::new(move || {
                if let Some(dispatcher) = weak.upgrade() {
                    dispatcher.flush_due();
                }
            }),
        )
    }

    /// Connection closed: pending notifications are dropped and counted.
    pub fn drop_connection(&self, connection_id: &str) {
        if let Some(queue) = self.queues.lock().remove(connection_id) {
            self.dropped
                .fetch_add(queue.items.len() as u64, Ordering::SeqCst);
        }
    }

    /// Independent connections flush concurrently.
    fn fan_out(&self, batches: Vec<(String, Vec<Notification>)>) {
        if batches.len() <= 1 {
            for (connection, batch) in batches {
                self.send_batch(&connection, batch);
            }
            return;
        }
        std::thread::scope(|scope| {
            for (connection, batch) in batches {
                scope.spawn(move || self.send_batch(&connection, batch));
            }
        });
    }

    fn send_batch(&self, connection_id: &str, batch: Vec<Notification>) {
        let payload = match self.serialize(&batch) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "notification serialization failed");
                self.failed
                    .fetch_add(batch.len() as u64, Ordering::SeqCst);
                return;
            }
        };

        for attempt in 0..=self.config.max_retries {
            match self.transport.send(connection_id, &payload) {
                Ok(()) => {
                    self.delivered
                        .fetch_add(batch.len() as u64, Ordering::SeqCst);
                    self.batches.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    if attempt == self.config.max_retries {
                        warn!(
                            connection = %connection_id,
                            attempts = attempt + 1,
                            error = %e,
                            "delivery failed; dropping batch"
                        );
                        break;
                    }
                    // linear backoff
                    std::thread::sleep(Duration::from_millis(
                        self.config.retry_delay_ms * (attempt as u64 + 1),
                    ));
                }
            }
        }
        self.failed.fetch_add(batch.len() as u64, Ordering::SeqCst);
    }

    fn serialize(&self, batch: &[Notification]) -> FolioResult<Vec<u8>> {
        match self.format {
            // MessagePack is a placeholder profile; both arms emit JSON
            MessageFormat::Json | MessageFormat::MessagePack => {
                Ok(serde_json::to_vec(batch)?)
            }
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            delivered: self.delivered.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            batches: self.batches.load(Ordering::SeqCst),
            queued: self.queues.lock().values().map(|q| q.items.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::FolioError;
    use parking_lot::Mutex as PlMutex;

    /// Transport that records payloads and can be told to fail.
    struct RecordingTransport {
        sent: PlMutex<Vec<(String, Vec<Notification>)>>,
        failures_before_success: PlMutex<u32>,
    }

    impl RecordingTransport {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(RecordingTransport {
                sent: PlMutex::new(Vec::new()),
                failures_before_success: PlMutex::new(failures),
            })
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, connection_id: &str, payload: &[u8]) -> FolioResult<()> {
            let mut failures = self.failures_before_success.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(FolioError::adapter_io("transport down"));
            }
            let batch: Vec<Notification> = serde_json::from_slice(payload).unwrap();
            self.sent.lock().push((connection_id.to_string(), batch));
            Ok(())
        }
    }

    fn change(n: i64) -> ChangeRecord {
        ChangeRecord::insert("db", "users", Some(n.to_string()), serde_json::json!({"n": n}))
    }

    fn config(batch_size: usize) -> NotificationsConfig {
        NotificationsConfig {
            batch_size,
            batch_timeout_ms: 50,
            max_retries: 2,
            retry_delay_ms: 1,
        }
    }

    #[test]
    fn batch_flushes_at_size() {
        let transport = RecordingTransport::new(0);
        let dispatcher =
            NotificationDispatcher::new(transport.clone(), config(3), MessageFormat::Json);
        for n in 0..3 {
            dispatcher.enqueue("s1", "c1", change(n), Priority::Normal);
        }
        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.len(), 3);
        // issuance order preserved within the batch
        let ns: Vec<i64> = sent[0].1.iter().map(|n| n.change.data.as_ref().unwrap()["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![0, 1, 2]);
    }

    #[test]
    fn high_priority_bypasses_batching() {
        let transport = RecordingTransport::new(0);
        let dispatcher =
            NotificationDispatcher::new(transport.clone(), config(100), MessageFormat::Json);
        dispatcher.enqueue("s1", "c1", change(0), Priority::Normal);
        dispatcher.enqueue("s1", "c1", change(1), Priority::High);

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1, "only the high-priority send went out");
        assert_eq!(sent[0].1.len(), 1);
        drop(sent);
        assert_eq!(dispatcher.stats().queued, 1);
    }

    #[test]
    fn age_flush_drains_old_batches() {
        let transport = RecordingTransport::new(0);
        let dispatcher =
            NotificationDispatcher::new(transport.clone(), config(100), MessageFormat::Json);
        dispatcher.enqueue("s1", "c1", change(0), Priority::Normal);
        dispatcher.flush_due();
        assert!(transport.sent.lock().is_empty(), "batch is still young");

        std::thread::sleep(Duration::from_millis(60));
        dispatcher.flush_due();
        assert_eq!(transport.sent.lock().len(), 1);
    }

    #[test]
    fn retries_then_succeeds() {
        let transport = RecordingTransport::new(2);
        let dispatcher =
            NotificationDispatcher::new(transport.clone(), config(1), MessageFormat::Json);
        dispatcher.enqueue("s1", "c1", change(0), Priority::Normal);
        assert_eq!(transport.sent.lock().len(), 1);
        assert_eq!(dispatcher.stats().delivered, 1);
        assert_eq!(dispatcher.stats().failed, 0);
    }

    #[test]
    fn exhausted_retries_drop_the_batch() {
        let transport = RecordingTransport::new(100);
        let dispatcher =
            NotificationDispatcher::new(transport.clone(), config(1), MessageFormat::Json);
        dispatcher.enqueue("s1", "c1", change(0), Priority::Normal);
        assert!(transport.sent.lock().is_empty());
        assert_eq!(dispatcher.stats().failed, 1);
    }

    #[test]
    fn connection_drop_discards_queue() {
        let transport = RecordingTransport::new(0);
        let dispatcher =
            NotificationDispatcher::new(transport.clone(), config(100), MessageFormat::Json);
        dispatcher.enqueue("s1", "c1", change(0), Priority::Normal);
        dispatcher.enqueue("s1", "c1", change(1), Priority::Normal);
        dispatcher.drop_connection("c1");
        assert_eq!(dispatcher.stats().dropped, 2);
        dispatcher.flush_all();
        assert!(transport.sent.lock().is_empty());
    }

    #[test]
    fn flush_all_fans_out_per_connection() {
        let transport = RecordingTransport::new(0);
        let dispatcher =
            NotificationDispatcher::new(transport.clone(), config(100), MessageFormat::Json);
        dispatcher.enqueue("s1", "c1", change(0), Priority::Normal);
        dispatcher.enqueue("s2", "c2", change(1), Priority::Normal);
        dispatcher.flush_all();
        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 2);
    }
}
