//! Subscription engine
//!
//! Owns subscriptions and their three indexes (by id, by user, by
//! connection), routes committed changes through the filter to the
//! dispatcher, and runs connection-close cascades and maintenance.
//!
//! `publish_change` never returns an error to the caller: one
//! subscription's failure is logged and counted, the rest of the fan-out
//! proceeds. The engine implements `ChangeSink`, so collections publish
//! into it directly.

use crate::config::SubscriptionsConfig;
use crate::connection::ConnectionRegistry;
use crate::dispatcher::{NotificationDispatcher, Priority};
use crate::filter::{matches_subscription_scope, ChangeFilter};
use crate::query::{CustomEvaluator, ParsedQuery, QueryParser, SubscriptionQuery};
use folio_core::{
    now_millis, AuditEvent, AuditLogger, AuthAction, Authorization, ChangeRecord, ChangeSink,
    Document, FolioError, FolioResult, IntervalTimer, PerformanceMonitor, ResourceDescriptor,
    TimerGuard,
};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Subscription lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Receiving changes
    Active,
    /// Retained but not receiving
    Paused,
    /// Terminal
    Closed,
}

/// One live subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Subscription id
    pub id: String,
    /// Owning user
    pub user_id: String,
    /// The validated query
    pub query: ParsedQuery,
    /// Connection notifications flow through
    pub connection_id: String,
    /// Lifecycle state
    pub status: SubscriptionStatus,
    /// Epoch ms at creation
    pub created_at: u64,
    /// Epoch ms of last routed change
    pub last_activity: u64,
    /// Caller-supplied metadata
    pub metadata: Document,
}

/// Resolves a user id to the user document consulted by user filters.
pub trait UserDirectory: Send + Sync {
    /// The user document, if known.
    fn resolve(&self, user_id: &str) -> Option<Document>;
}

/// Supplies the documents for `include_initial_data` subscriptions.
pub trait InitialDataProvider: Send + Sync {
    /// Current documents matching the query's scope.
    fn fetch(&self, query: &ParsedQuery) -> Vec<Document>;
}

/// Engine statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Live subscriptions
    pub subscriptions: usize,
    /// Registered connections
    pub connections: usize,
    /// Changes routed since start
    pub changes_routed: u64,
    /// Per-subscription routing errors
    pub routing_errors: u64,
    /// Cached permission decisions
    pub permission_cache_entries: usize,
}

/// The subscription engine.
pub struct SubscriptionEngine {
    config: SubscriptionsConfig,
    running: AtomicBool,
    parser: QueryParser,
    filter: ChangeFilter,
    auth: Arc<dyn Authorization>,
    audit: Arc<dyn AuditLogger>,
    connections: Arc<ConnectionRegistry>,
    dispatcher: Arc<NotificationDispatcher>,
    user_directory: Option<Arc<dyn UserDirectory>>,
    initial_data: Option<Arc<dyn InitialDataProvider>>,
    subscriptions: RwLock<FxHashMap<String, Subscription>>,
    by_user: RwLock<FxHashMap<String, HashSet<String>>>,
    by_connection: RwLock<FxHashMap<String, HashSet<String>>>,
    monitor: Arc<PerformanceMonitor>,
}

impl SubscriptionEngine {
    /// Build an engine over a connection registry and dispatcher.
    pub fn new(
        config: SubscriptionsConfig,
        auth: Arc<dyn Authorization>,
        audit: Arc<dyn AuditLogger>,
        connections: Arc<ConnectionRegistry>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Arc<Self> {
        let monitor = Arc::new(PerformanceMonitor::default());
        let filter = ChangeFilter::new(
            Arc::clone(&auth),
            config.filtering.clone(),
            Arc::clone(&monitor),
        );
        Arc::new(SubscriptionEngine {
            parser: QueryParser::new(config.query.clone()),
            filter,
            config,
            running: AtomicBool::new(false),
            auth,
            audit,
            connections,
            dispatcher,
            user_directory: None,
            initial_data: None,
            subscriptions: RwLock::new(FxHashMap::default()),
            by_user: RwLock::new(FxHashMap::default()),
            by_connection: RwLock::new(FxHashMap::default()),
            monitor,
        })
    }

    /// Attach a user directory (required for user filters to see data).
    pub fn with_user_directory(mut self: Arc<Self>, directory: Arc<dyn UserDirectory>) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .expect("configure the engine before sharing it")
            .user_directory = Some(directory);
        self
    }

    /// Attach an initial-data provider.
    pub fn with_initial_data(
        mut self: Arc<Self>,
        provider: Arc<dyn InitialDataProvider>,
    ) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .expect("configure the engine before sharing it")
            .initial_data = Some(provider);
        self
    }

    /// Start accepting subscriptions and changes.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Stop: new operations fail with `EngineNotRunning`; queued
    /// notifications are flushed.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.dispatcher.flush_all();
    }

    /// Whether the engine is accepting work.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn require_running(&self) -> FolioResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(FolioError::EngineNotRunning)
        }
    }

    /// The connection registry this engine observes.
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create a subscription.
    pub fn subscribe(
        &self,
        user_id: &str,
        query: SubscriptionQuery,
        connection_id: &str,
        metadata: Option<Document>,
    ) -> FolioResult<Subscription> {
        self.subscribe_with_custom(user_id, query, connection_id, metadata, Vec::new())
    }

    /// Create a subscription with custom filter evaluators attached.
    pub fn subscribe_with_custom(
        &self,
        user_id: &str,
        query: SubscriptionQuery,
        connection_id: &str,
        metadata: Option<Document>,
        evaluators: Vec<CustomEvaluator>,
    ) -> FolioResult<Subscription> {
        let started = Instant::now();
        let result =
            self.subscribe_inner(user_id, query, connection_id, metadata, evaluators, started);
        match &result {
            Ok(subscription) => {
                self.audit.log(AuditEvent::new(
                    "subscription_created",
                    Some(user_id.to_string()),
                    serde_json::json!({
                        "subscription_id": subscription.id,
                        "connection_id": connection_id,
                        "query_id": subscription.query.query_id.to_string(),
                        "latency_us": started.elapsed().as_micros() as u64,
                    }),
                ));
            }
            Err(e) => {
                self.audit.log(AuditEvent::new(
                    "subscription_creation_failed",
                    Some(user_id.to_string()),
                    serde_json::json!({
                        "connection_id": connection_id,
                        "error": e.to_string(),
                        "latency_us": started.elapsed().as_micros() as u64,
                    }),
                ));
            }
        }
        result
    }

    fn subscribe_inner(
        &self,
        user_id: &str,
        query: SubscriptionQuery,
        connection_id: &str,
        metadata: Option<Document>,
        evaluators: Vec<CustomEvaluator>,
        started: Instant,
    ) -> FolioResult<Subscription> {
        self.require_running()?;
        let parsed = self.parser.parse_with_custom(&query, evaluators)?;
        self.authorize_subscribe(user_id, &parsed)?;

        {
            let subscriptions = self.subscriptions.read();
            if subscriptions.len() >= self.config.limits.max_subscriptions_total {
                return Err(FolioError::exhausted("subscriptions"));
            }
        }
        {
            let by_user = self.by_user.read();
            let per_user = by_user.get(user_id).map_or(0, |s| s.len());
            if per_user >= self.config.limits.max_subscriptions_per_user {
                return Err(FolioError::exhausted(format!(
                    "subscriptions for user {}",
                    user_id
                )));
            }
        }

        if !self.connections.is_open(connection_id) {
            return Err(FolioError::not_found(format!(
                "connection {}",
                connection_id
            )));
        }

        let subscription = Subscription {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            query: parsed,
            connection_id: connection_id.to_string(),
            status: SubscriptionStatus::Active,
            created_at: now_millis(),
            last_activity: now_millis(),
            metadata: metadata.unwrap_or_else(|| serde_json::json!({})),
        };

        self.connections
            .attach_subscription(connection_id, &subscription.id)?;
        self.index_subscription(&subscription);

        if subscription.query.include_initial_data {
            self.send_initial_data(&subscription);
        }

        self.monitor.incr("subscriptions_created");
        self.monitor.record_latency(started.elapsed());
        debug!(subscription = %subscription.id, user = %user_id, "subscribed");
        Ok(subscription)
    }

    fn authorize_subscribe(&self, user_id: &str, query: &ParsedQuery) -> FolioResult<()> {
        let resource = ResourceDescriptor {
            resource_type: query.resource_type,
            database: query.database.clone(),
            collection: query.collection.clone(),
            document_id: query.document_id.clone(),
            data: None,
        };
        let decision = self
            .auth
            .check_permission(user_id, &resource, AuthAction::Subscribe);
        if !decision.allowed {
            return Err(FolioError::denied(
                decision.reason.unwrap_or_else(|| "subscribe denied".into()),
            ));
        }
        Ok(())
    }

    fn index_subscription(&self, subscription: &Subscription) {
        self.subscriptions
            .write()
            .insert(subscription.id.clone(), subscription.clone());
        self.by_user
            .write()
            .entry(subscription.user_id.clone())
            .or_default()
            .insert(subscription.id.clone());
        self.by_connection
            .write()
            .entry(subscription.connection_id.clone())
            .or_default()
            .insert(subscription.id.clone());
    }

    fn send_initial_data(&self, subscription: &Subscription) {
        let Some(provider) = &self.initial_data else {
            return;
        };
        let documents = provider.fetch(&subscription.query);
        let change = ChangeRecord {
            id: Uuid::new_v4().to_string(),
            resource_type: subscription.query.resource_type,
            database: subscription
                .query
                .database
                .clone()
                .unwrap_or_else(|| "default".into()),
            collection: subscription.query.collection.clone().unwrap_or_default(),
            document_id: None,
            operation: folio_core::ChangeOperation::Insert,
            data: Some(serde_json::json!({ "initial_data": documents })),
            previous_data: None,
            affected_fields: None,
            timestamp: now_millis(),
            user_id: Some(subscription.user_id.clone()),
            transaction_id: None,
        };
        self.dispatcher.enqueue(
            &subscription.id,
            &subscription.connection_id,
            change,
            Priority::High,
        );
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, subscription_id: &str) -> FolioResult<()> {
        let subscription = self
            .subscriptions
            .write()
            .remove(subscription_id)
            .ok_or_else(|| FolioError::not_found(format!("subscription {}", subscription_id)))?;
        if let Some(set) = self.by_user.write().get_mut(&subscription.user_id) {
            set.remove(subscription_id);
        }
        if let Some(set) = self.by_connection.write().get_mut(&subscription.connection_id) {
            set.remove(subscription_id);
        }
        self.connections
            .detach_subscription(&subscription.connection_id, subscription_id);
        self.monitor.incr("subscriptions_removed");
        Ok(())
    }

    /// Pause delivery for a subscription.
    pub fn pause(&self, subscription_id: &str) -> FolioResult<()> {
        self.set_status(subscription_id, SubscriptionStatus::Paused)
    }

    /// Resume delivery for a subscription.
    pub fn resume(&self, subscription_id: &str) -> FolioResult<()> {
        self.set_status(subscription_id, SubscriptionStatus::Active)
    }

    fn set_status(&self, subscription_id: &str, status: SubscriptionStatus) -> FolioResult<()> {
        let mut subscriptions = self.subscriptions.write();
        let subscription = subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| FolioError::not_found(format!("subscription {}", subscription_id)))?;
        subscription.status = status;
        Ok(())
    }

    /// Re-parse, re-authorize, and replace a subscription's query.
    pub fn update_subscription(
        &self,
        subscription_id: &str,
        query: SubscriptionQuery,
    ) -> FolioResult<Subscription> {
        self.require_running()?;
        let user_id = {
            let subscriptions = self.subscriptions.read();
            subscriptions
                .get(subscription_id)
                .ok_or_else(|| {
                    FolioError::not_found(format!("subscription {}", subscription_id))
                })?
                .user_id
                .clone()
        };
        let parsed = self.parser.parse(&query)?;
        self.authorize_subscribe(&user_id, &parsed)?;

        let mut subscriptions = self.subscriptions.write();
        let subscription = subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| FolioError::not_found(format!("subscription {}", subscription_id)))?;
        subscription.query = parsed;
        subscription.last_activity = now_millis();
        Ok(subscription.clone())
    }

    /// Fetch a subscription snapshot.
    pub fn get(&self, subscription_id: &str) -> Option<Subscription> {
        self.subscriptions.read().get(subscription_id).cloned()
    }

    /// Subscriptions owned by a user.
    pub fn for_user(&self, user_id: &str) -> Vec<Subscription> {
        let ids = self.by_user.read().get(user_id).cloned().unwrap_or_default();
        let subscriptions = self.subscriptions.read();
        ids.iter()
            .filter_map(|id| subscriptions.get(id).cloned())
            .collect()
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Route one committed change. Never errors: per-subscription failures
    /// are counted and skipped.
    pub fn publish_change(&self, change: &ChangeRecord) {
        if !self.is_running() {
            self.monitor.incr("changes_dropped_not_running");
            return;
        }
        let candidates: Vec<Subscription> = {
            let subscriptions = self.subscriptions.read();
            subscriptions
                .values()
                .filter(|s| s.status == SubscriptionStatus::Active)
                .filter(|s| matches_subscription_scope(change, &s.query))
                .cloned()
                .collect()
        };

        for subscription in candidates {
            // per-subscription throttle: changes landing inside the window
            // are skipped, not deferred
            if subscription.query.throttle_ms > 0
                && now_millis().saturating_sub(subscription.last_activity)
                    < subscription.query.throttle_ms
            {
                self.monitor.incr("changes_throttled");
                continue;
            }
            let user_doc = self
                .user_directory
                .as_ref()
                .and_then(|d| d.resolve(&subscription.user_id));
            match self.filter.evaluate(
                change,
                &subscription.query,
                &subscription.user_id,
                user_doc.as_ref(),
            ) {
                Ok(true) => {
                    let mut outgoing = change.clone();
                    self.filter.redact(&mut outgoing, &subscription.user_id);
                    let metadata = subscription
                        .query
                        .include_metadata
                        .then(|| subscription.metadata.clone());
                    self.dispatcher.enqueue_with_metadata(
                        &subscription.id,
                        &subscription.connection_id,
                        outgoing,
                        Priority::Normal,
                        metadata,
                    );
                    if let Some(sub) = self.subscriptions.write().get_mut(&subscription.id) {
                        sub.last_activity = now_millis();
                    }
                    self.connections.touch(&subscription.connection_id);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        subscription = %subscription.id,
                        error = %e,
                        "change routing failed for one subscription"
                    );
                    self.monitor.incr("routing_errors");
                }
            }
        }
        self.monitor.incr("changes_routed");
    }

    /// Route a batch, processing it in dispatcher-sized slices.
    pub fn publish_changes(&self, changes: Vec<ChangeRecord>) {
        let slice = self.config.notifications.batch_size.max(1);
        for window in changes.chunks(slice) {
            for change in window {
                self.publish_change(change);
            }
        }
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Connection closed: unsubscribe everything bound to it, tolerating
    /// individual failures, and drop its queued notifications.
    pub fn handle_connection_close(&self, connection_id: &str) {
        let mut subscription_ids: Vec<String> = self
            .by_connection
            .write()
            .remove(connection_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        subscription_ids.extend(self.connections.close(connection_id));
        subscription_ids.sort();
        subscription_ids.dedup();

        for subscription_id in subscription_ids {
            if let Err(e) = self.unsubscribe(&subscription_id) {
                if !e.is_not_found() {
                    warn!(subscription = %subscription_id, error = %e, "close cascade failed");
                }
            }
        }
        self.dispatcher.drop_connection(connection_id);
        self.connections.remove_closed();
    }

    /// Record connection activity.
    pub fn update_connection_activity(&self, connection_id: &str) {
        self.connections.touch(connection_id);
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Drop orphaned (connection gone) and idle-expired subscriptions.
    pub fn run_maintenance(&self) -> usize {
        let timeout = self.config.connections.connection_timeout_ms;
        let now = now_millis();
        let stale: Vec<String> = {
            let subscriptions = self.subscriptions.read();
            subscriptions
                .values()
                .filter(|s| {
                    !self.connections.is_open(&s.connection_id)
                        || now.saturating_sub(s.last_activity) > timeout
                })
                .map(|s| s.id.clone())
                .collect()
        };
        let count = stale.len();
        for subscription_id in stale {
            let _ = self.unsubscribe(&subscription_id);
        }
        if count > 0 {
            debug!(count, "maintenance dropped subscriptions");
        }
        count
    }

    /// Run maintenance on a timer (60s tick by default).
    pub fn start_maintenance(self: &Arc<Self>, timer: &dyn IntervalTimer) -> TimerGuard {
        let period = Duration::from_millis(self.config.connections.cleanup_interval_ms.max(10));
        let weak = Arc::downgrade(self);
        timer.every(
            period,
            Box::new(move || {
                if let Some(engine) = weak.upgrade() {
                    engine.run_maintenance();
                }
            }),
        )
    }

    /// Engine statistics.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            subscriptions: self.subscriptions.read().len(),
            connections: self.connections.len(),
            changes_routed: self.monitor.counter("changes_routed"),
            routing_errors: self.monitor.counter("routing_errors"),
            permission_cache_entries: self.filter.cache_len(),
        }
    }
}

impl ChangeSink for SubscriptionEngine {
    fn publish(&self, change: ChangeRecord) {
        self.publish_change(&change);
    }

    fn publish_batch(&self, changes: Vec<ChangeRecord>) {
        self.publish_changes(changes);
    }
}
