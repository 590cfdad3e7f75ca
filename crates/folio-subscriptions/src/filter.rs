//! Change filtering
//!
//! Three stages, cheapest first: scope match (could this change ever
//! interest this query), filter application in optimized order, then the
//! per-user permission check through the injected authorization
//! capability. Permission decisions are cached in a bounded LRU keyed by
//! `(user, collection, document, operation)` with a TTL; the operation
//! is part of the key, so decisions for different operations never share
//! an entry.
//!
//! Everything returns explicit results; failures increment monitor
//! counters and never abort the caller's fan-out.

use crate::config::FilteringConfig;
use crate::query::{ParsedFilter, ParsedQuery};
use folio_core::{
    get_path, AuthAction, Authorization, ChangeOperation, ChangeRecord, Document,
    FolioResult, PerformanceMonitor, ResourceType, ResourceDescriptor,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cheap pre-filter: can this change ever interest this query?
pub fn matches_subscription_scope(change: &ChangeRecord, query: &ParsedQuery) -> bool {
    if let Some(database) = &query.database {
        if change.database != *database {
            return false;
        }
    }
    match query.resource_type {
        ResourceType::Database => true,
        ResourceType::Collection => query.collection.as_deref() == Some(&change.collection),
        ResourceType::Document => {
            query.collection.as_deref() == Some(&change.collection)
                && query.document_id == change.document_id
        }
        ResourceType::Field => {
            query.collection.as_deref() == Some(&change.collection)
                && query.document_id == change.document_id
                && match (&query.field_path, &change.affected_fields) {
                    (Some(path), Some(fields)) => fields.iter().any(|f| f == path),
                    _ => false,
                }
        }
    }
}

type CacheKey = (String, String, String, ChangeOperation);

struct CacheEntry {
    allowed: bool,
    inserted: Instant,
    last_used: u64,
}

/// Bounded LRU with TTL for permission decisions.
///
/// Recency is tracked with a logical clock stamped onto each entry, so
/// the map itself is the only storage: hits bump the stamp in place and
/// eviction scans for the smallest stamp once capacity is exceeded.
/// Eviction is O(capacity), which the small cache sizes here amortize.
struct PermissionCache {
    entries: FxHashMap<CacheKey, CacheEntry>,
    clock: u64,
    ttl: Duration,
    capacity: usize,
}

impl PermissionCache {
    fn new(ttl: Duration, capacity: usize) -> Self {
        PermissionCache {
            entries: FxHashMap::default(),
            clock: 0,
            ttl,
            capacity,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn get(&mut self, key: &CacheKey) -> Option<bool> {
        let now = self.tick();
        let entry = self.entries.get_mut(key)?;
        if entry.inserted.elapsed() > self.ttl {
            self.entries.remove(key);
            return None;
        }
        entry.last_used = now;
        Some(entry.allowed)
    }

    fn put(&mut self, key: CacheKey, allowed: bool) {
        let now = self.tick();
        self.entries.insert(
            key,
            CacheEntry {
                allowed,
                inserted: Instant::now(),
                last_used: now,
            },
        );
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Applies a parsed query and the permission check to change records.
pub struct ChangeFilter {
    auth: Arc<dyn Authorization>,
    config: FilteringConfig,
    cache: Mutex<PermissionCache>,
    monitor: Arc<PerformanceMonitor>,
}

impl ChangeFilter {
    /// Filter bound to an authorization capability.
    pub fn new(
        auth: Arc<dyn Authorization>,
        config: FilteringConfig,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        let cache = PermissionCache::new(
            Duration::from_millis(config.cache_ttl_ms),
            config.max_cache_size,
        );
        ChangeFilter {
            auth,
            config,
            cache: Mutex::new(cache),
            monitor,
        }
    }

    /// Full evaluation: scope, filters in order, then permission.
    pub fn evaluate(
        &self,
        change: &ChangeRecord,
        query: &ParsedQuery,
        user_id: &str,
        user_doc: Option<&Document>,
    ) -> FolioResult<bool> {
        if !matches_subscription_scope(change, query) {
            return Ok(false);
        }
        for filter in &query.filters {
            if !apply_filter(filter, change, user_doc) {
                return Ok(false);
            }
        }
        if !self.check_permission_cached(user_id, change) {
            self.monitor.incr("permission_denied");
            return Ok(false);
        }
        Ok(true)
    }

    /// Field-stripping hook. The initial policy is permissive: changes
    /// pass through untouched.
    pub fn redact(&self, _change: &mut ChangeRecord, _user_id: &str) {}

    fn check_permission_cached(&self, user_id: &str, change: &ChangeRecord) -> bool {
        let key: CacheKey = (
            user_id.to_string(),
            change.collection.clone(),
            change.document_id.clone().unwrap_or_default(),
            change.operation,
        );
        if self.config.enable_caching {
            if let Some(allowed) = self.cache.lock().get(&key) {
                self.monitor.incr("permission_cache_hits");
                return allowed;
            }
        }

        let resource = ResourceDescriptor {
            resource_type: ResourceType::Document,
            database: Some(change.database.clone()),
            collection: Some(change.collection.clone()),
            document_id: change.document_id.clone(),
            data: change.data.clone(),
        };
        let decision = self
            .auth
            .check_permission(user_id, &resource, AuthAction::Read);
        if self.config.enable_caching {
            self.cache.lock().put(key, decision.allowed);
        }
        decision.allowed
    }

    /// Number of cached decisions (for stats).
    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }
}

fn apply_filter(filter: &ParsedFilter, change: &ChangeRecord, user_doc: Option<&Document>) -> bool {
    match filter {
        ParsedFilter::Field {
            field,
            op,
            value,
            case_sensitive,
            regex,
        } => {
            let actual = change.data.as_ref().and_then(|data| get_path(data, field));
            apply_field_op(*op, actual, value, *case_sensitive, regex.as_ref())
        }
        ParsedFilter::User {
            user_field,
            op,
            value,
        } => {
            let actual = user_doc.and_then(|doc| get_path(doc, user_field));
            apply_user_op(*op, actual, value)
        }
        ParsedFilter::Custom { evaluator } => evaluator(change, user_doc),
    }
}

fn fold(value: &serde_json::Value, case_sensitive: bool) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) if !case_sensitive => {
            serde_json::Value::String(s.to_lowercase())
        }
        other => other.clone(),
    }
}

fn numeric_cmp(a: &serde_json::Value, b: &serde_json::Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (serde_json::Value::Number(x), serde_json::Value::Number(y)) => {
            x.as_f64().partial_cmp(&y.as_f64())
        }
        (serde_json::Value::String(x), serde_json::Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn apply_field_op(
    op: crate::query::FieldOp,
    actual: Option<&serde_json::Value>,
    expected: &serde_json::Value,
    case_sensitive: bool,
    regex: Option<&regex::Regex>,
) -> bool {
    use crate::query::FieldOp;
    let null = serde_json::Value::Null;
    let actual = actual.unwrap_or(&null);
    match op {
        FieldOp::Eq => fold(actual, case_sensitive) == fold(expected, case_sensitive),
        FieldOp::Ne => fold(actual, case_sensitive) != fold(expected, case_sensitive),
        FieldOp::Gt => {
            numeric_cmp(&fold(actual, case_sensitive), &fold(expected, case_sensitive))
                .map_or(false, |o| o.is_gt())
        }
        FieldOp::Gte => {
            numeric_cmp(&fold(actual, case_sensitive), &fold(expected, case_sensitive))
                .map_or(false, |o| o.is_ge())
        }
        FieldOp::Lt => {
            numeric_cmp(&fold(actual, case_sensitive), &fold(expected, case_sensitive))
                .map_or(false, |o| o.is_lt())
        }
        FieldOp::Lte => {
            numeric_cmp(&fold(actual, case_sensitive), &fold(expected, case_sensitive))
                .map_or(false, |o| o.is_le())
        }
        FieldOp::In => expected.as_array().map_or(false, |candidates| {
            candidates
                .iter()
                .any(|c| fold(c, case_sensitive) == fold(actual, case_sensitive))
        }),
        FieldOp::Nin => expected.as_array().map_or(false, |candidates| {
            !candidates
                .iter()
                .any(|c| fold(c, case_sensitive) == fold(actual, case_sensitive))
        }),
        FieldOp::Regex => match (regex, actual.as_str()) {
            (Some(regex), Some(text)) => regex.is_match(text),
            _ => false,
        },
    }
}

fn apply_user_op(
    op: crate::query::UserOp,
    actual: Option<&serde_json::Value>,
    expected: &serde_json::Value,
) -> bool {
    use crate::query::UserOp;
    let null = serde_json::Value::Null;
    let actual = actual.unwrap_or(&null);
    match op {
        UserOp::Eq => actual == expected,
        UserOp::Ne => actual != expected,
        // array-valued user fields use set intersection / disjointness
        UserOp::In => match (actual.as_array(), expected.as_array()) {
            (Some(have), Some(want)) => have.iter().any(|v| want.contains(v)),
            (None, Some(want)) => want.contains(actual),
            _ => false,
        },
        UserOp::Nin => match (actual.as_array(), expected.as_array()) {
            (Some(have), Some(want)) => !have.iter().any(|v| want.contains(v)),
            (None, Some(want)) => !want.contains(actual),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryConfig;
    use crate::query::{FieldOp, QueryParser, SubscriptionQuery, UserOp};
    use folio_core::{AllowAll, PermissionDecision};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn parse(query: SubscriptionQuery) -> ParsedQuery {
        QueryParser::new(QueryConfig::default()).parse(&query).unwrap()
    }

    fn insert_change(collection: &str, data: serde_json::Value) -> ChangeRecord {
        ChangeRecord::insert("default", collection, Some("1".into()), data)
    }

    fn filter() -> ChangeFilter {
        ChangeFilter::new(
            Arc::new(AllowAll),
            FilteringConfig::default(),
            Arc::new(PerformanceMonitor::default()),
        )
    }

    #[test]
    fn scope_gates_collection_and_document() {
        let query = parse(SubscriptionQuery::collection("users"));
        assert!(matches_subscription_scope(
            &insert_change("users", json!({})),
            &query
        ));
        assert!(!matches_subscription_scope(
            &insert_change("orders", json!({})),
            &query
        ));

        let mut doc_query = SubscriptionQuery::collection("users");
        doc_query.document_id = Some("1".into());
        let doc_query = parse(doc_query);
        assert!(matches_subscription_scope(
            &insert_change("users", json!({})),
            &doc_query
        ));
        let mut other = insert_change("users", json!({}));
        other.document_id = Some("2".into());
        assert!(!matches_subscription_scope(&other, &doc_query));
    }

    #[test]
    fn field_scope_requires_affected_field() {
        let mut raw = SubscriptionQuery::collection("users");
        raw.document_id = Some("1".into());
        raw.field_path = Some("status".into());
        let query = parse(raw);

        // inserts carry no affected_fields: not field-scoped matches
        assert!(!matches_subscription_scope(
            &insert_change("users", json!({"status": "x"})),
            &query
        ));

        let update = ChangeRecord::update(
            "default",
            "users",
            Some("1".into()),
            json!({"status": "a"}),
            json!({"status": "b"}),
        );
        assert!(matches_subscription_scope(&update, &query));

        let unrelated = ChangeRecord::update(
            "default",
            "users",
            Some("1".into()),
            json!({"name": "a"}),
            json!({"name": "b"}),
        );
        assert!(!matches_subscription_scope(&unrelated, &query));
    }

    #[test]
    fn field_filters_match_subscription_routing() {
        let query = parse(SubscriptionQuery::collection("users").with_field_filter(
            "status",
            FieldOp::Eq,
            json!("active"),
        ));
        let filter = filter();

        let active = insert_change("users", json!({"id": 1, "status": "active"}));
        let inactive = insert_change("users", json!({"id": 2, "status": "inactive"}));
        assert!(filter.evaluate(&active, &query, "u1", None).unwrap());
        assert!(!filter.evaluate(&inactive, &query, "u1", None).unwrap());
    }

    #[test]
    fn comparison_and_membership_ops() {
        let change = insert_change("users", json!({"age": 21, "tag": "Alpha"}));
        let filter = filter();

        let gte = parse(SubscriptionQuery::collection("users").with_field_filter(
            "age",
            FieldOp::Gte,
            json!(18),
        ));
        assert!(filter.evaluate(&change, &gte, "u", None).unwrap());

        let lt = parse(SubscriptionQuery::collection("users").with_field_filter(
            "age",
            FieldOp::Lt,
            json!(21),
        ));
        assert!(!filter.evaluate(&change, &lt, "u", None).unwrap());

        let among = parse(SubscriptionQuery::collection("users").with_field_filter(
            "tag",
            FieldOp::In,
            json!(["Alpha", "Beta"]),
        ));
        assert!(filter.evaluate(&change, &among, "u", None).unwrap());

        let nin = parse(SubscriptionQuery::collection("users").with_field_filter(
            "tag",
            FieldOp::Nin,
            json!(["Alpha"]),
        ));
        assert!(!filter.evaluate(&change, &nin, "u", None).unwrap());
    }

    #[test]
    fn case_insensitive_string_compare() {
        let mut raw = SubscriptionQuery::collection("users");
        raw.filters.push(crate::query::FilterSpec::Field {
            field: "tag".into(),
            op: FieldOp::Eq,
            value: json!("alpha"),
            case_sensitive: false,
        });
        let query = parse(raw);
        let change = insert_change("users", json!({"tag": "ALPHA"}));
        assert!(filter().evaluate(&change, &query, "u", None).unwrap());
    }

    #[test]
    fn regex_filter() {
        let query = parse(SubscriptionQuery::collection("users").with_field_filter(
            "email",
            FieldOp::Regex,
            json!("@example\\.com$"),
        ));
        let filter = filter();
        let hit = insert_change("users", json!({"email": "a@example.com"}));
        let miss = insert_change("users", json!({"email": "a@other.org"}));
        assert!(filter.evaluate(&hit, &query, "u", None).unwrap());
        assert!(!filter.evaluate(&miss, &query, "u", None).unwrap());
    }

    #[test]
    fn user_filters_use_set_semantics_for_arrays() {
        let mut raw = SubscriptionQuery::collection("users");
        raw.filters.push(crate::query::FilterSpec::User {
            user_field: "roles".into(),
            op: UserOp::In,
            value: json!(["admin", "ops"]),
        });
        let query = parse(raw);
        let change = insert_change("users", json!({}));
        let filter = filter();

        let admin = json!({"roles": ["dev", "admin"]});
        let guest = json!({"roles": ["guest"]});
        assert!(filter.evaluate(&change, &query, "u", Some(&admin)).unwrap());
        assert!(!filter.evaluate(&change, &query, "u", Some(&guest)).unwrap());
    }

    /// Counts authorization calls so cache behavior is observable.
    struct CountingAuth {
        calls: AtomicUsize,
        allow: bool,
    }

    impl Authorization for CountingAuth {
        fn check_permission(
            &self,
            _user: &str,
            _resource: &ResourceDescriptor,
            _action: AuthAction,
        ) -> PermissionDecision {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.allow {
                PermissionDecision::allow()
            } else {
                PermissionDecision::deny("no")
            }
        }
    }

    #[test]
    fn permission_decisions_are_cached_per_operation() {
        let auth = Arc::new(CountingAuth {
            calls: AtomicUsize::new(0),
            allow: true,
        });
        let filter = ChangeFilter::new(
            auth.clone(),
            FilteringConfig::default(),
            Arc::new(PerformanceMonitor::default()),
        );
        let query = parse(SubscriptionQuery::collection("users"));

        let change = insert_change("users", json!({"id": 1}));
        filter.evaluate(&change, &query, "u1", None).unwrap();
        filter.evaluate(&change, &query, "u1", None).unwrap();
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);

        // a delete on the same document is a different cache key
        let delete = ChangeRecord::delete("default", "users", Some("1".into()), json!({"id": 1}));
        filter.evaluate(&delete, &query, "u1", None).unwrap();
        assert_eq!(auth.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cache_stays_bounded_under_repeated_hits() {
        let auth = Arc::new(CountingAuth {
            calls: AtomicUsize::new(0),
            allow: true,
        });
        let mut config = FilteringConfig::default();
        config.max_cache_size = 2;
        let filter = ChangeFilter::new(
            auth.clone(),
            config,
            Arc::new(PerformanceMonitor::default()),
        );
        let query = parse(SubscriptionQuery::collection("users"));

        // warm the cache, then hammer the same keys: size must not move
        for id in 0..2 {
            let change = insert_change_for(id);
            filter.evaluate(&change, &query, "u1", None).unwrap();
        }
        for _ in 0..1_000 {
            for id in 0..2 {
                let change = insert_change_for(id);
                filter.evaluate(&change, &query, "u1", None).unwrap();
            }
        }
        assert_eq!(filter.cache_len(), 2);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 2);

        // a third key evicts the least-recently-used entry, never more
        let change = insert_change_for(2);
        filter.evaluate(&change, &query, "u1", None).unwrap();
        assert_eq!(filter.cache_len(), 2);
    }

    #[test]
    fn hits_refresh_lru_recency() {
        let auth = Arc::new(CountingAuth {
            calls: AtomicUsize::new(0),
            allow: true,
        });
        let mut config = FilteringConfig::default();
        config.max_cache_size = 2;
        let filter = ChangeFilter::new(
            auth.clone(),
            config,
            Arc::new(PerformanceMonitor::default()),
        );
        let query = parse(SubscriptionQuery::collection("users"));

        filter.evaluate(&insert_change_for(0), &query, "u1", None).unwrap();
        filter.evaluate(&insert_change_for(1), &query, "u1", None).unwrap();
        // touch document 0 so document 1 is now the oldest
        filter.evaluate(&insert_change_for(0), &query, "u1", None).unwrap();
        // inserting document 2 must evict document 1
        filter.evaluate(&insert_change_for(2), &query, "u1", None).unwrap();
        assert_eq!(auth.calls.load(Ordering::SeqCst), 3);

        // document 0 is still cached; document 1 needs a fresh check
        filter.evaluate(&insert_change_for(0), &query, "u1", None).unwrap();
        assert_eq!(auth.calls.load(Ordering::SeqCst), 3);
        filter.evaluate(&insert_change_for(1), &query, "u1", None).unwrap();
        assert_eq!(auth.calls.load(Ordering::SeqCst), 4);
    }

    fn insert_change_for(id: i64) -> ChangeRecord {
        ChangeRecord::insert("default", "users", Some(id.to_string()), json!({"id": id}))
    }

    #[test]
    fn denial_blocks_delivery() {
        let auth = Arc::new(CountingAuth {
            calls: AtomicUsize::new(0),
            allow: false,
        });
        let filter = ChangeFilter::new(
            auth,
            FilteringConfig::default(),
            Arc::new(PerformanceMonitor::default()),
        );
        let query = parse(SubscriptionQuery::collection("users"));
        let change = insert_change("users", json!({}));
        assert!(!filter.evaluate(&change, &query, "u1", None).unwrap());
    }
}
