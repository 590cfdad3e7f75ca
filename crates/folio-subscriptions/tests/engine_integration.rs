//! Subscription engine integration tests

use folio_core::{
    AllowAll, ChangeRecord, Document, FolioResult, NullAuditLogger, AuditEvent, AuditLogger,
};
use folio_subscriptions::{
    ConnectionRegistry, CustomEvaluator, FieldOp, FilterSpec, InitialDataProvider, MessageFormat,
    NotificationDispatcher, ParsedQuery, Protocol, SubscriptionEngine, SubscriptionQuery,
    SubscriptionsConfig, Transport, UserDirectory, UserOp,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

struct MemoryTransport {
    sent: Mutex<Vec<(String, Vec<serde_json::Value>)>>,
}

impl MemoryTransport {
    fn new() -> Arc<Self> {
        Arc::new(MemoryTransport {
            sent: Mutex::new(Vec::new()),
        })
    }

    fn notifications(&self) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .iter()
            .flat_map(|(_, batch)| batch.clone())
            .collect()
    }
}

impl Transport for MemoryTransport {
    fn send(&self, connection_id: &str, payload: &[u8]) -> FolioResult<()> {
        let batch: Vec<serde_json::Value> = serde_json::from_slice(payload).unwrap();
        self.sent
            .lock()
            .push((connection_id.to_string(), batch));
        Ok(())
    }
}

fn engine_with_config(
    transport: Arc<MemoryTransport>,
    mut config: SubscriptionsConfig,
) -> Arc<SubscriptionEngine> {
    config.notifications.batch_size = 1;
    let connections = Arc::new(ConnectionRegistry::new(config.connections.clone()));
    let dispatcher = NotificationDispatcher::new(
        transport,
        config.notifications.clone(),
        MessageFormat::Json,
    );
    let engine = SubscriptionEngine::new(
        config,
        Arc::new(AllowAll),
        Arc::new(NullAuditLogger),
        connections,
        dispatcher,
    );
    engine.start();
    engine
}

fn insert_change(collection: &str, data: serde_json::Value) -> ChangeRecord {
    let id = data
        .get("id")
        .and_then(|v| v.as_i64())
        .map(|v| v.to_string());
    ChangeRecord::insert("default", collection, id, data)
}

#[test]
fn initial_data_is_sent_on_subscribe() {
    struct FixedProvider;
    impl InitialDataProvider for FixedProvider {
        fn fetch(&self, _query: &ParsedQuery) -> Vec<Document> {
            vec![json!({"id": 1}), json!({"id": 2})]
        }
    }

    let transport = MemoryTransport::new();
    let engine = engine_with_config(transport.clone(), SubscriptionsConfig::default())
        .with_initial_data(Arc::new(FixedProvider));
    let connection = engine
        .connections()
        .open("u1", Protocol::Sse, json!({}))
        .unwrap();

    let mut query = SubscriptionQuery::collection("users");
    query.include_initial_data = true;
    engine.subscribe("u1", query, &connection, None).unwrap();

    let sent = transport.notifications();
    assert_eq!(sent.len(), 1);
    let initial = &sent[0]["change"]["data"]["initial_data"];
    assert_eq!(initial.as_array().unwrap().len(), 2);
}

#[test]
fn user_filters_consult_the_directory() {
    struct Directory;
    impl UserDirectory for Directory {
        fn resolve(&self, user_id: &str) -> Option<Document> {
            match user_id {
                "admin" => Some(json!({"roles": ["admin"]})),
                _ => Some(json!({"roles": ["guest"]})),
            }
        }
    }

    let transport = MemoryTransport::new();
    let engine = engine_with_config(transport.clone(), SubscriptionsConfig::default())
        .with_user_directory(Arc::new(Directory));

    for user in ["admin", "visitor"] {
        let connection = engine
            .connections()
            .open(user, Protocol::WebSocket, json!({}))
            .unwrap();
        let mut query = SubscriptionQuery::collection("users");
        query.filters.push(FilterSpec::User {
            user_field: "roles".into(),
            op: UserOp::In,
            value: json!(["admin"]),
        });
        engine.subscribe(user, query, &connection, None).unwrap();
    }

    engine.publish_change(&insert_change("users", json!({"id": 1})));

    // only the admin's subscription passed the user filter
    let sent = transport.notifications();
    assert_eq!(sent.len(), 1);
}

#[test]
fn custom_filter_end_to_end() {
    let transport = MemoryTransport::new();
    let engine = engine_with_config(transport.clone(), SubscriptionsConfig::default());
    let connection = engine
        .connections()
        .open("u1", Protocol::WebSocket, json!({}))
        .unwrap();

    let evaluator: CustomEvaluator = Arc::new(|change, _user| {
        change
            .data
            .as_ref()
            .and_then(|d| d.get("id"))
            .and_then(|v| v.as_i64())
            .map_or(false, |id| id % 2 == 0)
    });
    let mut query = SubscriptionQuery::collection("users");
    query.filters.push(FilterSpec::Custom);
    engine
        .subscribe_with_custom("u1", query, &connection, None, vec![evaluator])
        .unwrap();

    for id in 1..=4 {
        engine.publish_change(&insert_change("users", json!({"id": id})));
    }
    let ids: Vec<i64> = transport
        .notifications()
        .iter()
        .map(|n| n["change"]["data"]["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![2, 4]);
}

#[test]
fn throttle_skips_changes_inside_the_window() {
    let transport = MemoryTransport::new();
    let engine = engine_with_config(transport.clone(), SubscriptionsConfig::default());
    let connection = engine
        .connections()
        .open("u1", Protocol::WebSocket, json!({}))
        .unwrap();

    let mut query = SubscriptionQuery::collection("users");
    query.throttle_ms = Some(10_000);
    engine.subscribe("u1", query, &connection, None).unwrap();

    // the subscription was just created, so the first burst is throttled
    for id in 0..5 {
        engine.publish_change(&insert_change("users", json!({"id": id})));
    }
    assert!(transport.notifications().is_empty());
}

#[test]
fn metadata_is_included_when_requested() {
    let transport = MemoryTransport::new();
    let engine = engine_with_config(transport.clone(), SubscriptionsConfig::default());
    let connection = engine
        .connections()
        .open("u1", Protocol::WebSocket, json!({}))
        .unwrap();

    let mut query = SubscriptionQuery::collection("users");
    query.include_metadata = true;
    engine
        .subscribe("u1", query, &connection, Some(json!({"channel": "dashboard"})))
        .unwrap();

    engine.publish_change(&insert_change("users", json!({"id": 1})));
    let sent = transport.notifications();
    assert_eq!(sent[0]["metadata"]["channel"], json!("dashboard"));
}

#[test]
fn query_dedup_by_structural_hash() {
    let transport = MemoryTransport::new();
    let engine = engine_with_config(transport, SubscriptionsConfig::default());
    let connection = engine
        .connections()
        .open("u1", Protocol::WebSocket, json!({}))
        .unwrap();

    let query = SubscriptionQuery::collection("users").with_field_filter(
        "status",
        FieldOp::Eq,
        json!("active"),
    );
    let first = engine.subscribe("u1", query.clone(), &connection, None).unwrap();
    let second = engine.subscribe("u1", query, &connection, None).unwrap();

    // same structure, same query id; the engine leaves dedup policy to
    // the caller but exposes the hash
    assert_eq!(first.query.query_id, second.query.query_id);
    assert!(first.query.are_equivalent(&second.query));
}

#[test]
fn audit_trail_records_creation_outcomes() {
    #[derive(Default)]
    struct RecordingAudit {
        events: Mutex<Vec<AuditEvent>>,
    }
    impl AuditLogger for RecordingAudit {
        fn log(&self, event: AuditEvent) {
            self.events.lock().push(event);
        }
    }

    let audit = Arc::new(RecordingAudit::default());
    let config = SubscriptionsConfig::default();
    let connections = Arc::new(ConnectionRegistry::new(config.connections.clone()));
    let dispatcher = NotificationDispatcher::new(
        MemoryTransport::new(),
        config.notifications.clone(),
        MessageFormat::Json,
    );
    let engine = SubscriptionEngine::new(
        config,
        Arc::new(AllowAll),
        audit.clone(),
        connections,
        dispatcher,
    );
    engine.start();

    let connection = engine
        .connections()
        .open("u1", Protocol::WebSocket, json!({}))
        .unwrap();
    engine
        .subscribe("u1", SubscriptionQuery::collection("users"), &connection, None)
        .unwrap();
    // a bad query fails and is audited as a failure
    let _ = engine.subscribe("u1", SubscriptionQuery::default(), &connection, None);

    let events = audit.events.lock();
    assert!(events.iter().any(|e| e.kind == "subscription_created"));
    assert!(events
        .iter()
        .any(|e| e.kind == "subscription_creation_failed"));
    // creation latency is part of the audit detail
    assert!(events.iter().all(|e| e.detail.get("latency_us").is_some()));
}
