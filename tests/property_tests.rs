//! Property-style tests for the invariants that must hold for all inputs

use foliodb::{
    ChangeRecord, Collection, CollectionConfig, CompressionAlgorithm, CompressionCodec,
    FieldOp, FilterSpec, IndexDefinition, IndexKey, QueryParser, SubscriptionQuery,
};
use folio_subscriptions::{matches_subscription_scope, ChangeFilter};
use folio_core::{AllowAll, PerformanceMonitor};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;

fn small_string() -> impl Strategy<Value = String> {
    "[a-c]{1,3}"
}

proptest! {
    /// Property 1: a unique index never holds two live records with the
    /// same processed value, no matter the insert/remove interleaving.
    #[test]
    fn unique_index_invariant(ops in prop::collection::vec((small_string(), prop::bool::ANY), 1..40)) {
        let mut collection = Collection::open(
            CollectionConfig::new("p").with_index(IndexDefinition::new("k").unique()),
        ).unwrap();

        for (value, remove) in ops {
            if remove {
                let hits = collection.find_by("k", &json!(value));
                if let Some(doc) = hits.first() {
                    let id = doc["id"].as_i64().unwrap();
                    collection.remove_with_id(IndexKey::Int(id)).unwrap();
                }
            } else {
                // either inserts or fails with UniqueViolation; both fine
                let _ = collection.push(json!({"k": value}));
            }
            // at most one live record per value
            for candidate in ["a", "b", "c", "aa", "ab"] {
                prop_assert!(collection.find_by("k", &json!(candidate)).len() <= 1);
            }
        }
    }

    /// Property 2: the list counter never decreases, whatever happens.
    #[test]
    fn counter_monotonicity(ops in prop::collection::vec(prop::bool::ANY, 1..40)) {
        let mut collection = Collection::open(CollectionConfig::new("c")).unwrap();
        let mut last_counter = collection.counter();
        let mut live: Vec<i64> = Vec::new();

        for insert in ops {
            if insert || live.is_empty() {
                let record = collection.push(json!({"x": 1})).unwrap();
                live.push(record.data["id"].as_i64().unwrap());
            } else {
                let id = live.remove(0);
                collection.remove_with_id(IndexKey::Int(id)).unwrap();
            }
            prop_assert!(collection.counter() >= last_counter);
            last_counter = collection.counter();
        }
    }

    /// Property 8: parse(serialize(parse(q))) is equivalent to parse(q).
    #[test]
    fn parser_idempotence(
        collection in small_string(),
        field in small_string(),
        value in small_string(),
        batch in 1usize..100,
        throttle in 0u64..1000,
    ) {
        let parser = QueryParser::new(Default::default());
        let mut query = SubscriptionQuery::collection(collection)
            .with_field_filter(field, FieldOp::Eq, json!(value));
        query.batch_size = Some(batch);
        query.throttle_ms = Some(throttle);

        let once = parser.parse(&query).unwrap();
        let twice = parser.parse(&once.to_query()).unwrap();
        prop_assert!(once.are_equivalent(&twice));
        prop_assert_eq!(once.query_id, twice.query_id);
    }

    /// Property 9: the optimizer's filter reordering matches exactly the
    /// same changes as the original order.
    #[test]
    fn optimizer_equivalence(
        statuses in prop::collection::vec(small_string(), 1..20),
        wanted in small_string(),
        threshold in 0i64..5,
    ) {
        let parser = QueryParser::new(Default::default());

        // original order: user-ish filter first, then field filters
        let mut query = SubscriptionQuery::collection("users");
        query.filters.push(FilterSpec::Field {
            field: "n".into(),
            op: FieldOp::Gte,
            value: json!(threshold),
            case_sensitive: true,
        });
        query.filters.push(FilterSpec::Field {
            field: "status".into(),
            op: FieldOp::Eq,
            value: json!(wanted.clone()),
            case_sensitive: true,
        });
        let optimized = parser.parse(&query).unwrap();

        // a reference evaluation straight off the raw specs
        let filter = ChangeFilter::new(
            Arc::new(AllowAll),
            Default::default(),
            Arc::new(PerformanceMonitor::default()),
        );

        for (n, status) in statuses.iter().enumerate() {
            let change = ChangeRecord::insert(
                "default",
                "users",
                Some(n.to_string()),
                json!({"status": status, "n": n as i64}),
            );
            let reference = *status == wanted && (n as i64) >= threshold;
            let through_optimized = filter
                .evaluate(&change, &optimized, "u", None)
                .unwrap();
            prop_assert_eq!(through_optimized, reference);
        }
    }

    /// Property 5: a change outside a query's scope is never delivered.
    #[test]
    fn scope_mismatch_never_matches(
        sub_collection in small_string(),
        change_collection in small_string(),
    ) {
        let parser = QueryParser::new(Default::default());
        let query = parser
            .parse(&SubscriptionQuery::collection(sub_collection.clone()))
            .unwrap();
        let change = ChangeRecord::insert("default", &change_collection, None, json!({}));

        let matches = matches_subscription_scope(&change, &query);
        prop_assert_eq!(matches, sub_collection == change_collection);
    }

    /// Compression round-trips for both algorithms at any size over the
    /// threshold, and the ratio gate never produces a larger frame.
    #[test]
    fn compression_round_trip(len in 1usize..4096, lz4 in prop::bool::ANY) {
        let algorithm = if lz4 { CompressionAlgorithm::Lz4 } else { CompressionAlgorithm::Gzip };
        let codec = CompressionCodec::new(algorithm, 64);
        let raw: Vec<u8> = b"folio-data-".iter().copied().cycle().take(len).collect();

        match codec.maybe_compress(&raw).unwrap() {
            Some(envelope) => {
                prop_assert!(envelope.bytes.len() < raw.len());
                prop_assert_eq!(folio_wal::compression::decompress(&envelope).unwrap(), raw);
            }
            None => {
                // either under threshold or incompressible; both are legal
                prop_assert!(raw.len() <= 64 || len < 128);
            }
        }
    }
}

/// Property 7: TTL soundness: once expired, a record is unreachable
/// through any read path. (Deterministic rather than proptest: it needs
/// real elapsed time.)
#[test]
fn ttl_soundness() {
    let mut collection = Collection::open(
        CollectionConfig::new("s")
            .with_index(IndexDefinition::new("user"))
            .with_ttl(foliodb::TtlSpec::Millis(60)),
    )
    .unwrap();
    collection.push(json!({"user": "a"})).unwrap();

    std::thread::sleep(std::time::Duration::from_millis(150));
    assert!(collection.find_by_id(IndexKey::Int(0)).is_none());
    assert!(collection.find_by("user", &json!("a")).is_empty());
    assert_eq!(collection.records().len(), 0);
}
