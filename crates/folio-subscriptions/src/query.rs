//! Subscription query parsing
//!
//! Turns the raw, wire-shaped `SubscriptionQuery` into a validated
//! `ParsedQuery`: resource type inferred from the most specific path
//! present, filters checked fail-fast, regexes compiled once, delivery
//! knobs clamped to configured bounds, and filters reordered cheapest
//! first (field < user < custom).
//!
//! The `query_id` is a structural hash (xxh3) over the scope and the
//! normalized filters, stable across parses of equivalent queries and
//! used for dedup.

use crate::config::QueryConfig;
use folio_core::{ChangeRecord, Document, FolioError, FolioResult, ResourceType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

/// Callable filter: receives the change and the resolved user document.
pub type CustomEvaluator = Arc<dyn Fn(&ChangeRecord, Option<&Document>) -> bool + Send + Sync>;

/// Operators accepted by field filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldOp {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Greater than
    Gt,
    /// Greater than or equal
    Gte,
    /// Less than
    Lt,
    /// Less than or equal
    Lte,
    /// Member of an array value
    In,
    /// Not a member of an array value
    Nin,
    /// Matches a regular expression
    Regex,
}

/// Operators accepted by user filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserOp {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Intersects an array value
    In,
    /// Disjoint from an array value
    Nin,
}

fn default_true() -> bool {
    true
}

/// Wire-shaped filter specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FilterSpec {
    /// Read a dotted path from the change's document
    Field {
        /// Dotted path into `change.data`
        field: String,
        /// Comparison operator
        op: FieldOp,
        /// Comparison operand
        value: serde_json::Value,
        /// Case-sensitive string comparison (default true)
        #[serde(default = "default_true")]
        case_sensitive: bool,
    },
    /// Read a dotted path from the resolved user document
    User {
        /// Dotted path into the user document
        user_field: String,
        /// Comparison operator
        op: UserOp,
        /// Comparison operand
        value: serde_json::Value,
    },
    /// Marker for an attached callable evaluator
    Custom,
}

/// Wire-shaped subscription query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SubscriptionQuery {
    /// Scope granularity; inferred from paths when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<ResourceType>,
    /// Database scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Collection scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// Document scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    /// Field scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_path: Option<String>,
    /// Filters applied after scope matching
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    /// Send a synthetic initial-data message on subscribe
    #[serde(default)]
    pub include_initial_data: bool,
    /// Include subscription metadata in notifications
    #[serde(default)]
    pub include_metadata: bool,
    /// Per-subscription batch size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    /// Per-subscription throttle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_ms: Option<u64>,
}

impl SubscriptionQuery {
    /// Query scoped to one collection.
    pub fn collection(name: impl Into<String>) -> Self {
        SubscriptionQuery {
            collection: Some(name.into()),
            ..Default::default()
        }
    }

    /// Add a field filter.
    pub fn with_field_filter(
        mut self,
        field: impl Into<String>,
        op: FieldOp,
        value: serde_json::Value,
    ) -> Self {
        self.filters.push(FilterSpec::Field {
            field: field.into(),
            op,
            value,
            case_sensitive: true,
        });
        self
    }
}

/// A validated, compiled filter.
#[derive(Clone)]
pub enum ParsedFilter {
    /// Field filter with its regex compiled when `op` is `Regex`
    Field {
        /// Dotted path into `change.data`
        field: String,
        /// Comparison operator
        op: FieldOp,
        /// Comparison operand
        value: serde_json::Value,
        /// Case-sensitive string comparison
        case_sensitive: bool,
        /// Compiled pattern for the `Regex` op
        regex: Option<Regex>,
    },
    /// User filter
    User {
        /// Dotted path into the user document
        user_field: String,
        /// Comparison operator
        op: UserOp,
        /// Comparison operand
        value: serde_json::Value,
    },
    /// Attached callable evaluator
    Custom {
        /// The evaluator
        evaluator: CustomEvaluator,
    },
}

impl ParsedFilter {
    /// Evaluation-cost rank: field < user < custom.
    pub fn cost_rank(&self) -> u8 {
        match self {
            ParsedFilter::Field { .. } => 0,
            ParsedFilter::User { .. } => 1,
            ParsedFilter::Custom { .. } => 2,
        }
    }

    /// The wire form of this filter (custom collapses to its marker).
    pub fn to_spec(&self) -> FilterSpec {
        match self {
            ParsedFilter::Field {
                field,
                op,
                value,
                case_sensitive,
                ..
            } => FilterSpec::Field {
                field: field.clone(),
                op: *op,
                value: value.clone(),
                case_sensitive: *case_sensitive,
            },
            ParsedFilter::User {
                user_field,
                op,
                value,
            } => FilterSpec::User {
                user_field: user_field.clone(),
                op: *op,
                value: value.clone(),
            },
            ParsedFilter::Custom { .. } => FilterSpec::Custom,
        }
    }
}

impl fmt::Debug for ParsedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParsedFilter::Field { field, op, .. } => {
                write!(f, "Field({} {:?})", field, op)
            }
            ParsedFilter::User { user_field, op, .. } => {
                write!(f, "User({} {:?})", user_field, op)
            }
            ParsedFilter::Custom { .. } => write!(f, "Custom(..)"),
        }
    }
}

impl PartialEq for ParsedFilter {
    fn eq(&self, other: &Self) -> bool {
        // semantic comparison; evaluators compare by presence only
        match (self, other) {
            (ParsedFilter::Custom { .. }, ParsedFilter::Custom { .. }) => true,
            (a, b) => a.to_spec() == b.to_spec(),
        }
    }
}

/// A validated subscription query.
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    /// Structural hash over scope and filters, for dedup
    pub query_id: u64,
    /// Resolved scope granularity
    pub resource_type: ResourceType,
    /// Database scope
    pub database: Option<String>,
    /// Collection scope
    pub collection: Option<String>,
    /// Document scope
    pub document_id: Option<String>,
    /// Field scope
    pub field_path: Option<String>,
    /// Filters in optimized (cheapest-first) order
    pub filters: Vec<ParsedFilter>,
    /// Send a synthetic initial-data message on subscribe
    pub include_initial_data: bool,
    /// Include subscription metadata in notifications
    pub include_metadata: bool,
    /// Clamped batch size
    pub batch_size: usize,
    /// Clamped throttle
    pub throttle_ms: u64,
}

impl ParsedQuery {
    /// Serialize back to the wire shape (custom filters keep markers).
    pub fn to_query(&self) -> SubscriptionQuery {
        SubscriptionQuery {
            resource_type: Some(self.resource_type),
            database: self.database.clone(),
            collection: self.collection.clone(),
            document_id: self.document_id.clone(),
            field_path: self.field_path.clone(),
            filters: self.filters.iter().map(ParsedFilter::to_spec).collect(),
            include_initial_data: self.include_initial_data,
            include_metadata: self.include_metadata,
            batch_size: Some(self.batch_size),
            throttle_ms: Some(self.throttle_ms),
        }
    }

    /// Semantic equivalence across all fields that affect matching and
    /// delivery.
    pub fn are_equivalent(&self, other: &ParsedQuery) -> bool {
        self.resource_type == other.resource_type
            && self.database == other.database
            && self.collection == other.collection
            && self.document_id == other.document_id
            && self.field_path == other.field_path
            && self.filters == other.filters
            && self.include_initial_data == other.include_initial_data
            && self.include_metadata == other.include_metadata
            && self.batch_size == other.batch_size
            && self.throttle_ms == other.throttle_ms
    }

    /// Cost score: scope depth + 2 per plain filter + 5 per custom filter.
    pub fn complexity(&self) -> u32 {
        let filter_cost: u32 = self
            .filters
            .iter()
            .map(|f| match f {
                ParsedFilter::Custom { .. } => 5,
                _ => 2,
            })
            .sum();
        self.resource_type.depth() + filter_cost
    }
}

/// Validating parser for subscription queries.
#[derive(Debug, Clone)]
pub struct QueryParser {
    config: QueryConfig,
}

impl QueryParser {
    /// Parser bound to limits.
    pub fn new(config: QueryConfig) -> Self {
        QueryParser { config }
    }

    /// Parse a query with no custom filters attached.
    pub fn parse(&self, query: &SubscriptionQuery) -> FolioResult<ParsedQuery> {
        self.parse_with_custom(query, Vec::new())
    }

    /// Parse a query, attaching one evaluator per `Custom` marker.
    pub fn parse_with_custom(
        &self,
        query: &SubscriptionQuery,
        evaluators: Vec<CustomEvaluator>,
    ) -> FolioResult<ParsedQuery> {
        let resource_type = self.resolve_scope(query)?;
        let filters = self.parse_filters(query, evaluators)?;

        let batch_size = query.batch_size.unwrap_or(self.config.default_batch_size);
        if batch_size == 0 || batch_size > self.config.max_batch_size {
            return Err(FolioError::validation(format!(
                "batch_size {} outside [1, {}]",
                batch_size, self.config.max_batch_size
            )));
        }
        let throttle_ms = query.throttle_ms.unwrap_or(self.config.default_throttle_ms);
        if throttle_ms > self.config.max_throttle_ms {
            return Err(FolioError::validation(format!(
                "throttle_ms {} exceeds {}",
                throttle_ms, self.config.max_throttle_ms
            )));
        }

        let mut parsed = ParsedQuery {
            query_id: 0,
            resource_type,
            database: query.database.clone(),
            collection: query.collection.clone(),
            document_id: query.document_id.clone(),
            field_path: query.field_path.clone(),
            filters,
            include_initial_data: query.include_initial_data,
            include_metadata: query.include_metadata,
            batch_size,
            throttle_ms,
        };
        optimize(&mut parsed);
        parsed.query_id = structural_hash(&parsed);
        Ok(parsed)
    }

    fn resolve_scope(&self, query: &SubscriptionQuery) -> FolioResult<ResourceType> {
        // inferred from the most specific path present
        let inferred = if query.field_path.is_some() {
            ResourceType::Field
        } else if query.document_id.is_some() {
            ResourceType::Document
        } else if query.collection.is_some() {
            ResourceType::Collection
        } else if query.database.is_some() {
            ResourceType::Database
        } else {
            return Err(FolioError::validation(
                "query must name a database, collection, document, or field",
            ));
        };
        let resource_type = query.resource_type.unwrap_or(inferred);

        // scope completeness per resource type
        let complete = match resource_type {
            ResourceType::Database => query.database.is_some(),
            ResourceType::Collection => query.collection.is_some(),
            ResourceType::Document => query.collection.is_some() && query.document_id.is_some(),
            ResourceType::Field => {
                query.collection.is_some()
                    && query.document_id.is_some()
                    && query.field_path.is_some()
            }
        };
        if !complete {
            return Err(FolioError::validation(format!(
                "{:?}-level query is missing required scope fields",
                resource_type
            )));
        }
        Ok(resource_type)
    }

    fn parse_filters(
        &self,
        query: &SubscriptionQuery,
        mut evaluators: Vec<CustomEvaluator>,
    ) -> FolioResult<Vec<ParsedFilter>> {
        if query.filters.len() > self.config.max_filters {
            return Err(FolioError::validation(format!(
                "{} filters exceed the limit of {}",
                query.filters.len(),
                self.config.max_filters
            )));
        }

        let mut seen_fields: Vec<&str> = Vec::new();
        let mut custom_count = 0usize;
        evaluators.reverse(); // consume front-to-back via pop

        let mut parsed = Vec::with_capacity(query.filters.len());
        for spec in &query.filters {
            match spec {
                FilterSpec::Field {
                    field,
                    op,
                    value,
                    case_sensitive,
                } => {
                    if seen_fields.contains(&field.as_str()) {
                        return Err(FolioError::validation(format!(
                            "duplicate field filter on '{}'",
                            field
                        )));
                    }
                    seen_fields.push(field);
                    if matches!(op, FieldOp::In | FieldOp::Nin) && !value.is_array() {
                        return Err(FolioError::validation(format!(
                            "'{:?}' filter on '{}' requires an array value",
                            op, field
                        )));
                    }
                    let regex = if *op == FieldOp::Regex {
                        let pattern = value.as_str().ok_or_else(|| {
                            FolioError::validation(format!(
                                "regex filter on '{}' requires a string pattern",
                                field
                            ))
                        })?;
                        let full = if *case_sensitive {
                            pattern.to_string()
                        } else {
                            format!("(?i){}", pattern)
                        };
                        Some(Regex::new(&full).map_err(|e| {
                            FolioError::validation(format!(
                                "regex filter on '{}' does not compile: {}",
                                field, e
                            ))
                        })?)
                    } else {
                        None
                    };
                    parsed.push(ParsedFilter::Field {
                        field: field.clone(),
                        op: *op,
                        value: value.clone(),
                        case_sensitive: *case_sensitive,
                        regex,
                    });
                }
                FilterSpec::User {
                    user_field,
                    op,
                    value,
                } => {
                    if matches!(op, UserOp::In | UserOp::Nin) && !value.is_array() {
                        return Err(FolioError::validation(format!(
                            "'{:?}' filter on user field '{}' requires an array value",
                            op, user_field
                        )));
                    }
                    parsed.push(ParsedFilter::User {
                        user_field: user_field.clone(),
                        op: *op,
                        value: value.clone(),
                    });
                }
                FilterSpec::Custom => {
                    if !self.config.allow_custom_filters {
                        return Err(FolioError::validation(
                            "custom filters are disabled by configuration",
                        ));
                    }
                    custom_count += 1;
                    if custom_count > 1 {
                        return Err(FolioError::validation(
                            "at most one custom filter per subscription",
                        ));
                    }
                    let evaluator = evaluators.pop().ok_or_else(|| {
                        FolioError::validation("custom filter marker without an evaluator")
                    })?;
                    parsed.push(ParsedFilter::Custom { evaluator });
                }
            }
        }
        if !evaluators.is_empty() {
            return Err(FolioError::validation(
                "more evaluators than custom filter markers",
            ));
        }
        Ok(parsed)
    }
}

/// Reorder filters cheapest-first (field < user < custom), stably.
pub fn optimize(query: &mut ParsedQuery) {
    query.filters.sort_by_key(ParsedFilter::cost_rank);
}

/// Structural hash over scope and normalized filters.
fn structural_hash(query: &ParsedQuery) -> u64 {
    #[derive(Serialize)]
    struct Canonical<'a> {
        resource_type: ResourceType,
        database: &'a Option<String>,
        collection: &'a Option<String>,
        document_id: &'a Option<String>,
        field_path: &'a Option<String>,
        filters: Vec<FilterSpec>,
    }
    let canonical = Canonical {
        resource_type: query.resource_type,
        database: &query.database,
        collection: &query.collection,
        document_id: &query.document_id,
        field_path: &query.field_path,
        filters: query.filters.iter().map(ParsedFilter::to_spec).collect(),
    };
    // canonical form serializes deterministically
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    xxh3_64(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parser() -> QueryParser {
        QueryParser::new(QueryConfig::default())
    }

    #[test]
    fn infers_resource_type_from_most_specific_path() {
        let query = SubscriptionQuery {
            collection: Some("users".into()),
            ..Default::default()
        };
        assert_eq!(
            parser().parse(&query).unwrap().resource_type,
            ResourceType::Collection
        );

        let query = SubscriptionQuery {
            collection: Some("users".into()),
            document_id: Some("7".into()),
            field_path: Some("status".into()),
            ..Default::default()
        };
        assert_eq!(
            parser().parse(&query).unwrap().resource_type,
            ResourceType::Field
        );
    }

    #[test]
    fn scope_completeness_is_enforced() {
        // document-level needs collection + document
        let query = SubscriptionQuery {
            resource_type: Some(ResourceType::Document),
            collection: Some("users".into()),
            ..Default::default()
        };
        assert!(parser().parse(&query).is_err());

        // field-level needs collection + document + field
        let query = SubscriptionQuery {
            resource_type: Some(ResourceType::Field),
            collection: Some("users".into()),
            document_id: Some("1".into()),
            ..Default::default()
        };
        assert!(parser().parse(&query).is_err());

        let query = SubscriptionQuery::default();
        assert!(parser().parse(&query).is_err());
    }

    #[test]
    fn duplicate_field_filters_rejected() {
        let query = SubscriptionQuery::collection("users")
            .with_field_filter("status", FieldOp::Eq, json!("active"))
            .with_field_filter("status", FieldOp::Ne, json!("blocked"));
        let err = parser().parse(&query).unwrap_err();
        assert!(matches!(err, FolioError::Validation { .. }));
    }

    #[test]
    fn in_requires_array_and_regex_must_compile() {
        let query = SubscriptionQuery::collection("users").with_field_filter(
            "status",
            FieldOp::In,
            json!("active"),
        );
        assert!(parser().parse(&query).is_err());

        let query = SubscriptionQuery::collection("users").with_field_filter(
            "name",
            FieldOp::Regex,
            json!("[unclosed"),
        );
        assert!(parser().parse(&query).is_err());

        let query = SubscriptionQuery::collection("users").with_field_filter(
            "name",
            FieldOp::Regex,
            json!("^a.*z$"),
        );
        assert!(parser().parse(&query).is_ok());
    }

    #[test]
    fn custom_filters_are_capped_and_gated() {
        let evaluator: CustomEvaluator = Arc::new(|_, _| true);
        let mut query = SubscriptionQuery::collection("users");
        query.filters.push(FilterSpec::Custom);
        query.filters.push(FilterSpec::Custom);
        assert!(parser()
            .parse_with_custom(&query, vec![evaluator.clone(), evaluator.clone()])
            .is_err());

        let mut disabled = QueryConfig::default();
        disabled.allow_custom_filters = false;
        let mut query = SubscriptionQuery::collection("users");
        query.filters.push(FilterSpec::Custom);
        assert!(QueryParser::new(disabled)
            .parse_with_custom(&query, vec![evaluator])
            .is_err());
    }

    #[test]
    fn batch_and_throttle_bounds() {
        let mut query = SubscriptionQuery::collection("users");
        query.batch_size = Some(0);
        assert!(parser().parse(&query).is_err());
        query.batch_size = Some(10_000);
        assert!(parser().parse(&query).is_err());
        query.batch_size = Some(10);
        query.throttle_ms = Some(999_999);
        assert!(parser().parse(&query).is_err());
        query.throttle_ms = Some(100);
        let parsed = parser().parse(&query).unwrap();
        assert_eq!(parsed.batch_size, 10);
        assert_eq!(parsed.throttle_ms, 100);
    }

    #[test]
    fn optimizer_orders_field_user_custom() {
        let evaluator: CustomEvaluator = Arc::new(|_, _| true);
        let mut query = SubscriptionQuery::collection("users");
        query.filters.push(FilterSpec::Custom);
        query.filters.push(FilterSpec::User {
            user_field: "role".into(),
            op: UserOp::Eq,
            value: json!("admin"),
        });
        query.filters.push(FilterSpec::Field {
            field: "status".into(),
            op: FieldOp::Eq,
            value: json!("active"),
            case_sensitive: true,
        });
        let parsed = parser().parse_with_custom(&query, vec![evaluator]).unwrap();
        let ranks: Vec<u8> = parsed.filters.iter().map(ParsedFilter::cost_rank).collect();
        assert_eq!(ranks, vec![0, 1, 2]);
    }

    #[test]
    fn parse_serialize_parse_is_identity() {
        let query = SubscriptionQuery::collection("users")
            .with_field_filter("status", FieldOp::Eq, json!("active"))
            .with_field_filter("age", FieldOp::Gte, json!(18));
        let once = parser().parse(&query).unwrap();
        let twice = parser().parse(&once.to_query()).unwrap();
        assert!(once.are_equivalent(&twice));
        assert_eq!(once.query_id, twice.query_id);
    }

    #[test]
    fn query_id_distinguishes_scope_and_filters() {
        let a = parser().parse(&SubscriptionQuery::collection("users")).unwrap();
        let b = parser().parse(&SubscriptionQuery::collection("orders")).unwrap();
        assert_ne!(a.query_id, b.query_id);

        let c = parser()
            .parse(
                &SubscriptionQuery::collection("users").with_field_filter(
                    "status",
                    FieldOp::Eq,
                    json!("active"),
                ),
            )
            .unwrap();
        assert_ne!(a.query_id, c.query_id);
    }

    #[test]
    fn complexity_scores() {
        let plain = parser().parse(&SubscriptionQuery::collection("users")).unwrap();
        assert_eq!(plain.complexity(), 2); // collection depth

        let evaluator: CustomEvaluator = Arc::new(|_, _| true);
        let mut query = SubscriptionQuery::collection("users")
            .with_field_filter("status", FieldOp::Eq, json!("active"));
        query.filters.push(FilterSpec::Custom);
        let rich = parser().parse_with_custom(&query, vec![evaluator]).unwrap();
        assert_eq!(rich.complexity(), 2 + 2 + 5);
    }
}
