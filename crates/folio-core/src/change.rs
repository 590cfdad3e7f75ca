//! Change records: the externalized description of a committed mutation
//!
//! A change record is emitted only after a successful commit, or
//! immediately for non-transactional writes. The subscription engine
//! consumes them through the `ChangeSink` capability.

use crate::ttl::now_millis;
use crate::types::Document;
use serde::{Deserialize, Serialize};

/// Mutation kind carried by a change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    /// A new record was created
    Insert,
    /// An existing record was modified
    Update,
    /// A record was removed (or tombstoned)
    Delete,
}

/// Granularity of the resource a change or subscription refers to.
///
/// Ordered from broadest to most specific; `depth()` feeds the query
/// complexity score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// Whole database
    Database,
    /// A single collection
    Collection,
    /// A single document
    Document,
    /// A single field of a document
    Field,
}

impl ResourceType {
    /// Scope depth: database=1 .. field=4.
    pub fn depth(&self) -> u32 {
        match self {
            ResourceType::Database => 1,
            ResourceType::Collection => 2,
            ResourceType::Document => 3,
            ResourceType::Field => 4,
        }
    }
}

/// A committed mutation, as published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Unique change id
    pub id: String,
    /// Scope granularity of this change
    pub resource_type: ResourceType,
    /// Database name
    pub database: String,
    /// Collection name
    pub collection: String,
    /// Primary key of the affected document, rendered as a string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    /// What happened
    pub operation: ChangeOperation,
    /// Document state after the mutation (absent for deletes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Document>,
    /// Document state before the mutation (updates and deletes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_data: Option<Document>,
    /// Top-level fields touched by an update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_fields: Option<Vec<String>>,
    /// Emission time, epoch milliseconds
    pub timestamp: u64,
    /// User on whose behalf the mutation ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Transaction the mutation committed under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl ChangeRecord {
    fn base(
        database: &str,
        collection: &str,
        document_id: Option<String>,
        operation: ChangeOperation,
    ) -> Self {
        ChangeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            resource_type: ResourceType::Document,
            database: database.to_string(),
            collection: collection.to_string(),
            document_id,
            operation,
            data: None,
            previous_data: None,
            affected_fields: None,
            timestamp: now_millis(),
            user_id: None,
            transaction_id: None,
        }
    }

    /// Build an insert change.
    pub fn insert(
        database: &str,
        collection: &str,
        document_id: Option<String>,
        data: Document,
    ) -> Self {
        let mut change = Self::base(database, collection, document_id, ChangeOperation::Insert);
        change.data = Some(data);
        change
    }

    /// Build an update change; affected fields are diffed from the two
    /// document states.
    pub fn update(
        database: &str,
        collection: &str,
        document_id: Option<String>,
        previous: Document,
        current: Document,
    ) -> Self {
        let mut change = Self::base(database, collection, document_id, ChangeOperation::Update);
        change.affected_fields = Some(diff_fields(&previous, &current));
        change.previous_data = Some(previous);
        change.data = Some(current);
        change
    }

    /// Build a delete change.
    pub fn delete(
        database: &str,
        collection: &str,
        document_id: Option<String>,
        previous: Document,
    ) -> Self {
        let mut change = Self::base(database, collection, document_id, ChangeOperation::Delete);
        change.previous_data = Some(previous);
        change
    }

    /// Attach the transaction id.
    pub fn in_transaction(mut self, tx_id: impl ToString) -> Self {
        self.transaction_id = Some(tx_id.to_string());
        self
    }

    /// Attach the acting user.
    pub fn by_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Top-level fields that differ between two documents, sorted.
pub fn diff_fields(previous: &Document, current: &Document) -> Vec<String> {
    let empty = serde_json::Map::new();
    let prev = previous.as_object().unwrap_or(&empty);
    let curr = current.as_object().unwrap_or(&empty);

    let mut fields: Vec<String> = Vec::new();
    for (key, value) in curr {
        if prev.get(key) != Some(value) {
            fields.push(key.clone());
        }
    }
    for key in prev.keys() {
        if !curr.contains_key(key) {
            fields.push(key.clone());
        }
    }
    fields.sort();
    fields.dedup();
    fields
}

// ============================================================================
// Change sink capability
// ============================================================================

/// Consumer of committed change records.
///
/// Implementations must not fail: delivery problems are the consumer's to
/// count and contain. The subscription engine is the canonical sink.
pub trait ChangeSink: Send + Sync {
    /// Publish one committed change.
    fn publish(&self, change: ChangeRecord);

    /// Publish an ordered batch of committed changes.
    ///
    /// Within the batch, order of the underlying DATA entries is preserved.
    fn publish_batch(&self, changes: Vec<ChangeRecord>) {
        for change in changes {
            self.publish(change);
        }
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ChangeSink for NullSink {
    fn publish(&self, _change: ChangeRecord) {}
}
