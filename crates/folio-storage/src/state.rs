//! Whole-collection snapshot format
//!
//! The persisted shape of a collection, shared by every adapter. The
//! single-file adapter writes exactly this as one JSON document:
//!
//! ```json
//! { "list":      { "counter": 3, "records": [ ... ] },
//!   "indexes":   { "<field>": { "def": {...}, "entries": [...] } },
//!   "indexDefs": { "<field>": { "key": "...", "unique": true, ... } },
//!   "id":        "<primary-field-name>",
//!   "ttl":       100 }
//! ```
//!
//! Indexes are stored in their portable flat form; restore re-materializes
//! the trees. `indexDefs` also carries definitions without a live tree
//! (the `*` wildcard template in particular).

use folio_core::{IndexDefinition, ListPersistForm, PortableIndex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A collection's full persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    /// Primary list snapshot
    pub list: ListPersistForm,
    /// Materialized indexes in portable form, by field
    pub indexes: BTreeMap<String, PortableIndex>,
    /// All index definitions, by field (includes the wildcard template)
    #[serde(rename = "indexDefs")]
    pub index_defs: BTreeMap<String, IndexDefinition>,
    /// Primary-key field name
    #[serde(rename = "id")]
    pub id_field: String,
    /// Collection TTL in milliseconds, when configured
    #[serde(rename = "ttl", default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

impl StoredState {
    /// Empty state for a collection with the given primary-key field.
    pub fn empty(id_field: impl Into<String>) -> Self {
        StoredState {
            list: ListPersistForm::default(),
            indexes: BTreeMap::new(),
            index_defs: BTreeMap::new(),
            id_field: id_field.into(),
            ttl_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{IndexKey, SecondaryIndex, StoredRecord, SlotId};
    use serde_json::json;

    #[test]
    fn snapshot_json_shape() {
        let def = IndexDefinition::new("name");
        let mut index = SecondaryIndex::for_definition(&def);
        index.insert(IndexKey::from("Some"), IndexKey::Int(0));

        let mut state = StoredState::empty("id");
        state.ttl_ms = Some(100);
        state.index_defs.insert("name".into(), def.clone());
        state.indexes.insert("name".into(), index.to_portable(&def));
        state.list.counter = 1;
        state
            .list
            .records
            .push(StoredRecord::new(SlotId(0), json!({"name": "Some"}), false));

        let value = serde_json::to_value(&state).unwrap();
        assert!(value.get("list").is_some());
        assert!(value.get("indexes").is_some());
        assert!(value.get("indexDefs").is_some());
        assert_eq!(value.get("id"), Some(&json!("id")));
        assert_eq!(value.get("ttl"), Some(&json!(100)));

        let back: StoredState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn ttl_omitted_when_absent() {
        let state = StoredState::empty("id");
        let text = serde_json::to_string(&state).unwrap();
        assert!(!text.contains("\"ttl\""));
    }
}
