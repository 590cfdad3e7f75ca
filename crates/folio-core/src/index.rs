//! Secondary indexes
//!
//! A secondary index is an ordered tree from a processed field value to the
//! primary key(s) of matching records. The primary index is the same
//! structure with the list slot number as its payload.
//!
//! Constraint semantics:
//! - `unique`: at most one payload per key
//! - `sparse`: null values are not indexed at all
//! - `required`: null values fail the write
//! - `ignoreCase`: strings are lowercased before insert and lookup
//! - `process`: a named transform applied before insert and lookup
//!
//! Mutation discipline: `check_insert` never mutates, so callers can
//! validate every index before touching any tree, keeping failed writes
//! free of partial index state. Trees are persisted through
//! `PortableIndex` (a flat entry list) and re-materialized on restore;
//! live trees are never serialized structurally.

use crate::error::{FolioError, FolioResult};
use crate::idgen::GeneratorRegistry;
use crate::types::{Document, IndexKey};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// The meta-index key: "install an index per unknown field on first use".
pub const WILDCARD_KEY: &str = "*";

/// Declarative description of one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Dotted field path, or `*` for the wildcard template
    pub key: String,
    /// Populate a missing value from the generator on insert
    #[serde(default)]
    pub auto: bool,
    /// At most one record per value
    #[serde(default)]
    pub unique: bool,
    /// Null values are not indexed
    #[serde(default)]
    pub sparse: bool,
    /// Null values fail the write
    #[serde(default)]
    pub required: bool,
    /// Case-fold strings before indexing
    #[serde(default, rename = "ignoreCase")]
    pub ignore_case: bool,
    /// Named value transform applied before indexing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
    /// Named generator used when `auto` fills a missing value
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "gen")]
    pub generator: Option<String>,
}

impl IndexDefinition {
    /// Plain non-unique index over a field.
    pub fn new(key: impl Into<String>) -> Self {
        IndexDefinition {
            key: key.into(),
            auto: false,
            unique: false,
            sparse: false,
            required: false,
            ignore_case: false,
            process: None,
            generator: None,
        }
    }

    /// Mark unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Mark sparse.
    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    /// Mark required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Enable case folding.
    pub fn ignore_case(mut self) -> Self {
        self.ignore_case = true;
        self
    }

    /// Enable auto-generation with the given named generator.
    pub fn auto_with(mut self, generator: impl Into<String>) -> Self {
        self.auto = true;
        self.generator = Some(generator.into());
        self
    }

    /// Whether this is the `*` wildcard template.
    pub fn is_wildcard(&self) -> bool {
        self.key == WILDCARD_KEY
    }

    /// Instantiate the wildcard template for a concrete field.
    pub fn for_field(&self, field: &str) -> IndexDefinition {
        IndexDefinition {
            key: field.to_string(),
            ..self.clone()
        }
    }

    /// Apply `ignoreCase` and the named `process` transform to a raw value.
    pub fn process_value(&self, raw: IndexKey, registry: &GeneratorRegistry) -> IndexKey {
        let mut value = raw;
        if self.ignore_case {
            value = value.fold_case();
        }
        if let Some(name) = &self.process {
            if let Some(transform) = registry.transform(name) {
                value = transform(&value);
            }
        }
        value
    }
}

/// Payload list: most keys map to a single primary key.
pub type Payloads = SmallVec<[IndexKey; 1]>;

/// Ordered index from processed value to primary key(s).
#[derive(Debug, Clone, Default)]
pub struct SecondaryIndex {
    tree: BTreeMap<IndexKey, Payloads>,
    unique: bool,
    field: String,
}

impl SecondaryIndex {
    /// Empty index for a definition.
    pub fn for_definition(def: &IndexDefinition) -> Self {
        SecondaryIndex {
            tree: BTreeMap::new(),
            unique: def.unique,
            field: def.key.clone(),
        }
    }

    /// Field this index covers.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Number of distinct keys.
    pub fn key_count(&self) -> usize {
        self.tree.len()
    }

    /// Total payload count.
    pub fn len(&self) -> usize {
        self.tree.values().map(|p| p.len()).sum()
    }

    /// True when no entries are present.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Validate an insert without mutating.
    ///
    /// Fails with `UniqueViolation` when a unique index already holds the
    /// key under a different primary key.
    pub fn check_insert(&self, key: &IndexKey, primary: &IndexKey) -> FolioResult<()> {
        if self.unique {
            if let Some(existing) = self.tree.get(key) {
                if existing.iter().any(|p| p != primary) {
                    return Err(FolioError::unique_violation(&self.field, key));
                }
            }
        }
        Ok(())
    }

    /// Insert a payload under a key. Callers run `check_insert` first.
    pub fn insert(&mut self, key: IndexKey, primary: IndexKey) {
        let payloads = self.tree.entry(key).or_default();
        if self.unique {
            payloads.clear();
            payloads.push(primary);
        } else if !payloads.contains(&primary) {
            payloads.push(primary);
        }
    }

    /// Remove the payload matching `primary` under `key`.
    ///
    /// Non-unique indexes remove only the matching payload; the key
    /// disappears when its payload list empties.
    pub fn remove(&mut self, key: &IndexKey, primary: &IndexKey) {
        if let Some(payloads) = self.tree.get_mut(key) {
            payloads.retain(|p| p != primary);
            if payloads.is_empty() {
                self.tree.remove(key);
            }
        }
    }

    /// Payloads stored under a key.
    pub fn lookup(&self, key: &IndexKey) -> &[IndexKey] {
        self.tree.get(key).map(|p| p.as_slice()).unwrap_or(&[])
    }

    /// All `(key, payloads)` pairs with `key <= end`, in key order.
    ///
    /// The TTL sweeper walks the ttl index with this.
    pub fn range_through(&self, end: &IndexKey) -> Vec<(IndexKey, Vec<IndexKey>)> {
        self.tree
            .range(..=end.clone())
            .map(|(k, v)| (k.clone(), v.to_vec()))
            .collect()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.tree.clear();
    }

    /// Iterate `(key, payloads)` in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&IndexKey, &Payloads)> {
        self.tree.iter()
    }

    /// Flatten to the portable persisted form.
    pub fn to_portable(&self, def: &IndexDefinition) -> PortableIndex {
        PortableIndex {
            def: def.clone(),
            entries: self
                .tree
                .iter()
                .map(|(k, v)| (k.clone(), v.to_vec()))
                .collect(),
        }
    }

    /// Re-materialize a tree from its portable form.
    pub fn from_portable(portable: &PortableIndex) -> Self {
        let mut index = SecondaryIndex::for_definition(&portable.def);
        for (key, payloads) in &portable.entries {
            for payload in payloads {
                index.insert(key.clone(), payload.clone());
            }
        }
        index
    }
}

/// Flat, serialization-friendly form of an index.
///
/// Entry order is key order; restore rebuilds the tree by re-inserting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortableIndex {
    /// The definition this tree was built for
    pub def: IndexDefinition,
    /// `(key, payloads)` pairs in key order
    pub entries: Vec<(IndexKey, Vec<IndexKey>)>,
}

/// Resolve an index value for a document: read the field, auto-generate if
/// configured and missing, then apply processing.
///
/// Returns `None` when the value is null and the index is sparse (the
/// record is simply not indexed), an error when null and required.
pub fn resolve_index_value(
    def: &IndexDefinition,
    doc: &Document,
    stats: &crate::idgen::ListStats,
    registry: &GeneratorRegistry,
) -> FolioResult<ResolvedValue> {
    let raw = IndexKey::from_value(crate::types::get_path(doc, &def.key));

    let (value, generated) = if raw.is_null() && def.auto {
        let name = def.generator.as_deref().unwrap_or(crate::idgen::AUTO_INC);
        let generator = registry.generator(name).ok_or_else(|| {
            FolioError::config(format!("unknown generator '{}' on index '{}'", name, def.key))
        })?;
        (generator(doc, stats), true)
    } else {
        (raw, false)
    };

    if value.is_null() {
        if def.required {
            return Err(FolioError::required_violation(&def.key));
        }
        if def.sparse {
            return Ok(ResolvedValue {
                key: None,
                generated: false,
            });
        }
    }

    Ok(ResolvedValue {
        key: Some(def.process_value(value, registry)),
        generated,
    })
}

/// Outcome of resolving one index value for one document.
#[derive(Debug, Clone)]
pub struct ResolvedValue {
    /// The processed key, or `None` when the sparse check skipped indexing
    pub key: Option<IndexKey>,
    /// Whether a generator produced the value (the caller writes it back
    /// onto the document)
    pub generated: bool,
}
