//! Collection configuration

use folio_core::{FolioError, FolioResult, IndexDefinition, TtlSpec, AUTO_INC};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Primary-key field specification: a bare field name or a full spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdFieldSpec {
    /// Just the field name; `auto` comes from the collection-level flag
    Name(String),
    /// Full specification
    Spec {
        /// Field name
        name: String,
        /// Auto-generate missing values
        #[serde(default)]
        auto: bool,
        /// Named generator (defaults to the auto-increment generator)
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "gen")]
        generator: Option<String>,
    },
}

impl Default for IdFieldSpec {
    fn default() -> Self {
        IdFieldSpec::Name("id".to_string())
    }
}

impl IdFieldSpec {
    /// The primary-key field name.
    pub fn field_name(&self) -> &str {
        match self {
            IdFieldSpec::Name(name) => name,
            IdFieldSpec::Spec { name, .. } => name,
        }
    }

    /// Resolve to (auto, generator name) given the collection-level `auto`.
    pub fn resolve_auto(&self, collection_auto: bool) -> (bool, String) {
        match self {
            IdFieldSpec::Name(_) => (collection_auto, AUTO_INC.to_string()),
            IdFieldSpec::Spec {
                auto, generator, ..
            } => (
                *auto || collection_auto,
                generator.clone().unwrap_or_else(|| AUTO_INC.to_string()),
            ),
        }
    }
}

/// Persistence backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdapterChoice {
    /// Nothing persists
    #[default]
    Memory,
    /// One JSON document per collection
    File,
    /// One JSON file per record
    PerRecord,
}

/// Primary-list variant selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListChoice {
    /// Fully in-memory list
    #[default]
    Memory,
    /// One file per record, slot-indexed
    File,
}

/// Timer-driven rotation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationSpec {
    /// Tick period in milliseconds
    #[serde(rename = "periodMs")]
    pub period_ms: u64,
}

/// Everything needed to build a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Collection name (required, non-empty)
    pub name: String,
    /// Database name used in change records
    #[serde(default = "default_database")]
    pub database: String,
    /// Primary-key field
    #[serde(default)]
    pub id: IdFieldSpec,
    /// Auto-generate missing primary keys
    #[serde(default = "default_true")]
    pub auto: bool,
    /// User index definitions (may include a `*` wildcard template)
    #[serde(default, rename = "indexList")]
    pub index_list: Vec<IndexDefinition>,
    /// Persistence backend
    #[serde(default)]
    pub adapter: AdapterChoice,
    /// Wrap the adapter for WAL transactions
    #[serde(default)]
    pub transactional: bool,
    /// Primary-list variant
    #[serde(default)]
    pub list: ListChoice,
    /// TTL: duration string, milliseconds, or boolean
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<TtlSpec>,
    /// Field carrying the ttl timestamp
    #[serde(default = "default_ttl_field", rename = "ttlKey")]
    pub ttl_field: String,
    /// Rotation schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate: Option<RotationSpec>,
    /// Keep audit envelopes and tombstone removals
    #[serde(default)]
    pub audit: bool,
    /// Whether the TTL sweeper also purges old tombstones (audit mode)
    #[serde(default, rename = "expireTombstones")]
    pub expire_tombstones: bool,
    /// Persist after every non-transactional mutation
    #[serde(default = "default_true", rename = "autoPersist")]
    pub auto_persist: bool,
    /// Root directory for file-backed adapters and lists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

fn default_database() -> String {
    "default".to_string()
}

fn default_ttl_field() -> String {
    "ttl".to_string()
}

fn default_true() -> bool {
    true
}

impl CollectionConfig {
    /// Config with defaults for a named collection.
    pub fn new(name: impl Into<String>) -> Self {
        CollectionConfig {
            name: name.into(),
            database: default_database(),
            id: IdFieldSpec::default(),
            auto: true,
            index_list: Vec::new(),
            adapter: AdapterChoice::Memory,
            transactional: false,
            list: ListChoice::Memory,
            ttl: None,
            ttl_field: default_ttl_field(),
            rotate: None,
            audit: false,
            expire_tombstones: false,
            auto_persist: true,
            root: None,
        }
    }

    /// Add an index definition.
    pub fn with_index(mut self, def: IndexDefinition) -> Self {
        self.index_list.push(def);
        self
    }

    /// Set the TTL.
    pub fn with_ttl(mut self, ttl: TtlSpec) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Check the config for contradictions.
    pub fn validate(&self) -> FolioResult<()> {
        if self.name.trim().is_empty() {
            return Err(FolioError::config("collection name must be non-empty"));
        }
        let needs_root = self.adapter != AdapterChoice::Memory || self.list == ListChoice::File;
        if needs_root && self.root.is_none() {
            return Err(FolioError::config(
                "file-backed adapter or list requires a root directory",
            ));
        }
        if let Some(rotate) = &self.rotate {
            if rotate.period_ms == 0 {
                return Err(FolioError::config("rotation period must be positive"));
            }
        }
        if let Some(ttl) = &self.ttl {
            ttl.resolve()?;
        }
        for def in &self.index_list {
            if def.key.trim().is_empty() {
                return Err(FolioError::config("index key must be non-empty"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_is_rejected() {
        assert!(CollectionConfig::new("  ").validate().is_err());
        assert!(CollectionConfig::new("users").validate().is_ok());
    }

    #[test]
    fn file_backends_require_root() {
        let mut config = CollectionConfig::new("users");
        config.adapter = AdapterChoice::File;
        assert!(config.validate().is_err());
        config.root = Some(PathBuf::from("/tmp/folio"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn id_spec_shapes() {
        let config: CollectionConfig =
            serde_json::from_str(r#"{"name": "users", "id": "userId"}"#).unwrap();
        assert_eq!(config.id.field_name(), "userId");

        let config: CollectionConfig = serde_json::from_str(
            r#"{"name": "users", "id": {"name": "key", "auto": true, "gen": "autoTimestamp"}}"#,
        )
        .unwrap();
        assert_eq!(config.id.field_name(), "key");
        let (auto, generator) = config.id.resolve_auto(false);
        assert!(auto);
        assert_eq!(generator, "autoTimestamp");
    }

    #[test]
    fn ttl_accepts_all_shapes() {
        let config: CollectionConfig =
            serde_json::from_str(r#"{"name": "users", "ttl": "100ms"}"#).unwrap();
        assert!(config.validate().is_ok());
        let config: CollectionConfig =
            serde_json::from_str(r#"{"name": "users", "ttl": 250}"#).unwrap();
        assert!(config.validate().is_ok());
        let config: CollectionConfig =
            serde_json::from_str(r#"{"name": "users", "ttl": "sometime"}"#).unwrap();
        assert!(config.validate().is_err());
    }
}
