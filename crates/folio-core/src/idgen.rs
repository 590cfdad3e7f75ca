//! Named ID generators and value transforms
//!
//! Index definitions reference generators and transforms by *name*; the
//! registry maps names to strongly typed function pointers. Serialized
//! index definitions therefore carry names, never code.
//!
//! Two generators are always registered:
//! - `autoIncIdGen`: returns the list counter (the next slot number)
//! - `autoTimestamp`: returns wall-clock epoch milliseconds

use crate::ttl::now_millis;
use crate::types::{Document, IndexKey};
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

/// Name of the default auto-increment generator.
pub const AUTO_INC: &str = "autoIncIdGen";
/// Name of the wall-clock timestamp generator.
pub const AUTO_TIMESTAMP: &str = "autoTimestamp";
/// Name of the built-in lowercase transform.
pub const LOWERCASE: &str = "lowercase";

/// Counters a generator may consult.
#[derive(Debug, Clone, Copy)]
pub struct ListStats {
    /// The list's monotonic slot counter
    pub counter: u64,
    /// Number of records currently stored
    pub len: usize,
}

/// A named ID generator: produces a value for an `auto` index whose field
/// is missing on the inserted document.
pub type IdGenerator = fn(&Document, &ListStats) -> IndexKey;

/// A named value transform applied before a value is indexed.
pub type ValueTransform = fn(&IndexKey) -> IndexKey;

fn auto_increment(_doc: &Document, stats: &ListStats) -> IndexKey {
    IndexKey::Int(stats.counter as i64)
}

fn auto_timestamp(_doc: &Document, _stats: &ListStats) -> IndexKey {
    IndexKey::Int(now_millis() as i64)
}

fn lowercase(key: &IndexKey) -> IndexKey {
    key.fold_case()
}

/// Registry mapping generator and transform names to functions.
#[derive(Debug, Clone)]
pub struct GeneratorRegistry {
    generators: FxHashMap<String, IdGenerator>,
    transforms: FxHashMap<String, ValueTransform>,
}

impl Default for GeneratorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl GeneratorRegistry {
    /// Registry pre-loaded with the built-in generators and transforms.
    pub fn with_builtins() -> Self {
        let mut registry = GeneratorRegistry {
            generators: FxHashMap::default(),
            transforms: FxHashMap::default(),
        };
        registry.register_generator(AUTO_INC, auto_increment);
        registry.register_generator(AUTO_TIMESTAMP, auto_timestamp);
        registry.register_transform(LOWERCASE, lowercase);
        registry
    }

    /// Shared registry with only the built-ins.
    pub fn global() -> &'static GeneratorRegistry {
        static GLOBAL: Lazy<GeneratorRegistry> = Lazy::new(GeneratorRegistry::with_builtins);
        &GLOBAL
    }

    /// Register (or replace) a generator under a name.
    pub fn register_generator(&mut self, name: impl Into<String>, generator: IdGenerator) {
        self.generators.insert(name.into(), generator);
    }

    /// Register (or replace) a transform under a name.
    pub fn register_transform(&mut self, name: impl Into<String>, transform: ValueTransform) {
        self.transforms.insert(name.into(), transform);
    }

    /// Look up a generator by name.
    pub fn generator(&self, name: &str) -> Option<IdGenerator> {
        self.generators.get(name).copied()
    }

    /// Look up a transform by name.
    pub fn transform(&self, name: &str) -> Option<ValueTransform> {
        self.transforms.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auto_increment_returns_counter() {
        let registry = GeneratorRegistry::with_builtins();
        let generator = registry.generator(AUTO_INC).unwrap();
        let stats = ListStats { counter: 7, len: 3 };
        assert_eq!(generator(&json!({}), &stats), IndexKey::Int(7));
    }

    #[test]
    fn auto_timestamp_is_recent() {
        let registry = GeneratorRegistry::with_builtins();
        let generator = registry.generator(AUTO_TIMESTAMP).unwrap();
        let stats = ListStats { counter: 0, len: 0 };
        let before = now_millis();
        match generator(&json!({}), &stats) {
            IndexKey::Int(ts) => assert!(ts as u64 >= before),
            other => panic!("expected Int, got {:?}", other),
        }
    }

    #[test]
    fn unknown_names_miss() {
        let registry = GeneratorRegistry::with_builtins();
        assert!(registry.generator("evalMe").is_none());
        assert!(registry.transform("evalMe").is_none());
    }

    #[test]
    fn custom_registration() {
        fn fixed(_doc: &Document, _stats: &ListStats) -> IndexKey {
            IndexKey::Int(42)
        }
        let mut registry = GeneratorRegistry::with_builtins();
        registry.register_generator("fixed", fixed);
        let stats = ListStats { counter: 0, len: 0 };
        assert_eq!(
            registry.generator("fixed").unwrap()(&json!({}), &stats),
            IndexKey::Int(42)
        );
    }

    #[test]
    fn lowercase_transform() {
        let registry = GeneratorRegistry::with_builtins();
        let transform = registry.transform(LOWERCASE).unwrap();
        assert_eq!(
            transform(&IndexKey::Str("ABC".into())),
            IndexKey::Str("abc".into())
        );
    }
}
