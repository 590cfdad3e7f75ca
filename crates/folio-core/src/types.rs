//! Documents, slots, and ordered index keys
//!
//! Records are opaque JSON documents. Indexes need a totally ordered scalar
//! projection of a field value, which `IndexKey` provides: null, booleans,
//! integers, floats (total order via bit representation), and strings.
//! Composite values (arrays, objects) are projected through their canonical
//! JSON rendering so they still index deterministically.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A stored document. Live records are object-shaped.
pub type Document = serde_json::Value;

/// Internal slot identifier in a collection's primary list.
///
/// Slot IDs are allocated from a monotonic counter and never reused within
/// a collection lifetime, even across deletes and reloads. Distinct from
/// the user-visible primary key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct SlotId(pub u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An `f64` with total ordering and bit-wise equality.
///
/// `BTreeMap` keys need `Ord`; IEEE floats don't provide it. Ordering uses
/// `f64::total_cmp`, equality and hashing use the bit pattern, so NaN is a
/// legal (if odd) index key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct F64Key(pub f64);

impl PartialEq for F64Key {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for F64Key {}

impl PartialOrd for F64Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for F64Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl std::hash::Hash for F64Key {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

/// Ordered scalar projection of a document field value.
///
/// This is the key type of every secondary index and the payload type of
/// non-primary indexes (the payload is the primary-key value). Variant
/// order defines cross-type ordering: null < bool < int < float < string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexKey {
    /// Absent or JSON null
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating-point value with total order
    Float(F64Key),
    /// String value
    Str(String),
}

impl IndexKey {
    /// Project a JSON value (or its absence) onto an index key.
    ///
    /// Integers that fit `i64` stay integers; other numbers become floats.
    /// Arrays and objects are projected via their canonical JSON text.
    pub fn from_value(value: Option<&Document>) -> IndexKey {
        match value {
            None | Some(serde_json::Value::Null) => IndexKey::Null,
            Some(serde_json::Value::Bool(b)) => IndexKey::Bool(*b),
            Some(serde_json::Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    IndexKey::Int(i)
                } else {
                    IndexKey::Float(F64Key(n.as_f64().unwrap_or(f64::NAN)))
                }
            }
            Some(serde_json::Value::String(s)) => IndexKey::Str(s.clone()),
            Some(composite) => IndexKey::Str(composite.to_string()),
        }
    }

    /// True for the null key
    pub fn is_null(&self) -> bool {
        matches!(self, IndexKey::Null)
    }

    /// Render the key back to a JSON value (used when a generator fills a
    /// missing field on the document).
    pub fn to_json(&self) -> Document {
        match self {
            IndexKey::Null => serde_json::Value::Null,
            IndexKey::Bool(b) => serde_json::Value::Bool(*b),
            IndexKey::Int(i) => serde_json::Value::from(*i),
            IndexKey::Float(f) => {
                serde_json::Number::from_f64(f.0).map_or(serde_json::Value::Null, serde_json::Value::Number)
            }
            IndexKey::Str(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Lowercased copy for case-folded indexes; non-strings pass through.
    pub fn fold_case(&self) -> IndexKey {
        match self {
            IndexKey::Str(s) => IndexKey::Str(s.to_lowercase()),
            other => other.clone(),
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Null => write!(f, "null"),
            IndexKey::Bool(b) => write!(f, "{}", b),
            IndexKey::Int(i) => write!(f, "{}", i),
            IndexKey::Float(v) => write!(f, "{}", v.0),
            IndexKey::Str(s) => write!(f, "\"{}\"", s),
        }
    }
}

impl From<i64> for IndexKey {
    fn from(v: i64) -> Self {
        IndexKey::Int(v)
    }
}

impl From<u64> for IndexKey {
    fn from(v: u64) -> Self {
        IndexKey::Int(v as i64)
    }
}

impl From<&str> for IndexKey {
    fn from(v: &str) -> Self {
        IndexKey::Str(v.to_string())
    }
}

impl From<String> for IndexKey {
    fn from(v: String) -> Self {
        IndexKey::Str(v)
    }
}

// ============================================================================
// Dotted-path access
// ============================================================================

/// Read a dotted path (`"user.address.city"`) from a document.
///
/// Returns `None` if any segment is missing or a non-object is traversed.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Document> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Write a value at a dotted path, creating intermediate objects.
///
/// Fails if an existing intermediate segment is not an object.
pub fn set_path(doc: &mut Document, path: &str, value: Document) -> Result<(), String> {
    let mut current = doc;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let map = current
            .as_object_mut()
            .ok_or_else(|| format!("path '{}' traverses a non-object at '{}'", path, segment))?;
        if i == segments.len() - 1 {
            map.insert((*segment).to_string(), value);
            return Ok(());
        }
        current = map
            .entry((*segment).to_string())
            .or_insert_with(|| serde_json::json!({}));
    }
    Ok(())
}

/// Recursive merge of `patch` into `base`.
///
/// Objects merge key-by-key; any other value (including arrays) replaces
/// the base value outright. `null` in the patch removes the key.
pub fn deep_merge(base: &mut Document, patch: &Document) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    base_map.remove(key);
                } else if let Some(base_value) = base_map.get_mut(key) {
                    deep_merge(base_value, patch_value);
                } else {
                    base_map.insert(key.clone(), patch_value.clone());
                }
            }
        }
        (base_slot, patch_value) => {
            *base_slot = patch_value.clone();
        }
    }
}

/// Shallow assignment of `patch`'s top-level entries onto `base`.
pub fn shallow_assign(base: &mut Document, patch: &Document) {
    if let (Some(base_map), Some(patch_map)) = (base.as_object_mut(), patch.as_object()) {
        for (key, value) in patch_map {
            base_map.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn index_key_projection() {
        assert_eq!(IndexKey::from_value(None), IndexKey::Null);
        assert_eq!(IndexKey::from_value(Some(&json!(null))), IndexKey::Null);
        assert_eq!(IndexKey::from_value(Some(&json!(true))), IndexKey::Bool(true));
        assert_eq!(IndexKey::from_value(Some(&json!(12))), IndexKey::Int(12));
        assert_eq!(
            IndexKey::from_value(Some(&json!(1.5))),
            IndexKey::Float(F64Key(1.5))
        );
        assert_eq!(
            IndexKey::from_value(Some(&json!("Some"))),
            IndexKey::Str("Some".into())
        );
    }

    #[test]
    fn index_key_cross_type_order() {
        let mut keys = vec![
            IndexKey::Str("a".into()),
            IndexKey::Int(3),
            IndexKey::Null,
            IndexKey::Bool(true),
            IndexKey::Float(F64Key(0.5)),
        ];
        keys.sort();
        assert_eq!(keys[0], IndexKey::Null);
        assert_eq!(keys[1], IndexKey::Bool(true));
        assert_eq!(keys[2], IndexKey::Int(3));
        assert_eq!(keys[4], IndexKey::Str("a".into()));
    }

    #[test]
    fn float_total_order_handles_nan() {
        let mut keys = vec![F64Key(f64::NAN), F64Key(1.0), F64Key(-1.0)];
        keys.sort();
        assert_eq!(keys[0], F64Key(-1.0));
        assert_eq!(keys[1], F64Key(1.0));
    }

    #[test]
    fn case_folding() {
        assert_eq!(
            IndexKey::Str("MiXeD".into()).fold_case(),
            IndexKey::Str("mixed".into())
        );
        assert_eq!(IndexKey::Int(4).fold_case(), IndexKey::Int(4));
    }

    #[test]
    fn path_access() {
        let doc = json!({"user": {"address": {"city": "Riga"}}, "age": 30});
        assert_eq!(get_path(&doc, "user.address.city"), Some(&json!("Riga")));
        assert_eq!(get_path(&doc, "age"), Some(&json!(30)));
        assert_eq!(get_path(&doc, "user.missing"), None);
        assert_eq!(get_path(&doc, "age.nested"), None);
    }

    #[test]
    fn path_set_creates_intermediates() {
        let mut doc = json!({});
        set_path(&mut doc, "a.b.c", json!(1)).unwrap();
        assert_eq!(doc, json!({"a": {"b": {"c": 1}}}));

        let mut doc = json!({"a": 5});
        assert!(set_path(&mut doc, "a.b", json!(1)).is_err());
    }

    #[test]
    fn deep_merge_recurses_objects() {
        let mut base = json!({"a": {"x": 1, "y": 2}, "b": 3});
        deep_merge(&mut base, &json!({"a": {"y": 9}, "c": 4}));
        assert_eq!(base, json!({"a": {"x": 1, "y": 9}, "b": 3, "c": 4}));
    }

    #[test]
    fn deep_merge_null_removes() {
        let mut base = json!({"a": 1, "b": 2});
        deep_merge(&mut base, &json!({"a": null}));
        assert_eq!(base, json!({"b": 2}));
    }

    #[test]
    fn shallow_assign_replaces_whole_values() {
        let mut base = json!({"a": {"x": 1}, "b": 2});
        shallow_assign(&mut base, &json!({"a": {"y": 3}}));
        assert_eq!(base, json!({"a": {"y": 3}, "b": 2}));
    }

    #[test]
    fn untagged_serde_round_trip() {
        for key in [
            IndexKey::Null,
            IndexKey::Bool(false),
            IndexKey::Int(-7),
            IndexKey::Float(F64Key(2.25)),
            IndexKey::Str("k".into()),
        ] {
            let text = serde_json::to_string(&key).unwrap();
            let back: IndexKey = serde_json::from_str(&text).unwrap();
            assert_eq!(key, back);
        }
    }
}
