//! Schema fingerprints
//!
//! A fingerprint is the SHA-256 of the schema's canonical JSON, where every
//! object has its keys sorted. Field declaration order therefore never
//! changes the fingerprint, while any change to a mapping does.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Declared schema of a document producer (settings + mappings)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexSchema(pub Value);

impl IndexSchema {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_json(&self) -> &Value {
        &self.0
    }

    /// Serialize with recursively sorted object keys
    pub fn canonical_json(&self) -> String {
        canonicalize(&self.0).to_string()
    }

    /// Lowercase hex SHA-256 of `canonical_json()`
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.canonical_json().as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl From<Value> for IndexSchema {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let fp = IndexSchema::new(json!({})).fingerprint();
        // sha256("{}")
        assert_eq!(
            fp,
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn test_key_order_ignored() {
        let a = IndexSchema::new(json!({
            "mappings": {"properties": {"title": {"type": "text"}, "year": {"type": "integer"}}},
            "settings": {"number_of_shards": 1}
        }));
        let b = IndexSchema::new(json!({
            "settings": {"number_of_shards": 1},
            "mappings": {"properties": {"year": {"type": "integer"}, "title": {"type": "text"}}}
        }));

        assert_eq!(a.canonical_json(), b.canonical_json());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_mapping_change_detected() {
        let a = IndexSchema::new(json!({"properties": {"title": {"type": "text"}}}));
        let b = IndexSchema::new(json!({"properties": {"title": {"type": "keyword"}}}));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_array_order_significant() {
        let a = IndexSchema::new(json!({"analyzers": ["lowercase", "stop"]}));
        let b = IndexSchema::new(json!({"analyzers": ["stop", "lowercase"]}));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    proptest! {
        #[test]
        fn prop_fingerprint_independent_of_insertion_order(
            fields in proptest::collection::btree_map("[a-z]{1,8}", "[a-z]{1,8}", 1..12)
        ) {
            let forward: Map<String, Value> = fields
                .iter()
                .map(|(k, v)| (k.clone(), json!({"type": v})))
                .collect();
            let reversed: Map<String, Value> = fields
                .iter()
                .rev()
                .map(|(k, v)| (k.clone(), json!({"type": v})))
                .collect();

            let a = IndexSchema::new(json!({"properties": Value::Object(forward)}));
            let b = IndexSchema::new(json!({"properties": Value::Object(reversed)}));
            prop_assert_eq!(a.fingerprint(), b.fingerprint());
        }
    }
}
