//! Canonicalizing hasher and dependency snapshots.
//!
//! A [`ContentAddress`] is the SHA-256 of a canonical JSON serialization:
//! object keys sorted, no insignificant whitespace, `,` and `:` separators.
//! Two structurally identical values always hash identically regardless of the
//! order their fields were inserted in.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{JudgementError, Result};

/// Hex-encoded SHA-256 digest of a canonicalized value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentAddress(String);

impl ContentAddress {
    /// Wrap a previously stored digest.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical JSON text of `value`.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)
        .map_err(|e| JudgementError::validation(format!("value is not serializable: {e}")))?;
    let mut out = String::new();
    write_canonical(&value, &mut out);
    Ok(out)
}

/// Content address of any serializable value.
pub fn content_address<T: Serialize + ?Sized>(value: &T) -> Result<ContentAddress> {
    let canonical = canonical_json(value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(ContentAddress(format!("{:x}", hasher.finalize())))
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Serializing a string cannot fail.
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(val, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// ---------------------------------------------------------------------------
// DependencySnapshot
// ---------------------------------------------------------------------------

/// Signal name -> scalar read from the evidence base for one artifact key.
/// Built fresh on every staleness check and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependencySnapshot(BTreeMap<String, serde_json::Value>);

impl DependencySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a signal, replacing any previous value.
    pub fn insert(&mut self, signal: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(signal.into(), value.into());
    }

    pub fn get(&self, signal: &str) -> Option<&serde_json::Value> {
        self.0.get(signal)
    }

    pub fn signals(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Content address of this snapshot.
    pub fn address(&self) -> Result<ContentAddress> {
        content_address(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let a = json!({"b": 1, "a": {"d": [2, {"z": 1, "y": 0}], "c": "x"}});
        let b = json!({"a": {"c": "x", "d": [2, {"y": 0, "z": 1}]}, "b": 1});
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
        assert_eq!(
            canonical_json(&a).unwrap(),
            r#"{"a":{"c":"x","d":[2,{"y":0,"z":1}]},"b":1}"#
        );
    }

    #[test]
    fn address_is_stable_across_processes() {
        let mut snapshot = DependencySnapshot::new();
        snapshot.insert("doc_count", 5);
        assert_eq!(
            snapshot.address().unwrap().as_str(),
            "65e6557ab69798249aa407ca91b30359df5c7f41a9cfdcdd81cab9aa7196583b"
        );

        snapshot.insert("doc_count", 6);
        assert_eq!(
            snapshot.address().unwrap().as_str(),
            "6a0a7144dc2ef8823b26fe75ff2a24948366c6fa03a61cc90a08a50805d22a39"
        );
    }

    #[test]
    fn hash_map_and_snapshot_agree() {
        let mut map = HashMap::new();
        map.insert("x", json!(1));
        map.insert("a", json!("t"));
        let mut snapshot = DependencySnapshot::new();
        snapshot.insert("a", "t");
        snapshot.insert("x", 1);
        assert_eq!(content_address(&map).unwrap(), snapshot.address().unwrap());
    }

    #[test]
    fn null_and_missing_differ() {
        let mut with_null = DependencySnapshot::new();
        with_null.insert("ingest_completed_at", serde_json::Value::Null);
        let without = DependencySnapshot::new();
        assert_ne!(with_null.address().unwrap(), without.address().unwrap());
    }

    proptest! {
        #[test]
        fn address_ignores_insertion_order(
            fields in prop::collection::btree_map("[a-z_]{1,12}", any::<i64>(), 1..16)
        ) {
            let mut forward = DependencySnapshot::new();
            for (k, v) in fields.iter() {
                forward.insert(k.clone(), *v);
            }
            let mut reverse = DependencySnapshot::new();
            for (k, v) in fields.iter().rev() {
                reverse.insert(k.clone(), *v);
            }
            prop_assert_eq!(forward.address().unwrap(), reverse.address().unwrap());
        }

        #[test]
        fn perturbing_a_tracked_field_changes_address(
            fields in prop::collection::btree_map("[a-z_]{1,12}", any::<i64>(), 1..16),
            pick in any::<prop::sample::Index>(),
            delta in 1i64..1_000_000,
        ) {
            let mut original = DependencySnapshot::new();
            for (k, v) in fields.iter() {
                original.insert(k.clone(), *v);
            }
            let keys: Vec<&String> = fields.keys().collect();
            let target = pick.get(&keys);

            let mut perturbed = original.clone();
            perturbed.insert((*target).clone(), fields[*target].wrapping_add(delta));

            prop_assert_ne!(original.address().unwrap(), perturbed.address().unwrap());
        }

        #[test]
        fn string_signals_change_address(
            a in "[ -~]{0,24}",
            b in "[ -~]{0,24}",
        ) {
            prop_assume!(a != b);
            let mut left = DependencySnapshot::new();
            left.insert("project_updated_at", a);
            let mut right = DependencySnapshot::new();
            right.insert("project_updated_at", b);
            prop_assert_ne!(left.address().unwrap(), right.address().unwrap());
        }
    }
}
