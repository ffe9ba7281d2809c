//! Canonical JSON Form
//!
//! Deterministic serialization used as the exact byte input for every
//! signature and hash in the system.
//!
//! Rules:
//! - Object keys are sorted (byte order) and emitted without whitespace.
//! - Object members whose value is `Absent` are dropped.
//! - A sequence may not contain an `Absent` entry (a gap).
//! - Numbers must be finite.
//!
//! Two semantically equal values always produce the same string.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

/// Errors raised while canonicalizing a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanonicalError {
    /// A sequence has a hole at the given index.
    #[error("sparse sequence: missing entry at index {index}")]
    SparseSequence {
        /// Index of the gap.
        index: usize,
    },
    /// A top-level value is absent.
    #[error("cannot canonicalize an absent value")]
    AbsentRoot,
    /// NaN or infinity.
    #[error("non-finite number")]
    NonFiniteNumber,
    /// The value could not be converted to JSON.
    #[error("serialization failed: {0}")]
    Serialize(String),
}

/// A JSON-like value that can also express "absent" (undefined).
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalValue {
    /// No value at all. Dropped inside objects, rejected inside sequences.
    Absent,
    /// JSON null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Number (integer or finite float).
    Number(serde_json::Number),
    /// Raw float, checked for finiteness when emitted.
    Float(f64),
    /// String.
    String(String),
    /// Ordered sequence.
    Array(Vec<CanonicalValue>),
    /// Object; key order is irrelevant, output is always sorted.
    Object(BTreeMap<String, CanonicalValue>),
}

impl From<serde_json::Value> for CanonicalValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => CanonicalValue::Null,
            Value::Bool(b) => CanonicalValue::Bool(b),
            Value::Number(n) => CanonicalValue::Number(n),
            Value::String(s) => CanonicalValue::String(s),
            Value::Array(items) => {
                CanonicalValue::Array(items.into_iter().map(CanonicalValue::from).collect())
            }
            Value::Object(map) => CanonicalValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, CanonicalValue::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Canonicalize any serializable value.
///
/// `Option::None` fields marked `skip_serializing_if` never reach the
/// canonical form; plain `None` fields serialize as `null`.
pub fn canonicalize<T: Serialize + ?Sized>(value: &T) -> Result<String, CanonicalError> {
    let json =
        serde_json::to_value(value).map_err(|e| CanonicalError::Serialize(e.to_string()))?;
    canonicalize_value(&CanonicalValue::from(json))
}

/// Canonicalize and encode as UTF-8 bytes for hashing and signing.
pub fn canonicalize_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CanonicalError> {
    canonicalize(value).map(String::into_bytes)
}

/// Canonicalize an explicit [`CanonicalValue`].
pub fn canonicalize_value(value: &CanonicalValue) -> Result<String, CanonicalError> {
    if matches!(value, CanonicalValue::Absent) {
        return Err(CanonicalError::AbsentRoot);
    }
    let mut out = String::new();
    write_value(value, &mut out)?;
    Ok(out)
}

fn write_value(value: &CanonicalValue, out: &mut String) -> Result<(), CanonicalError> {
    match value {
        // Callers filter absent members before recursing.
        CanonicalValue::Absent => return Err(CanonicalError::AbsentRoot),
        CanonicalValue::Null => out.push_str("null"),
        CanonicalValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        CanonicalValue::Number(n) => {
            if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return Err(CanonicalError::NonFiniteNumber);
                }
            }
            out.push_str(&n.to_string());
        }
        CanonicalValue::Float(f) => {
            let n = serde_json::Number::from_f64(*f).ok_or(CanonicalError::NonFiniteNumber)?;
            out.push_str(&n.to_string());
        }
        CanonicalValue::String(s) => write_string(s, out)?,
        CanonicalValue::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if matches!(item, CanonicalValue::Absent) {
                    return Err(CanonicalError::SparseSequence { index });
                }
                if index > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        CanonicalValue::Object(map) => {
            out.push('{');
            let mut first = true;
            for (key, item) in map {
                if matches!(item, CanonicalValue::Absent) {
                    continue;
                }
                if !first {
                    out.push(',');
                }
                first = false;
                write_string(key, out)?;
                out.push(':');
                write_value(item, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_string(s: &str, out: &mut String) -> Result<(), CanonicalError> {
    let escaped = serde_json::to_string(s).map_err(|e| CanonicalError::Serialize(e.to_string()))?;
    out.push_str(&escaped);
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn obj(entries: Vec<(&str, CanonicalValue)>) -> CanonicalValue {
        CanonicalValue::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    #[test]
    fn test_sorted_keys_no_whitespace() {
        let value = json!({ "b": 1, "a": { "d": [1, 2], "c": "x" } });
        let out = canonicalize(&value).unwrap();
        assert_eq!(out, r#"{"a":{"c":"x","d":[1,2]},"b":1}"#);
    }

    #[test]
    fn test_absent_members_are_stripped() {
        let value = obj(vec![
            ("keep", CanonicalValue::Bool(true)),
            ("drop", CanonicalValue::Absent),
            ("nested", obj(vec![("gone", CanonicalValue::Absent)])),
        ]);
        assert_eq!(
            canonicalize_value(&value).unwrap(),
            r#"{"keep":true,"nested":{}}"#
        );
    }

    #[test]
    fn test_null_is_kept() {
        let value = json!({ "a": null });
        assert_eq!(canonicalize(&value).unwrap(), r#"{"a":null}"#);
    }

    #[test]
    fn test_sparse_sequence_rejected() {
        let value = CanonicalValue::Array(vec![
            CanonicalValue::Bool(true),
            CanonicalValue::Absent,
            CanonicalValue::Null,
        ]);
        assert_eq!(
            canonicalize_value(&value),
            Err(CanonicalError::SparseSequence { index: 1 })
        );
    }

    #[test]
    fn test_nested_gap_rejected() {
        let value = obj(vec![(
            "cards",
            CanonicalValue::Array(vec![CanonicalValue::Absent]),
        )]);
        assert!(matches!(
            canonicalize_value(&value),
            Err(CanonicalError::SparseSequence { index: 0 })
        ));
    }

    #[test]
    fn test_absent_root_rejected() {
        assert_eq!(
            canonicalize_value(&CanonicalValue::Absent),
            Err(CanonicalError::AbsentRoot)
        );
    }

    #[test]
    fn test_non_finite_rejected() {
        assert_eq!(
            canonicalize_value(&CanonicalValue::Float(f64::NAN)),
            Err(CanonicalError::NonFiniteNumber)
        );
        assert_eq!(
            canonicalize_value(&CanonicalValue::Float(f64::INFINITY)),
            Err(CanonicalError::NonFiniteNumber)
        );
    }

    #[test]
    fn test_string_escaping() {
        let value = json!({ "name": "Jace, \"the\" Mind\nSculptor" });
        assert_eq!(
            canonicalize(&value).unwrap(),
            r#"{"name":"Jace, \"the\" Mind\nSculptor"}"#
        );
    }

    #[test]
    fn test_bytes_match_string() {
        let value = json!({ "z": 0, "y": [true] });
        assert_eq!(
            canonicalize_bytes(&value).unwrap(),
            canonicalize(&value).unwrap().into_bytes()
        );
    }

    /// Serializes as an object, emitting entries in vec order.
    #[derive(Debug)]
    struct Ordered(Vec<(String, i64)>);

    impl Serialize for Ordered {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            use serde::ser::SerializeMap;
            let mut map = serializer.serialize_map(Some(self.0.len()))?;
            for (key, value) in &self.0 {
                map.serialize_entry(key, value)?;
            }
            map.end()
        }
    }

    fn entries_and_permutation() -> impl Strategy<Value = (Vec<(String, i64)>, Vec<(String, i64)>)> {
        proptest::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..12)
            .prop_map(|entries| entries.into_iter().collect::<Vec<_>>())
            .prop_flat_map(|entries| (Just(entries.clone()), Just(entries).prop_shuffle()))
    }

    proptest! {
        #[test]
        fn test_key_order_permutation_is_stable((sorted, shuffled) in entries_and_permutation()) {
            let reversed: Vec<_> = sorted.iter().rev().cloned().collect();

            let a = canonicalize(&Ordered(sorted)).unwrap();
            let b = canonicalize(&Ordered(shuffled)).unwrap();
            let c = canonicalize(&Ordered(reversed)).unwrap();
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(&a, &c);
        }

        #[test]
        fn test_any_gap_is_rejected(len in 1usize..10, gap_seed in any::<usize>()) {
            let gap = gap_seed % len;
            let items: Vec<CanonicalValue> = (0..len)
                .map(|i| if i == gap { CanonicalValue::Absent } else { CanonicalValue::Bool(true) })
                .collect();
            prop_assert_eq!(
                canonicalize_value(&CanonicalValue::Array(items)),
                Err(CanonicalError::SparseSequence { index: gap })
            );
        }
    }
}
