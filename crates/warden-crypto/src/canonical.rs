//! Canonical JSON encoding.
//!
//! One encoder, two consumers: the certificate engine hashes token
//! payloads and the ledger hashes entries. The rules:
//!
//! - object keys sorted lexicographically (byte order)
//! - `null` fields written explicitly
//! - numbers in their shortest decimal form (serde_json's formatting)
//! - strings as plain JSON strings with standard escaping
//! - no insignificant whitespace
//!
//! Timestamps must already be RFC 3339 strings by the time a value
//! reaches this module; [`warden_core::Timestamp`]'s serializer
//! guarantees that upstream.

use serde_json::Value;

use crate::hash::ContentHash;

/// Encode a JSON value canonically.
#[must_use]
pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

/// SHA-256 of the canonical encoding.
#[must_use]
pub fn canonical_hash(value: &Value) -> ContentHash {
    ContentHash::hash(to_canonical_string(value).as_bytes())
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        },
        Value::Object(map) => {
            // serde_json's default map already iterates in sorted key
            // order, but sort explicitly so the encoding does not
            // depend on the `preserve_order` feature being absent.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                // Key came out of the map, lookup cannot fail.
                if let Some(v) = map.get(*key) {
                    write_value(out, v);
                }
            }
            out.push('}');
        },
    }
}

fn write_string(out: &mut String, s: &str) {
    // serde_json handles the full JSON escape table.
    match serde_json::to_string(s) {
        Ok(escaped) => out.push_str(&escaped),
        Err(_) => out.push_str("\"\""), // unreachable for &str
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted() {
        let v = json!({"b": 1, "a": 2, "c": {"z": null, "y": true}});
        assert_eq!(
            to_canonical_string(&v),
            r#"{"a":2,"b":1,"c":{"y":true,"z":null}}"#
        );
    }

    #[test]
    fn test_null_is_explicit() {
        let v = json!({"tool": null});
        assert_eq!(to_canonical_string(&v), r#"{"tool":null}"#);
    }

    #[test]
    fn test_arrays_keep_order() {
        let v = json!(["b", "a", 3, 1]);
        assert_eq!(to_canonical_string(&v), r#"["b","a",3,1]"#);
    }

    #[test]
    fn test_string_escaping() {
        let v = json!({"k": "line\nbreak \"quoted\""});
        assert_eq!(
            to_canonical_string(&v),
            r#"{"k":"line\nbreak \"quoted\""}"#
        );
    }

    #[test]
    fn test_hash_is_order_independent() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn test_hash_differs_on_content() {
        let a = json!({"x": 1});
        let b = json!({"x": 2});
        assert_ne!(canonical_hash(&a), canonical_hash(&b));
    }
}
