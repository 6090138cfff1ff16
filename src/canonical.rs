//! Canonical JSON serialization and stable hashing.
//!
//! Every signature and content-addressed identifier in the kernel is
//! computed over the canonical form: UTF-8, lexicographically sorted object
//! keys, no insignificant whitespace, numbers in shortest decimal form, and
//! RFC-3339 UTC timestamps with a trailing `Z`. Two cells that disagree on
//! a single byte of the canonical form cannot interoperate, so the rules
//! live here and nowhere else.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a JSON value in canonical form.
///
/// Object keys are emitted in lexicographic byte order. Numbers rely on
/// `serde_json`'s shortest-form rendering (integers stay integers, floats
/// go through ryu). Strings use standard JSON escaping.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Canonical form as bytes, ready for signing or hashing.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    canonical_json(value).into_bytes()
}

/// Hex SHA-256 of a string's UTF-8 bytes.
pub fn stable_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hex SHA-256 of a JSON value's canonical form.
pub fn stable_hash_value(value: &Value) -> String {
    stable_hash(&canonical_json(value))
}

/// RFC-3339 UTC timestamp with trailing `Z`, microsecond precision.
///
/// Microseconds are always present so the same instant renders to the same
/// bytes regardless of sub-second content.
pub fn format_utc(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC-3339 timestamp, normalizing to UTC.
pub fn parse_utc(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json handles escaping; a String never fails to serialize.
            out.push_str(&serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string()));
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
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_else(|_| "\"\"".to_string()));
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_keys_sorted() {
        let value = json!({"zulu": 1, "alpha": 2, "mike": {"b": 1, "a": 2}});
        assert_eq!(
            canonical_json(&value),
            r#"{"alpha":2,"mike":{"a":2,"b":1},"zulu":1}"#
        );
    }

    #[test]
    fn test_no_insignificant_whitespace() {
        let value = json!({"a": [1, 2, 3], "b": "x y"});
        assert_eq!(canonical_json(&value), r#"{"a":[1,2,3],"b":"x y"}"#);
    }

    #[test]
    fn test_integers_stay_integers() {
        let value = json!({"count": 42, "score": 0.5});
        assert_eq!(canonical_json(&value), r#"{"count":42,"score":0.5}"#);
    }

    #[test]
    fn test_string_escaping() {
        let value = json!({"msg": "line\nbreak \"quoted\""});
        assert_eq!(
            canonical_json(&value),
            r#"{"msg":"line\nbreak \"quoted\""}"#
        );
    }

    #[test]
    fn test_stable_hash_deterministic() {
        let h1 = stable_hash("federate-alpha");
        let h2 = stable_hash("federate-alpha");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_stable_hash_value_ignores_key_order() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(stable_hash_value(&a), stable_hash_value(&b));
    }

    #[test]
    fn test_format_utc_trailing_z() {
        let ts = Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(format_utc(ts), "2023-01-01T12:00:00.000000Z");
    }

    #[test]
    fn test_parse_utc_normalizes_offset() {
        let parsed = parse_utc("2023-01-01T14:00:00+02:00").unwrap();
        assert_eq!(format_utc(parsed), "2023-01-01T12:00:00.000000Z");
    }

    // Canonical round trip: canonicalize(parse(s)) == s for system output.
    #[test]
    fn test_round_trip_stable() {
        let original = json!({
            "belief_id": "01ARZ3NDEKTSV4RRFFQ69G5FAV",
            "confidence": 0.85,
            "sources": ["obs-1", "obs-2"],
            "metadata": {"threat_type": "malware", "total_iocs": 17}
        });
        let s = canonical_json(&original);
        let reparsed: Value = serde_json::from_str(&s).unwrap();
        assert_eq!(canonical_json(&reparsed), s);
    }
}
