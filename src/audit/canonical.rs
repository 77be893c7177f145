//! Canonical Encoding and Chain Hashing
//!
//! Produces the deterministic byte sequence that an entry's hash commits
//! to, and the SHA-256 chain digest over `previous_hash || encoding`.
//!
//! Layout (schema v1): a domain tag, the big-endian `u32` schema version,
//! then every hashed field in fixed order as
//! `u16 name length | name | u32 value length | value`. Optional fields
//! carry a one-byte presence marker before the value. `sequence` and
//! `current_hash` are never encoded; `previous_hash` enters the digest
//! separately.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::audit::entry::AuditEntry;
use crate::error::{AuditError, Result};

/// Schema version written into new entries.
pub const CANONICAL_SCHEMA_VERSION: u32 = 1;

/// `previous_hash` of the first entry ever appended.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Length of a hex-rendered SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

const DOMAIN_TAG: &[u8] = b"compliance-audit/entry";

/// Encode an entry's immutable fields using the schema version it was
/// written with.
pub fn encode(entry: &AuditEntry) -> Result<Vec<u8>> {
    match entry.schema_version {
        1 => Ok(encode_v1(entry)),
        other => Err(AuditError::UnsupportedSchemaVersion(other)),
    }
}

fn encode_v1(entry: &AuditEntry) -> Vec<u8> {
    let mut w = CanonicalWriter::new(1);
    w.field("id", entry.id.to_string().as_bytes());
    w.field("trace_id", entry.trace_id.as_bytes());
    w.field("actor_id", entry.actor_id.as_bytes());
    w.field("actor_type", entry.actor_type.as_str().as_bytes());
    w.field("action", entry.action.as_str().as_bytes());
    w.field("resource", entry.resource.as_bytes());
    w.field("resource_id", entry.resource_id.as_bytes());
    w.field("operation", entry.operation.as_bytes());
    w.field("outcome", entry.outcome.as_str().as_bytes());
    w.field("severity", entry.severity.as_str().as_bytes());
    w.field("payload", canonical_json(&Value::Object(entry.payload.clone())).as_bytes());
    w.field("metadata", canonical_metadata(entry).as_bytes());
    w.optional_field("source_ip", entry.source_ip.as_deref());
    w.optional_field("user_agent", entry.user_agent.as_deref());
    w.field("timestamp", format_timestamp(&entry.timestamp).as_bytes());
    w.field("created_at", format_timestamp(&entry.created_at).as_bytes());
    w.finish()
}

/// Compute `sha256(previous_hash || encoded)` as lowercase hex.
pub fn chain_hash(previous_hash: &str, encoded: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(encoded);
    hex::encode(hasher.finalize())
}

/// Recompute the hash an entry should carry given its stored linkage.
pub fn compute_entry_hash(entry: &AuditEntry) -> Result<String> {
    let encoded = encode(entry)?;
    Ok(chain_hash(&entry.previous_hash, &encoded))
}

pub fn is_well_formed_hash(value: &str) -> bool {
    value.len() == HASH_HEX_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

struct CanonicalWriter {
    buf: Vec<u8>,
}

impl CanonicalWriter {
    fn new(schema_version: u32) -> Self {
        let mut buf = Vec::with_capacity(512);
        buf.extend_from_slice(DOMAIN_TAG);
        buf.extend_from_slice(&schema_version.to_be_bytes());
        Self { buf }
    }

    fn field(&mut self, name: &str, value: &[u8]) {
        self.name(name);
        self.value(value);
    }

    fn optional_field(&mut self, name: &str, value: Option<&str>) {
        self.name(name);
        match value {
            Some(v) => {
                self.buf.push(1);
                self.value(v.as_bytes());
            }
            None => self.buf.push(0),
        }
    }

    fn name(&mut self, name: &str) {
        self.buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(name.as_bytes());
    }

    fn value(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(value);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Serialize a JSON value with object keys sorted at every depth.
///
/// Independent of whether `serde_json` was built with `preserve_order`.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical_json(value, &mut out);
    out
}

fn write_canonical_json(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_json_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_json(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_canonical_json(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn write_json_string(s: &str, out: &mut String) {
    // Serializing a &str cannot fail.
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => out.push_str("\"\""),
    }
}

fn canonical_metadata(entry: &AuditEntry) -> String {
    // BTreeMap iterates in key order.
    let object = entry
        .metadata
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    canonical_json(&Value::Object(object))
}

/// Fixed-precision UTC rendering used for hashing and storage.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AuditError::Serialization(format!("Invalid timestamp '{}': {}", value, e)))
}

/// Drop sub-microsecond precision so a timestamp survives storage unchanged.
pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::tests::sample_entry;
    use serde_json::json;

    #[test]
    fn test_genesis_is_well_formed() {
        assert!(is_well_formed_hash(GENESIS_HASH));
        assert!(!is_well_formed_hash("ABCDEF"));
        assert!(!is_well_formed_hash(&"G".repeat(64)));
    }

    #[test]
    fn test_chain_hash_shape() {
        let hash = chain_hash(GENESIS_HASH, b"payload");
        assert_eq!(hash.len(), HASH_HEX_LEN);
        assert!(is_well_formed_hash(&hash));
        assert_ne!(hash, chain_hash(GENESIS_HASH, b"payload2"));
        assert_ne!(hash, chain_hash(&"1".repeat(64), b"payload"));
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let a = json!({"b": 1, "a": {"z": true, "y": [3, {"k": "v", "j": null}]}});
        assert_eq!(
            canonical_json(&a),
            r#"{"a":{"y":[3,{"j":null,"k":"v"}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn test_encoding_ignores_insertion_order() {
        let mut first = sample_entry();
        first.payload = serde_json::Map::new();
        first.payload.insert("wallet".into(), json!("bc1q"));
        first.payload.insert("amount".into(), json!(42));

        let mut second = first.clone();
        second.payload = serde_json::Map::new();
        second.payload.insert("amount".into(), json!(42));
        second.payload.insert("wallet".into(), json!("bc1q"));

        assert_eq!(encode(&first).unwrap(), encode(&second).unwrap());
    }

    #[test]
    fn test_encoding_excludes_hash_fields() {
        let entry = sample_entry();
        let mut relinked = entry.clone();
        relinked.current_hash = "f".repeat(64);
        relinked.sequence = 99;
        assert_eq!(encode(&entry).unwrap(), encode(&relinked).unwrap());
    }

    #[test]
    fn test_optional_presence_is_distinguished() {
        let mut absent = sample_entry();
        absent.user_agent = None;
        let mut empty = absent.clone();
        empty.user_agent = Some(String::new());
        assert_ne!(encode(&absent).unwrap(), encode(&empty).unwrap());
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        let mut left = sample_entry();
        left.resource = "wallet".into();
        left.resource_id = "abc".into();
        let mut right = left.clone();
        right.resource = "walleta".into();
        right.resource_id = "bc".into();
        assert_ne!(encode(&left).unwrap(), encode(&right).unwrap());
    }

    #[test]
    fn test_unknown_schema_version_rejected() {
        let mut entry = sample_entry();
        entry.schema_version = 7;
        assert!(matches!(encode(&entry), Err(AuditError::UnsupportedSchemaVersion(7))));
    }

    #[test]
    fn test_timestamp_round_trip_is_exact() {
        let now = truncate_to_micros(Utc::now());
        let rendered = format_timestamp(&now);
        assert!(rendered.ends_with('Z'));
        assert_eq!(rendered.len(), "2024-01-01T00:00:00.000000Z".len());
        assert_eq!(parse_timestamp(&rendered).unwrap(), now);
    }
}
