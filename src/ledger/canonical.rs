//! Canonical encoding and hash-chain digests.
//!
//! The canonical form is compact JSON with object keys sorted bytewise at
//! every depth, so two logically identical payloads always hash the same no
//! matter how they were built. Timestamps must already be strings or numbers
//! by the time they reach here.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// `prev_hash` of the first entry in a chain.
pub const GENESIS: &str = "GENESIS";

pub const PREV_HASH: &str = "prev_hash";
pub const EVENT_HASH: &str = "event_hash";

/// Deterministic compact JSON for `value`.
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // `Value::to_string` yields the JSON-escaped literal.
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
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

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `event_hash` for `payload` linked to `prev_hash`.
///
/// Any `event_hash` already present in `payload` is excluded and any
/// `prev_hash` is replaced, so the function can be used both to seal a new
/// entry and to re-check a stored one.
pub fn event_hash(payload: &Map<String, Value>, prev_hash: &str) -> String {
    let mut body = payload.clone();
    body.remove(EVENT_HASH);
    body.insert(PREV_HASH.to_string(), Value::String(prev_hash.to_string()));
    sha256_hex(canonical_string(&Value::Object(body)).as_bytes())
}
