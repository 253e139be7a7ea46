//! Cache key construction

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Key format is `{namespace}:{key}`
pub fn full_key(namespace: &str, key: &str) -> String {
    format!("{}:{}", namespace, key)
}

/// Prefix matching every key in `namespace`, and nothing in a sibling
/// namespace that merely shares a leading substring.
pub fn namespace_prefix(namespace: &str) -> String {
    format!("{}:", namespace.trim_end_matches(':'))
}

pub struct CacheKey;

impl CacheKey {
    /// `{namespace}:{qualifier}:{8-hex}` where the hex is taken from the
    /// SHA-256 of the params in canonical (key-sorted) JSON.
    pub fn with_params(namespace: &str, qualifier: &str, params: &Value) -> String {
        format!("{}:{}:{}", namespace, qualifier, Self::param_hash(params))
    }

    pub fn param_hash(params: &Value) -> String {
        let canonical = canonicalize(params).to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
