//! Content hashing helpers.
//!
//! All structured hashes are SHA-256 over canonical JSON: object keys sorted,
//! no insignificant whitespace. `serde_json::Value` keeps object keys in a
//! `BTreeMap`, so serializing through `Value` yields the canonical form.

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use super::errors::Result;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Canonical compact JSON text of a value
pub fn canonical_json(value: &Value) -> String {
    // Display for Value is compact and cannot fail
    value.to_string()
}

pub fn hash_json(value: &Value) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

/// Hash any serializable payload in canonical form
pub fn hash_serializable<T: Serialize + ?Sized>(payload: &T) -> Result<String> {
    let value = serde_json::to_value(payload)?;
    Ok(hash_json(&value))
}

/// Streaming SHA-256 of a file's contents
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn module_config_hash(module: &str, config: &Value) -> String {
    hash_json(&json!({
        "module": module,
        "config": config,
    }))
}

/// Input hash of one module attempt.
///
/// Dependency fingerprints are keyed by dependency name so the hash does not
/// depend on declaration order.
pub fn module_input_hash(
    transcript_content_hash: &str,
    module_config_hash: &str,
    module_version: &str,
    dependency_output_hashes: &BTreeMap<String, String>,
) -> String {
    let fingerprints: Vec<Value> = dependency_output_hashes
        .iter()
        .map(|(name, hash)| json!([name, hash]))
        .collect();
    hash_json(&json!({
        "transcript_content_hash": transcript_content_hash,
        "module_config_hash": module_config_hash,
        "module_version": module_version,
        "dependency_fingerprints": fingerprints,
    }))
}

pub fn pipeline_input_hash(transcript_content_hash: &str, pipeline_config_hash: &str) -> String {
    hash_json(&json!({
        "transcript_content_hash": transcript_content_hash,
        "pipeline_config_hash": pipeline_config_hash,
    }))
}

/// Output hash of a completed module.
///
/// Uses the sorted `(artifact_key, content_hash)` pairs of primary artifacts
/// when there are any, otherwise the module identity plus its payload.
pub fn output_hash(
    module: &str,
    module_version: &str,
    primary_artifacts: &[(String, String)],
    payload: &Value,
) -> String {
    if !primary_artifacts.is_empty() {
        let mut pairs = primary_artifacts.to_vec();
        pairs.sort();
        let value = Value::Array(pairs.into_iter().map(|(k, h)| json!([k, h])).collect());
        return hash_json(&value);
    }

    hash_json(&json!({
        "module": module,
        "module_version": module_version,
        "outputs": payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"d":2,"c":3}}"#).unwrap();
        assert_eq!(canonical_json(&a), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_input_hash_changes_with_dependency_output() {
        let mut deps = BTreeMap::new();
        deps.insert("stats".to_string(), "aaa".to_string());
        let first = module_input_hash("t", "c", "1", &deps);
        assert_eq!(first, module_input_hash("t", "c", "1", &deps));

        deps.insert("stats".to_string(), "bbb".to_string());
        assert_ne!(first, module_input_hash("t", "c", "1", &deps));
    }

    #[test]
    fn test_output_hash_ignores_artifact_order() {
        let a = vec![
            ("summary".to_string(), "h1".to_string()),
            ("chart".to_string(), "h2".to_string()),
        ];
        let mut b = a.clone();
        b.reverse();
        let payload = json!({});
        assert_eq!(output_hash("m", "1", &a, &payload), output_hash("m", "1", &b, &payload));
    }

    #[test]
    fn test_output_hash_falls_back_to_payload() {
        let one = output_hash("m", "1", &[], &json!({"score": 1}));
        let two = output_hash("m", "1", &[], &json!({"score": 2}));
        assert_ne!(one, two);
    }

    #[test]
    fn test_hash_file_matches_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        assert_eq!(hash_file(file.path()).unwrap(), sha256_hex(b"abc"));
    }
}
