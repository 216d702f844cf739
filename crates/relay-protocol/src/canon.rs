//! Canonical JSON hashing.
//!
//! All derived identities hash the RFC 8785 JSON Canonicalization Scheme
//! (JCS) form of their inputs, so semantically identical structures produce
//! identical bytes regardless of key order or host locale.
//!
//! Identity derivations:
//! - `config_hash = sha256(JCS(config_inputs))`
//! - `run_id = sha256(JCS(config_inputs) || "\n" || source_tree_sha256_hex)`

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors from canonicalization and identity hashing.
#[derive(Debug, Error)]
pub enum CanonError {
    #[error("JCS canonicalization failed: {0}")]
    Jcs(String),

    #[error("non-integral number at {path}: hashable inputs must not contain floats")]
    NonIntegralNumber { path: String },
}

/// Compute SHA-256 of bytes and return lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Canonicalize any serializable value to its JCS byte form.
///
/// This does not apply the hashable-input number restriction; use
/// [`canonicalize_hashable`] for identity inputs.
pub fn canonicalize<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonError> {
    serde_json_canonicalizer::to_vec(value).map_err(|e| CanonError::Jcs(e.to_string()))
}

/// Check that a value is stable under hashing.
///
/// Floats do not round-trip exactly across serializers, so identity inputs
/// forbid them outright: every number must be exactly representable as
/// i64 or u64.
pub fn check_hashable(value: &Value) -> Result<(), CanonError> {
    check_hashable_at(value, "$")
}

fn check_hashable_at(value: &Value, path: &str) -> Result<(), CanonError> {
    match value {
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                Ok(())
            } else {
                Err(CanonError::NonIntegralNumber {
                    path: path.to_string(),
                })
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                check_hashable_at(item, &format!("{}[{}]", path, i))?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (key, item) in map {
                check_hashable_at(item, &format!("{}.{}", path, key))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Canonicalize an identity input, rejecting unstable values first.
pub fn canonicalize_hashable(value: &Value) -> Result<Vec<u8>, CanonError> {
    check_hashable(value)?;
    canonicalize(value)
}

/// Compute the config hash: `sha256(JCS(config_inputs))`.
///
/// This is the narrower cache-addressing key, independent of source content.
pub fn config_hash(config_inputs: &Value) -> Result<String, CanonError> {
    Ok(sha256_hex(&canonicalize_hashable(config_inputs)?))
}

/// Compute the run identity.
///
/// `run_id = sha256(JCS(config_inputs) || "\n" || source_tree_sha256_hex)`
pub fn run_id(config_inputs: &Value, source_tree_sha256: &str) -> Result<String, CanonError> {
    let mut bytes = canonicalize_hashable(config_inputs)?;
    bytes.push(b'\n');
    bytes.extend_from_slice(source_tree_sha256.as_bytes());
    Ok(sha256_hex(&bytes))
}
