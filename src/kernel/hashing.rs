//! Canonical hashing for ids, provenance, and tamper detection.
//!
//! Values are serialized with RFC 8785 (JCS) so key order and numeric
//! spelling never change a digest, then hashed with SHA-256 and rendered
//! as lowercase hex.

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors raised while canonicalizing a value.
#[derive(Debug, Error)]
pub enum HashError {
    /// The value could not be rendered as canonical JSON (e.g. NaN floats).
    #[error("failed to canonicalize value: {0}")]
    Canonicalization(String),
}

/// Render a value as canonical JSON bytes.
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when serialization fails.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, HashError> {
    serde_jcs::to_vec(value).map_err(|e| HashError::Canonicalization(e.to_string()))
}

/// Hash a value's canonical JSON form, returning lowercase hex SHA-256.
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when serialization fails.
pub fn canonical_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, HashError> {
    let bytes = canonical_bytes(value)?;
    Ok(hash_bytes(&bytes))
}

/// Hash raw bytes, returning lowercase hex SHA-256.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
