//! Symmetric signing of governance receipt cores.
//!
//! HMAC-SHA256 over the canonical JSON bytes of a receipt core. The key is
//! resolved on every call so rotating or removing it takes effect without a
//! restart. With no key available, signing degrades to unsigned output and
//! every verification fails.

use std::path::PathBuf;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;

use super::hashing::{canonical_bytes, hash_bytes, HashError};
use crate::credentials::load_credentials;

type HmacSha256 = Hmac<Sha256>;

/// Algorithm tag stored alongside every signature.
pub const SIGNATURE_ALGORITHM: &str = "hmac-sha256";

/// Number of hex characters kept from the key digest as the key id.
const KEY_ID_HEX_LEN: usize = 16;

/// Signing errors.
#[derive(Debug, Error)]
pub enum SigningError {
    /// The signed core could not be canonicalized.
    #[error(transparent)]
    Canonicalization(#[from] HashError),
    /// The MAC could not be initialised from the key.
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    /// Signing is required but no key is configured.
    #[error("signing key unavailable (checked env var {0})")]
    KeyUnavailable(String),
}

/// Where the signing key comes from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Named environment variable, with an optional `.env` file consulted
    /// when the variable is unset.
    Env {
        /// Environment variable name.
        var: String,
        /// Optional `.env` fallback path.
        fallback: Option<PathBuf>,
    },
    /// Fixed key material (`None` means unsigned).
    Static(Option<Vec<u8>>),
}

/// Signature material attached to a receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Algorithm tag, always [`SIGNATURE_ALGORITHM`].
    pub algorithm: String,
    /// Non-reversible identifier of the key that produced the signature.
    pub key_id: String,
    /// Lowercase hex MAC.
    pub value: String,
}

/// HMAC signer/verifier over canonical cores.
#[derive(Debug, Clone)]
pub struct SignatureProvider {
    source: KeySource,
}

impl SignatureProvider {
    /// Create a provider reading its key from the given source.
    pub fn new(source: KeySource) -> Self {
        Self { source }
    }

    /// Provider that reads `var` from the environment at call time.
    pub fn from_env(var: impl Into<String>, fallback: Option<PathBuf>) -> Self {
        Self::new(KeySource::Env {
            var: var.into(),
            fallback,
        })
    }

    /// Provider with a fixed key.
    pub fn with_key(key: impl Into<Vec<u8>>) -> Self {
        Self::new(KeySource::Static(Some(key.into())))
    }

    /// Provider that never signs.
    pub fn unsigned() -> Self {
        Self::new(KeySource::Static(None))
    }

    /// Human-readable description of where the key is looked up.
    pub fn source_label(&self) -> String {
        match &self.source {
            KeySource::Env { var, .. } => var.clone(),
            KeySource::Static(_) => "<static>".to_owned(),
        }
    }

    /// Whether a key is currently available.
    pub fn is_configured(&self) -> bool {
        self.current_key().is_some()
    }

    /// Sign a core, returning `None` when no key is configured.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError`] if the core cannot be canonicalized or the
    /// MAC cannot be built.
    pub fn sign<T: Serialize + ?Sized>(&self, core: &T) -> Result<Option<Signature>, SigningError> {
        let Some(key) = self.current_key() else {
            return Ok(None);
        };
        let payload = canonical_bytes(core)?;
        let value = compute_mac(&key, &payload)?;
        Ok(Some(Signature {
            algorithm: SIGNATURE_ALGORITHM.to_owned(),
            key_id: key_id(&key),
            value,
        }))
    }

    /// Check a stored signature against a reconstructed core.
    ///
    /// Returns `false` for unknown algorithms, a different key id, a missing
    /// key, or a MAC mismatch.
    pub fn verify<T: Serialize + ?Sized>(
        &self,
        core: &T,
        algorithm: &str,
        stored_key_id: &str,
        signature: &str,
    ) -> bool {
        if algorithm != SIGNATURE_ALGORITHM {
            return false;
        }
        let Some(key) = self.current_key() else {
            return false;
        };
        if key_id(&key) != stored_key_id {
            return false;
        }
        let Ok(payload) = canonical_bytes(core) else {
            return false;
        };
        let Ok(computed) = compute_mac(&key, &payload) else {
            return false;
        };
        constant_time_hex_eq(signature, &computed)
    }

    fn current_key(&self) -> Option<Vec<u8>> {
        match &self.source {
            KeySource::Static(key) => key.clone().filter(|k| !k.is_empty()),
            KeySource::Env { var, fallback } => {
                if let Ok(value) = std::env::var(var) {
                    if !value.trim().is_empty() {
                        return Some(value.into_bytes());
                    }
                }
                let path = fallback.as_ref()?;
                match load_credentials(path) {
                    Ok(creds) => creds.get(var).map(|v| v.as_bytes().to_vec()),
                    Err(e) => {
                        warn!(error = %e, "ignoring unreadable credentials file");
                        None
                    }
                }
            }
        }
    }
}

/// Derive the stored key identifier: a truncated SHA-256 of the key.
fn key_id(key: &[u8]) -> String {
    let digest = hash_bytes(key);
    digest.chars().take(KEY_ID_HEX_LEN).collect()
}

fn compute_mac(key: &[u8], payload: &[u8]) -> Result<String, SigningError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| SigningError::InvalidKey(e.to_string()))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn constant_time_hex_eq(stored: &str, computed: &str) -> bool {
    let (Ok(expected), Ok(actual)) = (hex::decode(stored), hex::decode(computed)) else {
        return false;
    };
    if expected.len() != actual.len() {
        return false;
    }
    expected.ct_eq(actual.as_slice()).into()
}
