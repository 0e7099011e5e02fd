//! Governance ledger: append-only, optionally signed decision receipts.
//!
//! A receipt records a human (or delegated) decision about one actuator
//! invocation. Its id is the canonical hash of a small core
//! (`timestamp, actionId, payloadHash, evidenceHash, decision, decidedBy`),
//! and when a signing key is configured the same core is HMAC-signed. The
//! full receipt, raw payload and evidence included, is appended as one
//! JSON line.
//!
//! Lookups go through an id → byte-offset index built when the ledger is
//! opened. Unknown ids trigger a scan of only the bytes appended since the
//! last scan, so receipts written by another process are still found.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::audit::LedgerError;
use super::hashing::{canonical_hash, HashError};
use super::signing::{SignatureProvider, SigningError};

/// Pointer scheme reported for governance receipts.
pub const RECEIPT_POINTER_SCHEME: &str = "governance-ledger";

/// A governance decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    /// The action may run.
    Approve,
    /// The action may not run.
    Deny,
}

impl Decision {
    /// Wire form (`APPROVE` / `DENY`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "APPROVE",
            Self::Deny => "DENY",
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "APPROVE" => Ok(Self::Approve),
            "DENY" => Ok(Self::Deny),
            other => Err(format!("unknown decision: {other}")),
        }
    }
}

/// The signed subset of a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptCore {
    /// Decision time (RFC 3339).
    pub timestamp: String,
    /// Rune the decision applies to.
    pub action_id: String,
    /// Canonical hash of the action payload.
    pub payload_hash: String,
    /// Canonical hash of the evidence bundle.
    pub evidence_hash: String,
    /// The decision itself.
    pub decision: Decision,
    /// Who decided.
    pub decided_by: String,
}

/// A stored governance receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceReceipt {
    /// Canonical hash of the core.
    pub id: String,
    /// Rune the decision applies to.
    pub action_operation_id: String,
    /// The exact payload that was decided on.
    pub action_payload: Value,
    /// Evidence presented with the decision.
    pub evidence_bundle: Value,
    /// The decision.
    pub decision: Decision,
    /// Who decided.
    pub decided_by: String,
    /// Optional free-text reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Decision time (RFC 3339).
    pub timestamp: String,
    /// Signature algorithm tag, when signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig_alg: Option<String>,
    /// Non-reversible key identifier, when signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// Hex MAC over the canonical core, when signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl GovernanceReceipt {
    /// Rebuild the signed core from this receipt's stored fields.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] if the payload or evidence cannot be hashed.
    pub fn core(&self) -> Result<ReceiptCore, HashError> {
        Ok(ReceiptCore {
            timestamp: self.timestamp.clone(),
            action_id: self.action_operation_id.clone(),
            payload_hash: canonical_hash(&self.action_payload)?,
            evidence_hash: canonical_hash(&self.evidence_bundle)?,
            decision: self.decision,
            decided_by: self.decided_by.clone(),
        })
    }

    /// Whether the receipt carries signature material.
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}

/// Inputs for a new receipt.
#[derive(Debug, Clone)]
pub struct ReceiptRequest {
    /// Rune the decision applies to.
    pub action_operation_id: String,
    /// Exact payload being decided on.
    pub action_payload: Value,
    /// Evidence presented with the decision.
    pub evidence_bundle: Value,
    /// The decision.
    pub decision: Decision,
    /// Who decided.
    pub decided_by: String,
    /// Optional reason.
    pub reason: Option<String>,
}

/// Lightweight reference to a stored receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptPointer {
    /// Always [`RECEIPT_POINTER_SCHEME`].
    pub scheme: String,
    /// Ledger file path.
    pub path: String,
    /// Receipt id.
    pub hash: String,
}

#[derive(Debug, Default)]
struct ReceiptIndex {
    offsets: HashMap<String, u64>,
    scanned_to: u64,
}

#[derive(Deserialize)]
struct ReceiptId {
    id: String,
}

/// Append-only JSON-lines receipt store.
#[derive(Debug)]
pub struct GovernanceLedger {
    path: PathBuf,
    signer: SignatureProvider,
    require_signing: bool,
    index: Mutex<ReceiptIndex>,
}

impl GovernanceLedger {
    /// Open the ledger at `path`, indexing any existing receipts.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the existing file cannot be read.
    pub fn open(path: impl Into<PathBuf>, signer: SignatureProvider) -> Result<Self, LedgerError> {
        let ledger = Self {
            path: path.into(),
            signer,
            require_signing: false,
            index: Mutex::new(ReceiptIndex::default()),
        };
        {
            let mut index = ledger.index.lock().map_err(|_| LedgerError::Poisoned)?;
            ledger.scan_new(&mut index)?;
            debug!(
                path = %ledger.path.display(),
                receipts = index.offsets.len(),
                "governance ledger indexed"
            );
        }
        Ok(ledger)
    }

    /// Fail instead of writing unsigned receipts when no key is available.
    pub fn with_required_signing(mut self, require: bool) -> Self {
        self.require_signing = require;
        self
    }

    /// Ledger file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether unsigned receipts are refused.
    pub fn requires_signing(&self) -> bool {
        self.require_signing
    }

    /// Error out when signing is required but no key is available.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::KeyUnavailable`] in that case.
    pub fn ensure_signing_ready(&self) -> Result<(), SigningError> {
        if self.require_signing && !self.signer.is_configured() {
            return Err(SigningError::KeyUnavailable(self.signer.source_label()));
        }
        Ok(())
    }

    /// Build, sign, and append a receipt.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if hashing, signing, or the append fails, or
    /// if signing is required and no key is configured.
    pub fn record_receipt(&self, request: ReceiptRequest) -> Result<ReceiptPointer, LedgerError> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let core = ReceiptCore {
            timestamp: timestamp.clone(),
            action_id: request.action_operation_id.clone(),
            payload_hash: canonical_hash(&request.action_payload)?,
            evidence_hash: canonical_hash(&request.evidence_bundle)?,
            decision: request.decision,
            decided_by: request.decided_by.clone(),
        };
        let id = canonical_hash(&core)?;
        let signature = self.signer.sign(&core)?;
        if signature.is_none() {
            if self.require_signing {
                return Err(SigningError::KeyUnavailable(self.signer.source_label()).into());
            }
            warn!(
                receipt_id = %id,
                "recording unsigned governance receipt; no signing key configured"
            );
        }

        let receipt = GovernanceReceipt {
            id: id.clone(),
            action_operation_id: request.action_operation_id,
            action_payload: request.action_payload,
            evidence_bundle: request.evidence_bundle,
            decision: request.decision,
            decided_by: request.decided_by,
            reason: request.reason,
            timestamp,
            sig_alg: signature.as_ref().map(|s| s.algorithm.clone()),
            key_id: signature.as_ref().map(|s| s.key_id.clone()),
            signature: signature.map(|s| s.value),
        };

        let mut line = serde_json::to_string(&receipt)?;
        line.push('\n');

        let mut index = self.index.lock().map_err(|_| LedgerError::Poisoned)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let offset = file.metadata()?.len();
        file.write_all(line.as_bytes())?;
        file.flush()?;

        index.offsets.insert(id.clone(), offset);
        if index.scanned_to == offset {
            index.scanned_to = offset.saturating_add(u64::try_from(line.len()).unwrap_or(u64::MAX));
        }

        debug!(
            receipt_id = %id,
            decision = receipt.decision.as_str(),
            "governance receipt recorded"
        );
        Ok(ReceiptPointer {
            scheme: RECEIPT_POINTER_SCHEME.to_owned(),
            path: self.path.display().to_string(),
            hash: id,
        })
    }

    /// Look up a receipt by id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on I/O failure, or [`LedgerError::Corrupt`]
    /// if the indexed line no longer holds the requested receipt.
    pub fn find_receipt(&self, id: &str) -> Result<Option<GovernanceReceipt>, LedgerError> {
        let mut index = self.index.lock().map_err(|_| LedgerError::Poisoned)?;
        if !index.offsets.contains_key(id) {
            self.scan_new(&mut index)?;
        }
        let Some(offset) = index.offsets.get(id).copied() else {
            return Ok(None);
        };
        drop(index);

        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut line = String::new();
        BufReader::new(file).read_line(&mut line)?;
        let receipt: GovernanceReceipt = serde_json::from_str(line.trim_end())?;
        if receipt.id != id {
            return Err(LedgerError::Corrupt {
                line: 0,
                reason: format!("offset {offset} holds receipt {} instead of {id}", receipt.id),
            });
        }
        Ok(Some(receipt))
    }

    /// Check a receipt's signature against its own stored fields.
    ///
    /// Unsigned receipts never verify.
    pub fn verify_receipt(&self, receipt: &GovernanceReceipt) -> bool {
        let (Some(alg), Some(key_id), Some(signature)) = (
            receipt.sig_alg.as_deref(),
            receipt.key_id.as_deref(),
            receipt.signature.as_deref(),
        ) else {
            return false;
        };
        let Ok(core) = receipt.core() else {
            return false;
        };
        match canonical_hash(&core) {
            Ok(id) if id == receipt.id => {}
            _ => return false,
        }
        self.signer.verify(&core, alg, key_id, signature)
    }

    /// Index complete lines appended after `index.scanned_to`.
    fn scan_new(&self, index: &mut ReceiptIndex) -> Result<(), LedgerError> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(index.scanned_to))?;
        let mut reader = BufReader::new(file);
        let mut position = index.scanned_to;
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 || !line.ends_with('\n') {
                break;
            }
            match serde_json::from_str::<ReceiptId>(line.trim_end()) {
                Ok(parsed) => {
                    index.offsets.insert(parsed.id, position);
                }
                Err(e) => warn!(
                    offset = position,
                    error = %e,
                    "skipping malformed governance ledger line"
                ),
            }
            position = position.saturating_add(u64::try_from(read).unwrap_or(u64::MAX));
        }
        index.scanned_to = position;
        Ok(())
    }
}
