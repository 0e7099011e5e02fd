//! Append-only, hash-linked audit streams.
//!
//! Every successful dispatch is written twice: once to the invocation
//! ledger and once to the event almanac. The two streams are rooted at
//! different genesis ids and written independently, so [`cross_check`] can
//! later detect one being edited, truncated, or replaced.
//!
//! Entries are structured JSON, one per line. Each entry's id is the
//! canonical hash of its core fields plus the previous entry's id.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::dispatcher::ProvenanceBundle;
use super::hashing::{canonical_hash, hash_bytes, HashError};
use super::signing::SigningError;

/// Errors from the append-only stores (audit streams and governance ledger).
#[derive(Debug, Error)]
pub enum LedgerError {
    /// File I/O failed.
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// An entry could not be serialized or parsed.
    #[error("ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Canonical hashing failed.
    #[error(transparent)]
    Hash(#[from] HashError),
    /// Signing failed or was required but unavailable.
    #[error(transparent)]
    Signing(#[from] SigningError),
    /// Stored content does not match what its ids claim.
    #[error("ledger corrupt at line {line}: {reason}")]
    Corrupt {
        /// 1-based line number.
        line: usize,
        /// What failed to check out.
        reason: String,
    },
    /// A writer lock was poisoned.
    #[error("ledger lock poisoned")]
    Poisoned,
}

/// Which audit stream an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Per-call invocation ledger.
    InvocationLedger,
    /// Independent event almanac.
    EventAlmanac,
}

impl StreamKind {
    /// Stable stream name.
    pub fn name(self) -> &'static str {
        match self {
            Self::InvocationLedger => "invocation_ledger",
            Self::EventAlmanac => "event_almanac",
        }
    }

    /// Root id the first entry links back to.
    pub fn genesis(self) -> String {
        hash_bytes(format!("runespine:genesis:{}", self.name()).as_bytes())
    }
}

/// A single audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Hash of the entry core.
    pub id: String,
    /// Id of the previous entry, or the stream genesis.
    pub prev_id: String,
    /// Owning stream.
    pub stream: StreamKind,
    /// Wall-clock write time (RFC 3339).
    pub timestamp: String,
    /// Dispatched rune.
    pub operation_id: String,
    /// Request payload as received.
    pub payload: Value,
    /// Provenance bundle for the call.
    pub provenance: ProvenanceBundle,
    /// Caller source location.
    pub caller: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EntryCore<'a> {
    stream: StreamKind,
    prev_id: &'a str,
    timestamp: &'a str,
    operation_id: &'a str,
    payload_hash: String,
    provenance_hash: String,
    caller: &'a str,
}

impl LedgerEntry {
    fn compute_id(&self) -> Result<String, HashError> {
        canonical_hash(&EntryCore {
            stream: self.stream,
            prev_id: &self.prev_id,
            timestamp: &self.timestamp,
            operation_id: &self.operation_id,
            payload_hash: canonical_hash(&self.payload)?,
            provenance_hash: canonical_hash(&self.provenance)?,
            caller: &self.caller,
        })
    }
}

/// What a dispatch contributes to an audit entry.
#[derive(Debug, Clone, Copy)]
pub struct AuditRecord<'a> {
    /// Dispatched rune.
    pub operation_id: &'a str,
    /// Request payload.
    pub payload: &'a Value,
    /// Provenance for the call.
    pub provenance: &'a ProvenanceBundle,
    /// Caller source location.
    pub caller: &'a str,
}

struct StreamWriter {
    sink: Box<dyn Write + Send>,
    tip: String,
}

/// Append-only JSON-lines audit stream.
pub struct AuditStream {
    kind: StreamKind,
    writer: Mutex<StreamWriter>,
}

impl std::fmt::Debug for AuditStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditStream")
            .field("kind", &self.kind)
            .finish()
    }
}

impl AuditStream {
    /// Open (or create) a stream file, resuming the chain from its last entry.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the file cannot be opened or its last
    /// entry cannot be parsed.
    pub fn open(kind: StreamKind, path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tip = match read_entries(path) {
            Ok(entries) => entries
                .last()
                .map(|e| e.id.clone())
                .unwrap_or_else(|| kind.genesis()),
            Err(LedgerError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => kind.genesis(),
            Err(e) => return Err(e),
        };
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            kind,
            writer: Mutex::new(StreamWriter {
                sink: Box::new(file),
                tip,
            }),
        })
    }

    /// Create a stream over an arbitrary writer, starting at genesis.
    pub fn from_writer(kind: StreamKind, writer: Box<dyn Write + Send>) -> Self {
        Self {
            kind,
            writer: Mutex::new(StreamWriter {
                sink: writer,
                tip: kind.genesis(),
            }),
        }
    }

    /// Which stream this is.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Append one entry and advance the chain tip.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if hashing, serialization, or the write fails.
    pub fn append(&self, record: AuditRecord<'_>) -> Result<LedgerEntry, LedgerError> {
        let mut writer = self.writer.lock().map_err(|_| LedgerError::Poisoned)?;
        let mut entry = LedgerEntry {
            id: String::new(),
            prev_id: writer.tip.clone(),
            stream: self.kind,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            operation_id: record.operation_id.to_owned(),
            payload: record.payload.clone(),
            provenance: record.provenance.clone(),
            caller: record.caller.to_owned(),
        };
        entry.id = entry.compute_id()?;
        let line = serde_json::to_string(&entry)?;
        writeln!(writer.sink, "{line}")?;
        writer.sink.flush()?;
        writer.tip = entry.id.clone();
        Ok(entry)
    }
}

/// Read every entry of a stream file.
///
/// # Errors
///
/// Returns [`LedgerError`] for I/O failures or malformed lines.
pub fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>, LedgerError> {
    let file = std::fs::File::open(path)?;
    let mut entries = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(&line).map_err(|e| LedgerError::Corrupt {
            line: idx.saturating_add(1),
            reason: e.to_string(),
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Re-derive every id and link in a stream file, returning the entry count.
///
/// # Errors
///
/// Returns [`LedgerError::Corrupt`] at the first entry that does not check
/// out, or an I/O error.
pub fn verify_chain(kind: StreamKind, path: &Path) -> Result<usize, LedgerError> {
    let entries = read_entries(path)?;
    let mut expected_prev = kind.genesis();
    for (idx, entry) in entries.iter().enumerate() {
        let line = idx.saturating_add(1);
        if entry.stream != kind {
            return Err(LedgerError::Corrupt {
                line,
                reason: format!("entry belongs to stream {}", entry.stream.name()),
            });
        }
        if entry.prev_id != expected_prev {
            return Err(LedgerError::Corrupt {
                line,
                reason: "broken link to previous entry".to_owned(),
            });
        }
        if entry.compute_id()? != entry.id {
            return Err(LedgerError::Corrupt {
                line,
                reason: "entry id does not match its content".to_owned(),
            });
        }
        expected_prev = entry.id.clone();
    }
    Ok(entries.len())
}

/// Result of comparing the two audit streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrossCheckReport {
    /// Number of entry pairs compared.
    pub compared: usize,
    /// Human-readable descriptions of each divergence.
    pub divergences: Vec<String>,
}

impl CrossCheckReport {
    /// True when both streams record the same calls.
    pub fn is_consistent(&self) -> bool {
        self.divergences.is_empty()
    }
}

/// Compare the invocation ledger against the event almanac.
///
/// Entries are paired by position and compared on operation id, payload,
/// provenance, and caller. Ids and timestamps differ by construction.
///
/// # Errors
///
/// Returns [`LedgerError`] if either file cannot be read.
pub fn cross_check(invocations: &Path, almanac: &Path) -> Result<CrossCheckReport, LedgerError> {
    let left = read_entries(invocations)?;
    let right = read_entries(almanac)?;
    let mut report = CrossCheckReport::default();

    for (idx, (a, b)) in left.iter().zip(right.iter()).enumerate() {
        report.compared = report.compared.saturating_add(1);
        let mut fields = Vec::new();
        if a.operation_id != b.operation_id {
            fields.push("operationId");
        }
        if a.payload != b.payload {
            fields.push("payload");
        }
        if a.provenance != b.provenance {
            fields.push("provenance");
        }
        if a.caller != b.caller {
            fields.push("caller");
        }
        if !fields.is_empty() {
            report.divergences.push(format!(
                "entry {} differs in {}",
                idx.saturating_add(1),
                fields.join(", ")
            ));
        }
    }
    if left.len() != right.len() {
        report.divergences.push(format!(
            "stream lengths differ: invocation ledger has {}, event almanac has {}",
            left.len(),
            right.len()
        ));
    }
    Ok(report)
}
