//! Stabilization ratchet: per-rune counters of confirmed advisory cycles.
//!
//! Counters only move up. There is deliberately no reset or decrement in
//! this API; recovering from a bad count means accumulating new cycles or
//! editing the state file out of band.
//!
//! The file store assumes a single writer. Each increment reads the whole
//! file, bumps one counter, and replaces the file through a temp-file
//! rename so readers never see a partial document.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stabilization state errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// Reading or writing the state file failed.
    #[error("stabilization state I/O error at {path}: {reason}")]
    Io {
        /// State file path.
        path: String,
        /// Underlying error.
        reason: String,
    },
    /// The state file is malformed.
    #[error("failed to parse stabilization state: {0}")]
    Parse(String),
    /// The in-memory lock was poisoned.
    #[error("stabilization state lock poisoned")]
    Poisoned,
}

/// On-disk document: `{"advisoryCycles": {"<rune>": n}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StabilizationState {
    /// Confirmed cycles per advisory rune.
    #[serde(default)]
    pub advisory_cycles: BTreeMap<String, u64>,
}

/// Persistent counter store.
pub trait StabilizationStore: Send + Sync {
    /// Current count for `operation_id` (0 when never run).
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the state cannot be read.
    fn cycles(&self, operation_id: &str) -> Result<u64, StateError>;

    /// Add one confirmed cycle and persist it, returning the new count.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the state cannot be read or written.
    fn record_cycle(&self, operation_id: &str) -> Result<u64, StateError>;
}

/// JSON file store.
#[derive(Debug, Clone)]
pub struct FileStabilizationStore {
    path: PathBuf,
}

impl FileStabilizationStore {
    /// Store backed by `path`; the file is created on first increment.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read the whole state document.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] for unreadable or malformed files.
    pub fn read_state(&self) -> Result<StabilizationState, StateError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                serde_json::from_str(&contents).map_err(|e| StateError::Parse(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StabilizationState::default()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn write_state(&self, state: &StabilizationState) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let body =
            serde_json::to_string_pretty(state).map_err(|e| StateError::Parse(e.to_string()))?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, body).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| self.io_error(e))
    }

    fn io_error(&self, e: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        }
    }
}

impl StabilizationStore for FileStabilizationStore {
    fn cycles(&self, operation_id: &str) -> Result<u64, StateError> {
        let state = self.read_state()?;
        Ok(state.advisory_cycles.get(operation_id).copied().unwrap_or(0))
    }

    fn record_cycle(&self, operation_id: &str) -> Result<u64, StateError> {
        let mut state = self.read_state()?;
        let count = state
            .advisory_cycles
            .entry(operation_id.to_owned())
            .or_insert(0);
        *count = count.saturating_add(1);
        let updated = *count;
        self.write_state(&state)?;
        Ok(updated)
    }
}

/// In-memory store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStabilizationStore {
    counts: Mutex<BTreeMap<String, u64>>,
}

impl MemoryStabilizationStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StabilizationStore for MemoryStabilizationStore {
    fn cycles(&self, operation_id: &str) -> Result<u64, StateError> {
        let counts = self.counts.lock().map_err(|_| StateError::Poisoned)?;
        Ok(counts.get(operation_id).copied().unwrap_or(0))
    }

    fn record_cycle(&self, operation_id: &str) -> Result<u64, StateError> {
        let mut counts = self.counts.lock().map_err(|_| StateError::Poisoned)?;
        let count = counts.entry(operation_id.to_owned()).or_insert(0);
        *count = count.saturating_add(1);
        Ok(*count)
    }
}
