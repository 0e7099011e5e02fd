//! Best-effort telemetry stream.
//!
//! [`TelemetrySink::emit`] has no error channel: sinks swallow their own
//! failures (logging them at debug level) so observability can never fail
//! an invocation.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

/// Lifecycle phase of an invocation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// All gates passed; the handler is about to run.
    Start,
    /// The handler succeeded and the call was recorded.
    End,
    /// The handler failed or panicked.
    Error,
    /// The call was refused before dispatch.
    Reject,
}

/// One telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    /// Rune the event concerns.
    pub operation_id: String,
    /// Emission time in nanoseconds since the Unix epoch.
    pub ts_nanos: i64,
    /// Lifecycle phase.
    pub phase: Phase,
    /// Per-dispatch correlation id.
    pub invocation_id: Uuid,
    /// Free-form, phase-specific fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TelemetryEvent {
    /// New event stamped with the current time.
    pub fn new(operation_id: &str, phase: Phase, invocation_id: Uuid) -> Self {
        Self {
            operation_id: operation_id.to_owned(),
            ts_nanos: Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX),
            phase,
            invocation_id,
            fields: Map::new(),
        }
    }

    /// Builder: attach a field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_owned(), value.into());
        self
    }
}

/// Destination for telemetry events. Implementations must never panic or
/// propagate I/O failures out of [`TelemetrySink::emit`].
pub trait TelemetrySink: Send + Sync {
    /// Record an event, dropping it silently on failure.
    fn emit(&self, event: TelemetryEvent);
}

/// Appends events as JSON lines, opening and closing the file per event.
#[derive(Debug, Clone)]
pub struct JsonlTelemetry {
    path: PathBuf,
}

impl JsonlTelemetry {
    /// Sink writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn try_emit(&self, event: &TelemetryEvent) -> anyhow::Result<()> {
        let line = serde_json::to_string(event)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

impl TelemetrySink for JsonlTelemetry {
    fn emit(&self, event: TelemetryEvent) {
        if let Err(e) = self.try_emit(&event) {
            debug!(path = %self.path.display(), error = %e, "dropping telemetry event");
        }
    }
}

/// Keeps events in memory; used by tests and embedders.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemoryTelemetry {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(_) => Vec::new(),
        }
    }

    /// Phases emitted for one operation, in order.
    pub fn phases_for(&self, operation_id: &str) -> Vec<Phase> {
        self.events()
            .into_iter()
            .filter(|e| e.operation_id == operation_id)
            .map(|e| e.phase)
            .collect()
    }
}

impl TelemetrySink for MemoryTelemetry {
    fn emit(&self, event: TelemetryEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn emit(&self, _event: TelemetryEvent) {}
}
