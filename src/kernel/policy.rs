//! Policy store: allow/deny lists, actuator sub-policy, stabilization
//! threshold.
//!
//! The policy is pure data and is loaded fresh on every call so edits take
//! effect immediately. When no policy file exists the kernel falls back to
//! [`PolicyDocument::safe_default`], which permits everything except
//! actuator runes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::registry::RuneDescriptor;

/// Default number of confirmed advisory cycles before a destructive rune.
pub const DEFAULT_REQUIRED_ADVISORY_CYCLES: u64 = 3;

/// Policy loading errors.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The policy file exists but could not be read.
    #[error("failed to read policy {path}: {reason}")]
    Io {
        /// Policy path.
        path: String,
        /// Underlying error.
        reason: String,
    },
    /// The policy document is malformed.
    #[error("failed to parse policy: {0}")]
    Parse(String),
}

/// Restrictions applied to actuator runes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorPolicy {
    /// When false, every actuator rune is denied at the policy gate.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Permitted `action` verbs; empty means any.
    #[serde(default)]
    pub allow_actions: Vec<String>,
    /// Permitted `service` targets; empty means any.
    #[serde(default)]
    pub allow_services: Vec<String>,
}

impl Default for ActuatorPolicy {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            allow_actions: Vec::new(),
            allow_services: Vec::new(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Stabilization ratchet settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StabilizationPolicy {
    /// Advisory cycles required before a destructive rune may run.
    #[serde(default = "default_required_cycles")]
    pub required_advisory_cycles: u64,
}

impl Default for StabilizationPolicy {
    fn default() -> Self {
        Self {
            required_advisory_cycles: default_required_cycles(),
        }
    }
}

fn default_required_cycles() -> u64 {
    DEFAULT_REQUIRED_ADVISORY_CYCLES
}

/// A policy document as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    /// When set, only these runes are allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_runes: Option<Vec<String>>,
    /// Runes that are always denied.
    #[serde(default)]
    pub deny_runes: Vec<String>,
    /// Actuator sub-policy.
    #[serde(default)]
    pub actuator: ActuatorPolicy,
    /// Stabilization threshold.
    #[serde(default)]
    pub stabilization: StabilizationPolicy,
}

impl PolicyDocument {
    /// Hardcoded fallback: advisory and read runes allowed, actuators denied.
    pub fn safe_default() -> Self {
        Self {
            allow_runes: None,
            deny_runes: Vec::new(),
            actuator: ActuatorPolicy {
                enabled: false,
                allow_actions: Vec::new(),
                allow_services: Vec::new(),
            },
            stabilization: StabilizationPolicy::default(),
        }
    }

    /// Parse a policy document.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Parse`] for malformed JSON.
    pub fn parse(json: &str) -> Result<Self, PolicyError> {
        serde_json::from_str(json).map_err(|e| PolicyError::Parse(e.to_string()))
    }

    /// Threshold for destructive runes.
    pub fn required_advisory_cycles(&self) -> u64 {
        self.stabilization.required_advisory_cycles
    }

    /// Gate a rune: list membership plus the actuator switch.
    ///
    /// # Errors
    ///
    /// Returns the denial reason.
    pub fn check_rune(&self, rune: &RuneDescriptor) -> Result<(), String> {
        if self.deny_runes.iter().any(|d| *d == rune.id) {
            return Err(format!("rune '{}' is on the deny list", rune.id));
        }
        if !is_allowed(self, &rune.id) {
            return Err(format!("rune '{}' is not on the allow list", rune.id));
        }
        if rune.evidence_mode.is_actuator() && !self.actuator.enabled {
            return Err(format!("actuator runes are disabled by policy ('{}')", rune.id));
        }
        Ok(())
    }

    /// Check an actuator payload's `action` and `service` against the
    /// sub-policy lists.
    ///
    /// # Errors
    ///
    /// Returns the denial reason.
    pub fn check_actuator_request(&self, payload: &Value) -> Result<(), String> {
        check_listed(payload, "action", &self.actuator.allow_actions)?;
        check_listed(payload, "service", &self.actuator.allow_services)
    }
}

fn check_listed(payload: &Value, field: &str, allowed: &[String]) -> Result<(), String> {
    if allowed.is_empty() {
        return Ok(());
    }
    match payload.get(field).and_then(Value::as_str) {
        Some(value) if allowed.iter().any(|a| a == value) => Ok(()),
        Some(value) => Err(format!("actuator {field} '{value}' is not permitted")),
        None => Err(format!("actuator request is missing '{field}'")),
    }
}

/// Deny list wins; a configured allow list decides; otherwise allowed.
pub fn is_allowed(policy: &PolicyDocument, operation_id: &str) -> bool {
    if policy.deny_runes.iter().any(|d| d == operation_id) {
        return false;
    }
    match &policy.allow_runes {
        Some(allow) => allow.iter().any(|a| a == operation_id),
        None => true,
    }
}

/// Supplies the current policy on every call.
pub trait PolicyStore: Send + Sync {
    /// Load the current policy.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] when an existing document cannot be used.
    fn load(&self) -> Result<PolicyDocument, PolicyError>;
}

/// Policy read from a JSON file; absent file means [`PolicyDocument::safe_default`].
#[derive(Debug, Clone)]
pub struct FilePolicyStore {
    path: PathBuf,
}

impl FilePolicyStore {
    /// Policy store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PolicyStore for FilePolicyStore {
    fn load(&self) -> Result<PolicyDocument, PolicyError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => PolicyDocument::parse(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no policy file, using safe default");
                Ok(PolicyDocument::safe_default())
            }
            Err(e) => Err(PolicyError::Io {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Fixed in-memory policy.
#[derive(Debug, Clone)]
pub struct StaticPolicy(pub PolicyDocument);

impl PolicyStore for StaticPolicy {
    fn load(&self) -> Result<PolicyDocument, PolicyError> {
        Ok(self.0.clone())
    }
}
