//! Rune registry: the snapshot of operations the kernel may dispatch.
//!
//! The registry is re-read on every call. A snapshot is validated as a whole
//! (unique, well-formed ids; destructive runes must name an existing
//! advisory counterpart) and carries a content-derived revision id.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::hashing::{canonical_hash, HashError};
use super::schema::FieldType;

/// Allowed shape of a rune id: dotted lowercase segments, at least two.
const RUNE_ID_PATTERN: &str = r"^[a-z][a-z0-9_]*(\.[a-z0-9_]+)+$";

/// Compiled once at first use.
static RUNE_ID: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(RUNE_ID_PATTERN));

// ── Errors ──────────────────────────────────────────────────────

/// Registry loading and validation errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry file could not be read.
    #[error("failed to read registry {path}: {reason}")]
    Io {
        /// Registry path.
        path: String,
        /// Underlying error.
        reason: String,
    },
    /// The registry document is not valid JSON of the expected shape.
    #[error("failed to parse registry: {0}")]
    Parse(String),
    /// Two descriptors share an id.
    #[error("duplicate rune id: {0}")]
    DuplicateId(String),
    /// A descriptor id does not match the rune id pattern.
    #[error("invalid rune id: {0}")]
    InvalidId(String),
    /// A destructive rune names a missing or non-advisory counterpart.
    #[error("rune '{rune}' is gated on '{advisory}', which is not an advisory rune")]
    InvalidStabilization {
        /// The destructive rune.
        rune: String,
        /// The named counterpart.
        advisory: String,
    },
    /// The snapshot revision could not be computed.
    #[error(transparent)]
    Hash(#[from] HashError),
}

// ── Descriptor types ────────────────────────────────────────────

/// How a rune's evidence is treated by the gates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EvidenceMode {
    /// No special gating.
    #[default]
    Plain,
    /// Read-only detector; runs inside the purity guard.
    DetectorOnly,
    /// State-changing actuator; requires an approving governance receipt.
    OpsActuator,
    /// Isolated observe-only lane; requires the shadow capability.
    ShadowLane,
}

impl EvidenceMode {
    /// Detector-class runes run with ambient network access cleared.
    pub fn is_detector_class(self) -> bool {
        matches!(self, Self::DetectorOnly | Self::ShadowLane)
    }

    /// Actuator-class runes get fatal result validation.
    pub fn is_actuator(self) -> bool {
        matches!(self, Self::OpsActuator)
    }
}

/// Participation in the stabilization ratchet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "camelCase")]
pub enum StabilizationRole {
    /// Each successful run increments this rune's own counter.
    Advisory,
    /// Refused until the named advisory rune reaches the policy threshold.
    Destructive {
        /// Advisory counterpart whose counter is checked.
        advisory: String,
    },
}

/// A declared input or output field.
///
/// Accepts the legacy bare-name form (required, presence-only) or the typed
/// `{name, type, required}` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldDecl {
    /// Legacy shorthand: the field is required, its type unchecked.
    Bare(String),
    /// Typed declaration.
    Typed {
        /// Field name.
        name: String,
        /// Declared type tag.
        #[serde(rename = "type")]
        field_type: FieldType,
        /// Whether the field must be present.
        #[serde(default = "default_required")]
        required: bool,
    },
}

fn default_required() -> bool {
    true
}

impl FieldDecl {
    /// Field name.
    pub fn name(&self) -> &str {
        match self {
            Self::Bare(name) | Self::Typed { name, .. } => name,
        }
    }

    /// Declared type (`Any` for the legacy form).
    pub fn field_type(&self) -> FieldType {
        match self {
            Self::Bare(_) => FieldType::Any,
            Self::Typed { field_type, .. } => *field_type,
        }
    }

    /// Whether the field is required.
    pub fn is_required(&self) -> bool {
        match self {
            Self::Bare(_) => true,
            Self::Typed { required, .. } => *required,
        }
    }
}

/// One dispatchable operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuneDescriptor {
    /// Unique operation id.
    pub id: String,
    /// Gating mode.
    #[serde(default)]
    pub evidence_mode: EvidenceMode,
    /// Declared input fields.
    #[serde(default)]
    pub inputs: Vec<FieldDecl>,
    /// Declared output fields.
    #[serde(default)]
    pub outputs: Vec<FieldDecl>,
    /// Stabilization ratchet role, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stabilization: Option<StabilizationRole>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl RuneDescriptor {
    /// Minimal plain descriptor with no declared fields.
    pub fn new(id: impl Into<String>, evidence_mode: EvidenceMode) -> Self {
        Self {
            id: id.into(),
            evidence_mode,
            inputs: Vec::new(),
            outputs: Vec::new(),
            stabilization: None,
            description: String::new(),
        }
    }

    /// Builder: declare inputs.
    pub fn with_inputs(mut self, inputs: Vec<FieldDecl>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Builder: declare outputs.
    pub fn with_outputs(mut self, outputs: Vec<FieldDecl>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Builder: set the stabilization role.
    pub fn with_stabilization(mut self, role: StabilizationRole) -> Self {
        self.stabilization = Some(role);
        self
    }

    /// Builder: set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Convenience constructor for a typed field declaration.
pub fn field(name: &str, field_type: FieldType, required: bool) -> FieldDecl {
    FieldDecl::Typed {
        name: name.to_owned(),
        field_type,
        required,
    }
}

// ── Snapshot ────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum RegistryDocument {
    List(Vec<RuneDescriptor>),
    Wrapped { runes: Vec<RuneDescriptor> },
}

/// A validated, immutable view of the registry.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    runes: Vec<RuneDescriptor>,
    revision: String,
}

impl RegistrySnapshot {
    /// Validate descriptors and build a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] for duplicate or malformed ids, broken
    /// stabilization links, or hashing failures.
    pub fn from_descriptors(runes: Vec<RuneDescriptor>) -> Result<Self, RegistryError> {
        let pattern = RUNE_ID
            .as_ref()
            .map_err(|e| RegistryError::Parse(e.to_string()))?;
        let mut seen = HashSet::new();
        for rune in &runes {
            if !pattern.is_match(&rune.id) {
                return Err(RegistryError::InvalidId(rune.id.clone()));
            }
            if !seen.insert(rune.id.as_str()) {
                return Err(RegistryError::DuplicateId(rune.id.clone()));
            }
        }
        for rune in &runes {
            if let Some(StabilizationRole::Destructive { advisory }) = &rune.stabilization {
                let counterpart_ok = runes.iter().any(|r| {
                    r.id == *advisory && r.stabilization == Some(StabilizationRole::Advisory)
                });
                if !counterpart_ok {
                    return Err(RegistryError::InvalidStabilization {
                        rune: rune.id.clone(),
                        advisory: advisory.clone(),
                    });
                }
            }
        }
        let revision = canonical_hash(&runes)?;
        Ok(Self { runes, revision })
    }

    /// Parse a registry document (bare array or `{"runes": [...]}`).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Parse`] for malformed JSON, or any
    /// validation error from [`RegistrySnapshot::from_descriptors`].
    pub fn parse(json: &str) -> Result<Self, RegistryError> {
        let doc: RegistryDocument =
            serde_json::from_str(json).map_err(|e| RegistryError::Parse(e.to_string()))?;
        let runes = match doc {
            RegistryDocument::List(runes) | RegistryDocument::Wrapped { runes } => runes,
        };
        Self::from_descriptors(runes)
    }

    /// Look up a descriptor by id.
    pub fn get(&self, id: &str) -> Option<&RuneDescriptor> {
        self.runes.iter().find(|r| r.id == id)
    }

    /// All descriptors in declaration order.
    pub fn runes(&self) -> &[RuneDescriptor] {
        &self.runes
    }

    /// Content-derived revision id.
    pub fn revision(&self) -> &str {
        &self.revision
    }
}

// ── Sources ─────────────────────────────────────────────────────

/// Supplies a fresh registry snapshot on every call.
pub trait RegistrySource: Send + Sync {
    /// Load the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the snapshot is unreadable or invalid.
    fn load(&self) -> Result<RegistrySnapshot, RegistryError>;
}

/// Registry read from a JSON file on every call.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
    fallback: Option<RegistrySnapshot>,
}

impl FileRegistry {
    /// Registry at `path`; a missing file is an error.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fallback: None,
        }
    }

    /// Use `fallback` when the file does not exist.
    pub fn with_fallback(mut self, fallback: RegistrySnapshot) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

impl RegistrySource for FileRegistry {
    fn load(&self) -> Result<RegistrySnapshot, RegistryError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => RegistrySnapshot::parse(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => match &self.fallback {
                Some(snapshot) => Ok(snapshot.clone()),
                None => Err(RegistryError::Io {
                    path: self.path.display().to_string(),
                    reason: e.to_string(),
                }),
            },
            Err(e) => Err(RegistryError::Io {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Fixed in-memory registry.
#[derive(Debug, Clone)]
pub struct StaticRegistry(pub RegistrySnapshot);

impl RegistrySource for StaticRegistry {
    fn load(&self) -> Result<RegistrySnapshot, RegistryError> {
        Ok(self.0.clone())
    }
}
