//! Request/response shape checking.
//!
//! Each rune may have an input and an output [`SchemaSpec`]. Specs come
//! from two places: an explicit override table, which wins, and specs
//! generated from the fields a descriptor declares. A rune with no spec for
//! a direction is not validated in that direction.
//!
//! Only the top level is checked. Nested lists and maps are type-tagged but
//! their contents are not inspected.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::registry::{FieldDecl, RegistrySnapshot};

/// Schema table errors.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A field is listed as both required and optional.
    #[error("field '{field}' is both required and optional")]
    Overlap {
        /// The conflicting field.
        field: String,
    },
    /// The override table could not be read or parsed.
    #[error("failed to load schema overrides: {0}")]
    Load(String),
}

/// Closed set of top-level type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// JSON string.
    #[serde(alias = "str")]
    String,
    /// Integral JSON number.
    #[serde(alias = "int")]
    Integer,
    /// Any JSON number.
    #[serde(alias = "number")]
    Float,
    /// JSON boolean.
    #[serde(alias = "bool")]
    Boolean,
    /// JSON array.
    #[serde(alias = "array")]
    List,
    /// JSON object.
    #[serde(alias = "object", alias = "dict")]
    Map,
    /// Presence only (legacy bare-name declarations).
    Any,
}

impl FieldType {
    /// Whether `value` has this type.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::List => value.is_array(),
            Self::Map => value.is_object(),
            Self::Any => true,
        }
    }
}

/// Shape of one direction of a rune.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSpec {
    /// Fields that must be present.
    #[serde(default)]
    pub required: BTreeMap<String, FieldType>,
    /// Fields that may be present.
    #[serde(default)]
    pub optional: BTreeMap<String, FieldType>,
    /// Whether undeclared fields are tolerated.
    #[serde(default)]
    pub allow_extra: bool,
}

impl SchemaSpec {
    /// Build a spec, rejecting overlap between required and optional.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Overlap`] when a field appears in both maps.
    pub fn new(
        required: BTreeMap<String, FieldType>,
        optional: BTreeMap<String, FieldType>,
        allow_extra: bool,
    ) -> Result<Self, SchemaError> {
        let spec = Self {
            required,
            optional,
            allow_extra,
        };
        spec.check_disjoint()?;
        Ok(spec)
    }

    /// Derive a permissive spec from declared fields.
    fn from_fields(fields: &[FieldDecl]) -> Self {
        let mut required = BTreeMap::new();
        let mut optional = BTreeMap::new();
        for decl in fields {
            let name = decl.name().to_owned();
            if decl.is_required() {
                optional.remove(&name);
                required.insert(name, decl.field_type());
            } else if !required.contains_key(&name) {
                optional.insert(name, decl.field_type());
            }
        }
        Self {
            required,
            optional,
            allow_extra: true,
        }
    }

    fn check_disjoint(&self) -> Result<(), SchemaError> {
        match self.required.keys().find(|k| self.optional.contains_key(*k)) {
            Some(field) => Err(SchemaError::Overlap {
                field: field.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Which side of a call a schema applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Request payload.
    #[serde(rename = "in")]
    Input,
    /// Handler result.
    #[serde(rename = "out")]
    Output,
}

/// Input and output specs for one rune.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuneSchemas {
    /// Request spec.
    #[serde(default, rename = "in", skip_serializing_if = "Option::is_none")]
    pub input: Option<SchemaSpec>,
    /// Result spec.
    #[serde(default, rename = "out", skip_serializing_if = "Option::is_none")]
    pub output: Option<SchemaSpec>,
}

impl RuneSchemas {
    fn get(&self, direction: Direction) -> Option<&SchemaSpec> {
        match direction {
            Direction::Input => self.input.as_ref(),
            Direction::Output => self.output.as_ref(),
        }
    }
}

/// Explicit, authoritative schema table keyed by rune id.
#[derive(Debug, Clone, Default)]
pub struct SchemaOverrides {
    table: HashMap<String, RuneSchemas>,
}

impl SchemaOverrides {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a rune's spec for one direction.
    pub fn insert(&mut self, rune: &str, direction: Direction, spec: SchemaSpec) {
        let entry = self.table.entry(rune.to_owned()).or_default();
        match direction {
            Direction::Input => entry.input = Some(spec),
            Direction::Output => entry.output = Some(spec),
        }
    }

    /// Merge `other` into this table; entries in `other` win.
    pub fn merge(&mut self, other: SchemaOverrides) {
        for (rune, schemas) in other.table {
            if let Some(spec) = schemas.input {
                self.insert(&rune, Direction::Input, spec);
            }
            if let Some(spec) = schemas.output {
                self.insert(&rune, Direction::Output, spec);
            }
        }
    }

    /// Parse a `{"<rune>": {"in": {...}, "out": {...}}}` document.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] for malformed JSON or overlapping fields.
    pub fn parse(json: &str) -> Result<Self, SchemaError> {
        let table: HashMap<String, RuneSchemas> =
            serde_json::from_str(json).map_err(|e| SchemaError::Load(e.to_string()))?;
        for schemas in table.values() {
            for spec in [&schemas.input, &schemas.output].into_iter().flatten() {
                spec.check_disjoint()?;
            }
        }
        Ok(Self { table })
    }

    /// Load the table from disk; a missing file yields an empty table.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] for unreadable or malformed files.
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(SchemaError::Load(format!("{}: {e}", path.display()))),
        }
    }
}

/// Resolves the spec for a rune and direction.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    overrides: SchemaOverrides,
    generated: HashMap<String, RuneSchemas>,
}

impl SchemaRegistry {
    /// Build from a registry snapshot plus the override table.
    pub fn build(snapshot: &RegistrySnapshot, overrides: &SchemaOverrides) -> Self {
        let generated = snapshot
            .runes()
            .iter()
            .map(|rune| {
                let schemas = RuneSchemas {
                    input: (!rune.inputs.is_empty()).then(|| SchemaSpec::from_fields(&rune.inputs)),
                    output: (!rune.outputs.is_empty())
                        .then(|| SchemaSpec::from_fields(&rune.outputs)),
                };
                (rune.id.clone(), schemas)
            })
            .collect();
        Self {
            overrides: overrides.clone(),
            generated,
        }
    }

    /// The spec for `operation_id` in `direction`, if any.
    pub fn schema_for(&self, operation_id: &str, direction: Direction) -> Option<&SchemaSpec> {
        self.overrides
            .table
            .get(operation_id)
            .and_then(|s| s.get(direction))
            .or_else(|| {
                self.generated
                    .get(operation_id)
                    .and_then(|s| s.get(direction))
            })
    }
}

/// Outcome of checking a value against a spec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validation {
    /// Mismatch codes, e.g. `missing_required:msg`.
    pub errors: Vec<String>,
}

impl Validation {
    /// True when no mismatches were found.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Check the top-level shape of `value` against `spec`.
///
/// Codes: `missing_required:<f>`, `type_mismatch:<f>`, `extra_field:<f>`
/// (only when extras are disallowed), and `not_an_object` when the value is
/// not a JSON object. `null` on an optional field counts as absent.
pub fn validate(value: &Value, spec: &SchemaSpec) -> Validation {
    let Some(obj) = value.as_object() else {
        return Validation {
            errors: vec!["not_an_object".to_owned()],
        };
    };

    let mut errors = Vec::new();
    for (name, field_type) in &spec.required {
        match obj.get(name) {
            None => errors.push(format!("missing_required:{name}")),
            Some(v) if !field_type.matches(v) => errors.push(format!("type_mismatch:{name}")),
            Some(_) => {}
        }
    }
    for (name, field_type) in &spec.optional {
        if let Some(v) = obj.get(name) {
            if !v.is_null() && !field_type.matches(v) {
                errors.push(format!("type_mismatch:{name}"));
            }
        }
    }
    if !spec.allow_extra {
        for key in obj.keys() {
            if !spec.required.contains_key(key) && !spec.optional.contains_key(key) {
                errors.push(format!("extra_field:{key}"));
            }
        }
    }
    Validation { errors }
}
