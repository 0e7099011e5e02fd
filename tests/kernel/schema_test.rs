//! Schema derivation from registry declarations and override files.

use serde_json::json;

use runespine::kernel::registry::RegistrySnapshot;
use runespine::kernel::schema::{validate, Direction, SchemaOverrides, SchemaRegistry};

const REGISTRY: &str = r#"[
    {"id": "legacy.rune", "inputs": ["a", "b"]},
    {"id": "typed.rune", "inputs": [
        {"name": "count", "type": "integer"},
        {"name": "ratio", "type": "float", "required": false},
        {"name": "tags", "type": "list", "required": false}
    ]},
    {"id": "open.rune"}
]"#;

fn registry() -> SchemaRegistry {
    let snapshot = RegistrySnapshot::parse(REGISTRY).expect("registry");
    SchemaRegistry::build(&snapshot, &SchemaOverrides::new())
}

#[test]
fn legacy_names_are_required_presence_only() {
    let schemas = registry();
    let spec = schemas
        .schema_for("legacy.rune", Direction::Input)
        .expect("derived spec");
    assert!(validate(&json!({"a": 1, "b": "anything"}), spec).is_ok());
    assert_eq!(
        validate(&json!({"a": null, "c": 1}), spec).errors,
        vec!["missing_required:b".to_owned()]
    );
}

#[test]
fn typed_declarations_check_top_level_types() {
    let schemas = registry();
    let spec = schemas
        .schema_for("typed.rune", Direction::Input)
        .expect("derived spec");
    assert!(validate(&json!({"count": 3, "ratio": 0.5, "tags": []}), spec).is_ok());
    assert!(validate(&json!({"count": 3, "ratio": 2}), spec).is_ok());
    assert!(validate(&json!({"count": 3, "ratio": null}), spec).is_ok());
    assert_eq!(
        validate(&json!({"count": 3.5, "tags": {}}), spec).errors,
        vec!["type_mismatch:count".to_owned(), "type_mismatch:tags".to_owned()]
    );
}

#[test]
fn rune_without_declarations_has_no_schema() {
    let schemas = registry();
    assert!(schemas.schema_for("open.rune", Direction::Input).is_none());
    assert!(schemas.schema_for("open.rune", Direction::Output).is_none());
    assert!(schemas.schema_for("absent.rune", Direction::Input).is_none());
}

#[test]
fn override_file_wins_over_declarations() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("schemas.json");
    std::fs::write(
        &path,
        r#"{"legacy.rune": {"in": {"required": {"a": "int"}, "allowExtra": false}}}"#,
    )
    .expect("write overrides");
    let overrides = SchemaOverrides::load(&path).expect("load");
    let snapshot = RegistrySnapshot::parse(REGISTRY).expect("registry");
    let schemas = SchemaRegistry::build(&snapshot, &overrides);
    let spec = schemas
        .schema_for("legacy.rune", Direction::Input)
        .expect("override");
    assert_eq!(
        validate(&json!({"a": 1, "b": 2}), spec).errors,
        vec!["extra_field:b".to_owned()]
    );
}

#[test]
fn overlapping_override_is_rejected() {
    let err = SchemaOverrides::parse(
        r#"{"x.y": {"in": {"required": {"a": "str"}, "optional": {"a": "str"}}}}"#,
    );
    assert!(err.is_err());
}

#[test]
fn missing_override_file_is_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let overrides = SchemaOverrides::load(&dir.path().join("absent.json")).expect("load");
    let snapshot = RegistrySnapshot::parse(REGISTRY).expect("registry");
    let schemas = SchemaRegistry::build(&snapshot, &overrides);
    assert!(schemas.schema_for("legacy.rune", Direction::Input).is_some());
}

#[test]
fn non_object_payload_is_reported() {
    let schemas = registry();
    let spec = schemas
        .schema_for("legacy.rune", Direction::Input)
        .expect("derived spec");
    assert_eq!(validate(&json!([1, 2]), spec).errors, vec!["not_an_object".to_owned()]);
}
