//! Coverage for config parsing and path resolution.

use std::path::PathBuf;

use runespine::config::{config_dir, KernelConfig, STATE_DIR_NAME};

#[test]
fn config_dir_resolves() {
    let dir = config_dir().expect("config dir should resolve");
    assert!(dir.ends_with(STATE_DIR_NAME));
}

#[test]
fn defaults_match_documented_layout() {
    let config = KernelConfig::with_root("/srv/runespine");
    let paths = &config.paths;
    assert_eq!(
        paths.resolve(&paths.registry),
        PathBuf::from("/srv/runespine/registry.json")
    );
    assert_eq!(
        paths.resolve(&paths.invocation_ledger),
        PathBuf::from("/srv/runespine/invocations.jsonl")
    );
    assert_eq!(
        paths.resolve(&paths.event_almanac),
        PathBuf::from("/srv/runespine/almanac.jsonl")
    );
    assert_eq!(config.signing.key_env, "RUNESPINE_SIGNING_KEY");
    assert!(!config.signing.require);
    assert_eq!(config.shadow.capability, "shadow-lane");
    assert_eq!(config.env_file(), PathBuf::from("/srv/runespine/.env"));
}

#[test]
fn parse_full_config() {
    let toml_str = r#"
[paths]
root = "/var/lib/runespine"
registry = "/etc/runespine/registry.json"
telemetry = "events/telemetry.jsonl"

[signing]
key_env = "OPS_SIGNING_KEY"
require = true

[shadow]
capability = "canary"

[logging]
level = "debug"
"#;
    let config = KernelConfig::from_toml(toml_str).expect("config should parse");
    let paths = &config.paths;
    assert_eq!(
        paths.resolve(&paths.registry),
        PathBuf::from("/etc/runespine/registry.json")
    );
    assert_eq!(
        paths.resolve(&paths.telemetry),
        PathBuf::from("/var/lib/runespine/events/telemetry.jsonl")
    );
    assert_eq!(config.signing.key_env, "OPS_SIGNING_KEY");
    assert!(config.signing.require);
    assert_eq!(config.shadow.capability, "canary");
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = KernelConfig::load_from_file(&dir.path().join("config.toml")).expect("defaults");
    assert_eq!(config.signing.key_env, "RUNESPINE_SIGNING_KEY");
}

#[test]
fn malformed_file_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[paths\nroot = 1").expect("write");
    assert!(KernelConfig::load_from_file(&path).is_err());
}

#[test]
fn env_overrides_file_values() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().to_path_buf();
    std::fs::write(
        root.join("config.toml"),
        "[shadow]\ncapability = \"from-file\"\n[signing]\nrequire = false\n",
    )
    .expect("write");
    let root_str = root.display().to_string();
    let config = KernelConfig::load_with(|key| match key {
        "RUNESPINE_ROOT" => Some(root_str.clone()),
        "RUNESPINE_REQUIRE_SIGNING" => Some("true".to_owned()),
        _ => None,
    })
    .expect("load");
    assert_eq!(config.paths.root, root);
    assert_eq!(config.shadow.capability, "from-file");
    assert!(config.signing.require);
}
