//! Signing-key lookup through the `.env` fallback file.

use std::fs;

use serde_json::json;

use runespine::credentials::load_credentials;
use runespine::kernel::signing::SignatureProvider;

fn write_private(path: &std::path::Path, contents: &str) {
    fs::write(path, contents).expect("write env file");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).expect("chmod");
    }
}

#[test]
fn env_file_supplies_signing_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env_path = dir.path().join(".env");
    write_private(&env_path, "RUNESPINE_TEST_KEY_A=file-secret\n");

    let creds = load_credentials(&env_path).expect("load");
    assert_eq!(creds.get("RUNESPINE_TEST_KEY_A"), Some("file-secret"));

    let provider = SignatureProvider::from_env("RUNESPINE_TEST_KEY_A", Some(env_path.clone()));
    assert!(provider.is_configured());
    let core = json!({"decision": "APPROVE"});
    let signature = provider
        .sign(&core)
        .expect("sign")
        .expect("signature present");

    let same_key = SignatureProvider::with_key(b"file-secret".to_vec());
    assert!(same_key.verify(&core, &signature.algorithm, &signature.key_id, &signature.value));
}

#[test]
fn absent_key_leaves_provider_unsigned() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env_path = dir.path().join(".env");
    write_private(&env_path, "OTHER=value\n");

    let provider = SignatureProvider::from_env("RUNESPINE_TEST_KEY_ABSENT", Some(env_path));
    assert!(!provider.is_configured());
    assert!(provider.sign(&json!({})).expect("sign").is_none());
}

#[test]
fn debug_output_redacts_values() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env_path = dir.path().join(".env");
    write_private(&env_path, "RUNESPINE_TEST_KEY_B=do-not-print\n");
    let creds = load_credentials(&env_path).expect("load");
    let rendered = format!("{creds:?}");
    assert!(rendered.contains("RUNESPINE_TEST_KEY_B"));
    assert!(!rendered.contains("do-not-print"));
}
