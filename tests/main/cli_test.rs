//! CLI smoke tests against a temporary state root.

use std::path::Path;

use assert_cmd::Command;
use serde_json::Value;

fn runespine(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("runespine").expect("binary built");
    cmd.env("RUNESPINE_ROOT", root)
        .env_remove("RUNESPINE_CONFIG_PATH")
        .env_remove("RUNESPINE_REGISTRY")
        .env_remove("RUNESPINE_POLICY")
        .env_remove("RUNESPINE_REQUIRE_SIGNING")
        .env("RUNESPINE_SIGNING_KEY", "cli-test-key")
        .env("RUST_LOG", "warn");
    cmd
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

#[test]
fn invoke_echo_prints_envelope() {
    let root = tempfile::tempdir().expect("tempdir");
    let output = runespine(root.path())
        .args(["invoke", "demo.echo", "--payload", r#"{"msg":"hi"}"#])
        .output()
        .expect("run");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let envelope = stdout_json(&output);
    assert_eq!(envelope["operationId"], "demo.echo");
    assert_eq!(envelope["result"]["msg"], "hi");
    assert!(envelope["provenanceBundle"]["payloadHash"].is_string());
    assert!(root.path().join("invocations.jsonl").exists());
    assert!(root.path().join("almanac.jsonl").exists());
}

#[test]
fn log_file_flag_creates_logs_directory() {
    let root = tempfile::tempdir().expect("tempdir");
    runespine(root.path())
        .args(["--log-file", "invoke", "demo.echo", "--payload", r#"{"msg":"hi"}"#])
        .assert()
        .success();
    assert!(root.path().join("logs").is_dir());
}

#[test]
fn denied_rune_exits_non_zero() {
    let root = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        root.path().join("policy.json"),
        r#"{"denyRunes": ["demo.echo"]}"#,
    )
    .expect("policy");
    runespine(root.path())
        .args(["invoke", "demo.echo", "--payload", r#"{"msg":"hi"}"#])
        .assert()
        .failure();
    assert!(!root.path().join("invocations.jsonl").exists()
        || std::fs::read_to_string(root.path().join("invocations.jsonl"))
            .expect("read")
            .is_empty());
}

#[test]
fn plan_promote_apply_flow() {
    let root = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        root.path().join("policy.json"),
        r#"{"stabilization": {"requiredAdvisoryCycles": 1}}"#,
    )
    .expect("policy");
    let plan_path = root.path().join("plan.json");
    let plan_arg = plan_path.to_str().expect("utf-8 path");

    runespine(root.path())
        .args([
            "plan", "--action", "restart", "--service", "web", "--target", "host-1", "--seed", "5",
            "--out", plan_arg,
        ])
        .assert()
        .success();
    assert!(plan_path.exists());

    let promoted = runespine(root.path())
        .args(["promote", "--plan", plan_arg, "--by", "alice"])
        .output()
        .expect("promote");
    assert!(promoted.status.success(), "{}", String::from_utf8_lossy(&promoted.stderr));
    let receipt = stdout_json(&promoted)["result"]["receiptId"]
        .as_str()
        .expect("receipt id")
        .to_owned();

    runespine(root.path())
        .args(["verify-receipt", &receipt])
        .assert()
        .success();

    let applied = runespine(root.path())
        .args(["apply", "--plan", plan_arg, "--receipt", &receipt])
        .output()
        .expect("apply");
    assert!(applied.status.success(), "{}", String::from_utf8_lossy(&applied.stderr));
    assert_eq!(stdout_json(&applied)["result"]["applied"], true);

    runespine(root.path()).arg("audit-check").assert().success();
}

#[test]
fn deny_decision_blocks_apply() {
    let root = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        root.path().join("policy.json"),
        r#"{"stabilization": {"requiredAdvisoryCycles": 0}}"#,
    )
    .expect("policy");
    let denied = runespine(root.path())
        .args([
            "decide",
            "deny",
            "--action",
            "ops.apply",
            "--payload",
            r#"{"action":"restart","service":"web","target":"host-1"}"#,
            "--by",
            "bob",
        ])
        .output()
        .expect("decide");
    assert!(denied.status.success(), "{}", String::from_utf8_lossy(&denied.stderr));
    let receipt = stdout_json(&denied)["result"]["receiptId"]
        .as_str()
        .expect("receipt id")
        .to_owned();

    let plan_path = root.path().join("plan.json");
    std::fs::write(
        &plan_path,
        r#"{
            "actionOperationId": "ops.apply",
            "actionPayload": {"action": "restart", "service": "web", "target": "host-1"}
        }"#,
    )
    .expect("plan");
    runespine(root.path())
        .args([
            "apply",
            "--plan",
            plan_path.to_str().expect("utf-8 path"),
            "--receipt",
            &receipt,
        ])
        .assert()
        .failure();
}

#[test]
fn tampered_almanac_fails_audit_check() {
    let root = tempfile::tempdir().expect("tempdir");
    for msg in ["one", "two"] {
        runespine(root.path())
            .args(["invoke", "demo.echo", "--payload", &format!(r#"{{"msg":"{msg}"}}"#)])
            .assert()
            .success();
    }
    let almanac = root.path().join("almanac.jsonl");
    let contents = std::fs::read_to_string(&almanac).expect("read");
    let first = contents.lines().next().expect("line").to_owned();
    std::fs::write(&almanac, format!("{first}\n")).expect("truncate");

    runespine(root.path()).arg("audit-check").assert().failure();
}

#[test]
fn runes_lists_builtin_set() {
    let root = tempfile::tempdir().expect("tempdir");
    let output = runespine(root.path()).arg("runes").output().expect("runes");
    assert!(output.status.success());
    let listing = stdout_json(&output);
    let ids: Vec<&str> = listing["runes"]
        .as_array()
        .expect("runes array")
        .iter()
        .filter_map(|r| r["id"].as_str())
        .collect();
    assert!(ids.contains(&"demo.echo"));
    assert!(ids.contains(&"ops.apply"));
}
