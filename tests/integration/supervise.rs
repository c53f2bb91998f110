//! End-to-end tests driving the warden binary against a scratch project.
//!
//! The executor is `sh`, configured through the project's warden.toml.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const SERIAL_ANCHOR: &str = r#"
protected_paths = ["secrets/"]

[budgets]
max_attempts_per_run = 3
"#;

const PARALLEL_ANCHOR: &str = r#"
[parallelism]
allowed = false
max_concurrent_runs = 4
"#;

#[allow(deprecated)]
fn warden_cmd(project: &Path) -> Command {
    let mut cmd = Command::cargo_bin("warden").expect("Failed to find warden binary");
    cmd.arg("--project").arg(project).env_remove("RUST_LOG");
    cmd
}

fn setup_project(anchor: Option<&str>, script: &str) -> TempDir {
    let temp_dir = TempDir::new().expect("temp dir");
    let config = format!(
        r#"
[executor]
command = "sh"
args = ["-c", {script:?}]

[retry.policies.unknown]
max_attempts = 1
"#
    );
    fs::write(temp_dir.path().join("warden.toml"), config).expect("write config");
    if let Some(anchor) = anchor {
        fs::write(temp_dir.path().join("anchor.toml"), anchor).expect("write anchor");
    }
    temp_dir
}

#[test]
fn test_schema_prints_anchor_schema() {
    let temp_dir = TempDir::new().expect("temp dir");
    warden_cmd(temp_dir.path())
        .arg("schema")
        .assert()
        .success()
        .stdout(predicate::str::contains("protected_paths"))
        .stdout(predicate::str::contains("max_concurrent_runs"));
}

#[test]
fn test_missing_anchor_exits_3() {
    let project = setup_project(None, "exit 0");
    warden_cmd(project.path())
        .args(["supervise", "run-1"])
        .assert()
        .code(3);
}

#[test]
fn test_parallel_request_denied_exits_2() {
    let project = setup_project(Some(PARALLEL_ANCHOR), "exit 0");
    warden_cmd(project.path())
        .args(["supervise", "run-1", "run-2", "--workers", "2"])
        .assert()
        .code(2);

    // Nothing was dispatched, so no run storage exists.
    assert!(!project.path().join(".warden/runs").exists());
}

#[test]
fn test_successful_session_exits_0_and_records_evidence() {
    let project = setup_project(Some(SERIAL_ANCHOR), "exit 0");
    let output = warden_cmd(project.path())
        .args(["supervise", "run-1", "run-2", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let report: serde_json::Value = serde_json::from_slice(&output).expect("report json");
    let runs = report["runs"].as_array().expect("runs");
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r["outcome"] == "completed"));
    assert_eq!(runs[0]["run_id"], "run-1");

    warden_cmd(project.path())
        .arg("report")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"success\""));

    warden_cmd(project.path())
        .args(["report", "--summary"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Session Metrics"))
        .stdout(predicate::str::contains("run-2"));
}

#[test]
fn test_failure_escalates_and_exits_4() {
    let project = setup_project(Some(SERIAL_ANCHOR), "echo 'segmentation fault' >&2; exit 3");
    warden_cmd(project.path())
        .args(["supervise", "run-9"])
        .assert()
        .code(4)
        .stdout(predicate::str::contains("run-9"));

    warden_cmd(project.path())
        .args(["queue", "needs-manual", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"source\": \"run-9\""))
        .stdout(predicate::str::contains("\"reason\": \"unknown\""));

    warden_cmd(project.path())
        .arg("report")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"partial_failure\""));
}

#[test]
fn test_missing_executor_command_is_internal_error() {
    let temp_dir = TempDir::new().expect("temp dir");
    fs::write(temp_dir.path().join("anchor.toml"), SERIAL_ANCHOR).expect("write anchor");
    warden_cmd(temp_dir.path())
        .env_remove("WARDEN_EXECUTOR__COMMAND")
        .args(["supervise", "run-1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("executor"));
}

#[test]
fn test_governance_denial_precedes_executor_setup() {
    let temp_dir = TempDir::new().expect("temp dir");
    fs::write(temp_dir.path().join("anchor.toml"), PARALLEL_ANCHOR).expect("write anchor");
    warden_cmd(temp_dir.path())
        .env_remove("WARDEN_EXECUTOR__COMMAND")
        .args(["supervise", "run-1", "run-2", "--workers", "2"])
        .assert()
        .code(2);
}

#[test]
fn test_list_leases_and_cleanup_on_empty_state() {
    let temp_dir = TempDir::new().expect("temp dir");
    warden_cmd(temp_dir.path())
        .args(["list-leases", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"leases\": []"));

    warden_cmd(temp_dir.path()).arg("cleanup").assert().success();
}
