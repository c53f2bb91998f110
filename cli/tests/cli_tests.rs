use std::time::Duration;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use warden::approval::{ApprovalStore, Mailbox};

#[allow(deprecated)]
fn wardenctl(project: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("wardenctl").expect("Failed to find wardenctl binary");
    cmd.arg("--project").arg(project.path());
    cmd
}

fn seed_request(project: &TempDir) -> String {
    let store = ApprovalStore::new(project.path().join(".warden/approvals.json"));
    store
        .create(
            "run-1",
            "file_move",
            serde_json::json!({ "paths": ["docs/a.md"] }),
            Duration::from_secs(600),
        )
        .expect("create request")
        .id
}

#[test]
fn test_approvals_empty() {
    let project = TempDir::new().expect("temp dir");
    wardenctl(&project)
        .arg("approvals")
        .assert()
        .success()
        .stdout(predicate::str::contains("No approval requests."));
}

#[test]
fn test_approvals_lists_pending() {
    let project = TempDir::new().expect("temp dir");
    let id = seed_request(&project);
    wardenctl(&project)
        .args(["approvals", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(id.as_str()))
        .stdout(predicate::str::contains("\"status\": \"pending\""));
}

#[test]
fn test_approve_drops_mailbox_message() {
    let project = TempDir::new().expect("temp dir");
    let id = seed_request(&project);
    wardenctl(&project)
        .args(["approve", id.as_str(), "--by", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Submitted"));

    let messages = Mailbox::new(project.path().join(".warden/mailbox"))
        .read_all()
        .expect("read mailbox");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].1.approval_id, id);
    assert_eq!(messages[0].1.responded_by.as_deref(), Some("alice"));
}

#[test]
fn test_reject_unknown_id_fails() {
    let project = TempDir::new().expect("temp dir");
    wardenctl(&project)
        .args(["reject", "apr-999999"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no approval request"));
}

#[test]
fn test_needs_manual_empty() {
    let project = TempDir::new().expect("temp dir");
    wardenctl(&project)
        .arg("needs-manual")
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing needs manual attention."));
}

#[test]
fn test_leases_empty() {
    let project = TempDir::new().expect("temp dir");
    wardenctl(&project)
        .arg("leases")
        .assert()
        .success()
        .stdout(predicate::str::contains("No leases or locks."));
}
