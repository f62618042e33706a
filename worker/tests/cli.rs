//! CLI tests: spawn the worker binary against a scratch repository and check
//! exit codes and JSON output.

use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

use worker::exit_codes;
use worker::test_support::{DiffBuilder, TempRepo};

fn worker(repo: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_worker"))
        .arg("--repo")
        .arg(repo)
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("spawn worker")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("json stdout")
}

#[test]
fn check_accepts_clean_diff() {
    let repo = TempRepo::new();
    repo.write(
        "patch.diff",
        &DiffBuilder::new().added_file("src/app.ts", &["export {};"]).build(),
    );
    let output = worker(repo.path(), &["check", &repo.path().join("patch.diff").to_string_lossy()]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let report = stdout_json(&output);
    assert_eq!(report["valid"], Value::Bool(true));
    assert_eq!(report["files"][0], "src/app.ts");
    assert_eq!(report["risk"]["score"], "low");
}

#[test]
fn check_rejects_denylisted_path() {
    let repo = TempRepo::new();
    repo.write(
        "patch.diff",
        &DiffBuilder::new().added_file(".env", &["KEY=1"]).build(),
    );
    let output = worker(repo.path(), &["check", &repo.path().join("patch.diff").to_string_lossy()]);
    assert_eq!(output.status.code(), Some(exit_codes::REJECTED));
    let report = stdout_json(&output);
    assert_eq!(report["valid"], Value::Bool(false));
    assert!(
        !report["validation"]["errors"]
            .as_array()
            .expect("errors")
            .is_empty()
    );
}

#[test]
fn enqueue_status_cancel_round_trip() {
    let repo = TempRepo::new();
    let output = worker(repo.path(), &["enqueue", "--task", "rename the helper"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let run_id = String::from_utf8(output.stdout).expect("utf8").trim().to_string();
    assert!(run_id.starts_with("run-"));

    let status = worker(repo.path(), &["status", &run_id]);
    assert_eq!(status.status.code(), Some(exit_codes::OK));
    let record = stdout_json(&status);
    assert_eq!(record["status"], "queued");
    assert_eq!(record["task"], "rename the helper");

    let cancel = worker(repo.path(), &["cancel", &run_id]);
    assert_eq!(cancel.status.code(), Some(exit_codes::OK));
    let status = worker(repo.path(), &["status", &run_id, "--events"]);
    let record = stdout_json(&status);
    assert_eq!(record["run"]["status"], "cancelled");
    assert_eq!(record["events"][0]["event_type"], "STATUS_CHANGED");

    let again = worker(repo.path(), &["cancel", &run_id]);
    assert_eq!(again.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn poll_without_proposer_is_invalid() {
    let repo = TempRepo::new();
    let output = worker(repo.path(), &["poll", "--once"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("proposer.command"));
}

#[test]
fn init_writes_default_config() {
    let repo = TempRepo::new();
    let output = worker(repo.path(), &["init"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(repo.path().join(".worker/config.toml").exists());
}
