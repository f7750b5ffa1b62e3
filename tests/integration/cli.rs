//! Tests of the `quillforge` binary.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn quillforge() -> Command {
    let mut cmd = Command::cargo_bin("quillforge").unwrap();
    cmd.env("RUST_LOG", "warn");
    cmd
}

const REQUESTS: &str = r#"[
  {"client": {"client_id": "studio", "user_id": "ana", "tier": "pro"},
   "payload": "saga/1", "stages": 2, "target_words": 1500},
  {"client": {"client_id": "studio", "user_id": "ana", "tier": "pro"},
   "payload": "saga/2", "priority": 5}
]"#;

#[test]
fn test_help() {
    quillforge()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("simulate"))
        .stdout(predicate::str::contains("inspect"));
}

#[test]
fn test_check_config_prints_defaults() {
    quillforge()
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("max_parallel = 3"))
        .stdout(predicate::str::contains("[rate_limit_tiers.free]"));
}

#[test]
fn test_check_config_reads_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("quillforge.toml");
    fs::write(&path, "max_parallel = 5\nqueue_capacity = 10\n").unwrap();

    quillforge()
        .args(["check-config", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("max_parallel = 5"))
        .stdout(predicate::str::contains("queue_capacity = 10"));
}

#[test]
fn test_check_config_rejects_invalid_values() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("quillforge.toml");
    fs::write(&path, "max_parallel = 0\n").unwrap();

    quillforge()
        .args(["check-config", "--config"])
        .arg(&path)
        .assert()
        .failure();
}

#[test]
fn test_simulate_completes_batch() {
    let dir = TempDir::new().unwrap();
    let requests = dir.path().join("batch.json");
    fs::write(&requests, REQUESTS).unwrap();

    quillforge()
        .args(["simulate", "--quiet", "--transient-failures", "1", "--requests"])
        .arg(&requests)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"accepted\""))
        .stdout(predicate::str::contains("\"completed\": 2"));
}

#[test]
fn test_simulate_reports_denials() {
    let dir = TempDir::new().unwrap();
    let requests = dir.path().join("batch.json");
    fs::write(&requests, REQUESTS).unwrap();

    quillforge()
        .args(["simulate", "--quiet", "--budget", "0", "--requests"])
        .arg(&requests)
        .assert()
        .success()
        .stdout(predicate::str::contains("BUDGET_EXCEEDED"));
}

#[test]
fn test_inspect_lists_store() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("store");
    let requests = dir.path().join("batch.json");
    fs::write(&requests, REQUESTS).unwrap();

    quillforge()
        .args(["simulate", "--quiet", "--store"])
        .arg(&store)
        .arg("--requests")
        .arg(&requests)
        .assert()
        .success();

    // Completed jobs leave no records or checkpoints behind.
    quillforge()
        .args(["inspect", "--store"])
        .arg(&store)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"records\": []"))
        .stdout(predicate::str::contains("\"checkpoints\": []"));
}

#[test]
fn test_inspect_missing_store_fails() {
    let dir = TempDir::new().unwrap();
    quillforge()
        .args(["inspect", "--store"])
        .arg(dir.path().join("absent"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}
