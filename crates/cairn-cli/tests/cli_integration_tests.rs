//! CLI integration tests for cairn
//!
//! Tests the cairn CLI commands end-to-end using assert_cmd.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Helper to create a command whose state lives in `dir`
#[allow(deprecated)]
fn cairn_cmd(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("cairn").unwrap();
    cmd.env("CAIRN_CONFIG_DIR", dir.path());
    cmd.env("RUST_LOG", "cairn=warn");
    cmd.arg("--state-dir").arg(dir.path());
    cmd
}

fn init_roster(dir: &TempDir, backends: &str) {
    cairn_cmd(dir)
        .args(["config", "init", "--backends", backends])
        .assert()
        .success();
}

fn select(dir: &TempDir) -> String {
    let output = cairn_cmd(dir)
        .args(["--quiet", "select", "-t", "application/pdf", "-s", "1048576"])
        .output()
        .unwrap();
    assert!(output.status.success());
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

#[test]
fn test_config_init_and_show() {
    let dir = TempDir::new().unwrap();
    init_roster(&dir, "s3,ipfs");

    cairn_cmd(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"s3\""))
        .stdout(predicate::str::contains("\"default_strategy\": \"hybrid\""));

    assert!(dir.path().join("routing.json").exists());
}

#[test]
fn test_config_init_refuses_to_overwrite() {
    let dir = TempDir::new().unwrap();
    init_roster(&dir, "a");

    cairn_cmd(&dir)
        .args(["config", "init", "--backends", "b"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    cairn_cmd(&dir)
        .args(["config", "init", "--backends", "b", "--force"])
        .assert()
        .success();
}

#[test]
fn test_invalid_weights_are_rejected_with_reason() {
    let dir = TempDir::new().unwrap();
    init_roster(&dir, "a,b");

    cairn_cmd(&dir)
        .args(["config", "set-weights", "--content-match", "0.07"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("weights sum to 0.870, expected 1.0"));

    cairn_cmd(&dir)
        .args([
            "config",
            "set-weights",
            "--cost-efficiency",
            "0.10",
            "--content-match",
            "0.25",
        ])
        .assert()
        .success();
}

#[test]
fn test_config_set_rejects_duplicate_backends() {
    let dir = TempDir::new().unwrap();
    init_roster(&dir, "a");

    cairn_cmd(&dir)
        .args(["config", "set", "backends", "a,b,a"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("appears more than once"));
}

#[test]
fn test_select_returns_roster_member() {
    let dir = TempDir::new().unwrap();
    init_roster(&dir, "A,B,C");

    let selected = select(&dir);
    assert!(["A", "B", "C"].contains(&selected.as_str()));
}

#[test]
fn test_select_json_output() {
    let dir = TempDir::new().unwrap();
    init_roster(&dir, "A,B");

    let output = cairn_cmd(&dir)
        .args(["--format", "json", "select", "-t", "image/png", "-s", "10"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let decision: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(decision["content_type"], "image/png");
    assert_eq!(decision["strategy"], "hybrid");
    assert!(decision["id"].is_string());
}

#[test]
fn test_select_with_empty_filter_fails() {
    let dir = TempDir::new().unwrap();
    init_roster(&dir, "A,B");

    cairn_cmd(&dir)
        .args(["select", "-t", "application/pdf", "--available"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No backends available"));
}

#[test]
fn test_learned_scores_persist_between_runs() {
    let dir = TempDir::new().unwrap();
    init_roster(&dir, "A,B,C");

    let first = select(&dir);
    for _ in 0..5 {
        cairn_cmd(&dir)
            .args([
                "outcome",
                &first,
                "-t",
                "application/pdf",
                "-s",
                "1048576",
                "--failed",
            ])
            .assert()
            .success();
    }

    let second = select(&dir);
    assert_ne!(first, second);
}

#[test]
fn test_outcome_for_unknown_backend_fails() {
    let dir = TempDir::new().unwrap();
    init_roster(&dir, "A");

    cairn_cmd(&dir)
        .args(["outcome", "ghost", "-t", "text/plain"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown backend 'ghost'"));
}

#[test]
fn test_stats_and_prune() {
    let dir = TempDir::new().unwrap();
    init_roster(&dir, "A");

    for failed in [false, false, false, true] {
        let mut cmd = cairn_cmd(&dir);
        cmd.args(["outcome", "A", "-t", "text/plain", "--duration-ms", "20"]);
        if failed {
            cmd.arg("--failed");
        }
        cmd.assert().success();
    }

    let output = cairn_cmd(&dir)
        .args(["--format", "json", "stats", "--window-hours", "1"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stats: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(stats["success_rates"]["A"]["rate"], 0.75);
    assert_eq!(stats["rows"]["outcomes"], 4);

    cairn_cmd(&dir)
        .args(["prune"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Pruned 0 rows"));
}

#[test]
fn test_insights_lists_factors() {
    let dir = TempDir::new().unwrap();
    init_roster(&dir, "A");

    cairn_cmd(&dir)
        .args(["insights"])
        .assert()
        .success()
        .stdout(predicate::str::contains("historical_success"))
        .stdout(predicate::str::contains("no outcomes yet"));
}
