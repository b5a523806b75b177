//! Smoke tests -- verify the binary runs and the command surface is wired.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;

/// Config with an iperf3 path that cannot exist and a private datastore.
fn broken_load_config(dir: &Path) -> PathBuf {
    let path = dir.join("netexp.toml");
    std::fs::write(
        &path,
        format!(
            "[load]\niperf3_path = \"/nonexistent/netexp-test/iperf3\"\n\n[storage]\ndb_path = \"{}\"\n",
            dir.join("results.db").display()
        ),
    )
    .unwrap();
    path
}

fn netexp() -> Command {
    let mut cmd = Command::cargo_bin("netexp").unwrap();
    cmd.env_remove("NETEXP_CONFIG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    netexp()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Network experiment orchestrator"));
}

#[test]
fn test_cli_version() {
    netexp()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("netexp"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["run", "monitor", "batch", "history", "check"] {
        netexp().args([sub, "--help"]).assert().success();
    }
}

#[test]
fn test_run_requires_interface() {
    netexp()
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--interface"));
}

#[test]
fn test_missing_config_file_is_fatal() {
    netexp()
        .args(["--config", "/nonexistent/netexp.toml", "history"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read config file"));
}

#[test]
fn test_check_reports_missing_load_generator() {
    let dir = tempfile::TempDir::new().unwrap();
    let cfg = broken_load_config(dir.path());

    netexp()
        .arg("--config")
        .arg(&cfg)
        .args(["check", "--json"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("Load generator"))
        .stdout(predicate::str::contains("\"fail\""));
}

#[test]
fn test_run_stops_before_starting_without_load_generator() {
    let dir = tempfile::TempDir::new().unwrap();
    let cfg = broken_load_config(dir.path());
    let out = dir.path().join("results");

    netexp()
        .arg("--config")
        .arg(&cfg)
        .args(["run", "--interface", "lo", "--duration", "1", "--output"])
        .arg(&out)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("required collaborators are missing"));

    assert!(!out.exists());
}

#[test]
fn test_invalid_run_leaves_failed_result() {
    let dir = tempfile::TempDir::new().unwrap();
    let cfg = broken_load_config(dir.path());
    let out = dir.path().join("results");

    netexp()
        .arg("--config")
        .arg(&cfg)
        .args(["run", "--interface", "lo", "--parallel", "0", "--output"])
        .arg(&out)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Status:   failure"))
        .stdout(predicate::str::contains("parallel"));

    let result = std::fs::read_to_string(out.join("run").join("result.json")).unwrap();
    let v: serde_json::Value = serde_json::from_str(&result).unwrap();
    assert_eq!(v["status"], "failure");
    assert_eq!(v["failure"]["stage"], "descriptor");
    assert!(out.join("run").join("run.log").exists());

    netexp()
        .arg("--config")
        .arg(&cfg)
        .arg("history")
        .assert()
        .success()
        .stdout(predicate::str::contains("failure"));
}

#[test]
fn test_invalid_monitor_interface_leaves_failed_result() {
    let dir = tempfile::TempDir::new().unwrap();
    let cfg = broken_load_config(dir.path());
    let out = dir.path().join("results");

    netexp()
        .arg("--config")
        .arg(&cfg)
        .args(["monitor", "--interface", "lo/0", "--name", "cap", "--output"])
        .arg(&out)
        .assert()
        .code(1);

    assert!(out.join("cap").join("result.json").exists());
}

#[test]
fn test_unusable_run_name_is_an_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let out = dir.path().join("results");

    netexp()
        .args(["run", "--interface", "lo", "--name", "../escape", "--output"])
        .arg(&out)
        .assert()
        .failure()
        .stderr(predicate::str::contains("plain directory name"));

    assert!(!dir.path().join("escape").exists());
}

#[test]
fn test_batch_stops_before_starting_without_load_generator() {
    let dir = tempfile::TempDir::new().unwrap();
    let cfg = broken_load_config(dir.path());

    netexp()
        .arg("--config")
        .arg(&cfg)
        .args(["batch", "/nonexistent/plans"])
        .assert()
        .code(2);
}

#[test]
fn test_history_on_empty_store() {
    let dir = tempfile::TempDir::new().unwrap();
    let cfg = broken_load_config(dir.path());

    netexp()
        .arg("--config")
        .arg(&cfg)
        .arg("history")
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs recorded."));
}

#[test]
fn test_unknown_role_is_rejected() {
    netexp()
        .args(["run", "--interface", "lo", "--role", "relay"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown role"));
}
