//! Smoke tests -- verify the binary runs and drives a simulated test end to end.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

/// Config that makes simulated runs finish instantly with fast polling.
fn fast_config() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[orchestrator]\nwarm_up_ms = 1\npoll_interval_ms = 5\n\n[engine]\ntime_scale = 0.0\n\n[logging]\nlevel = \"warn\""
    )
    .unwrap();
    file
}

fn benchhost(config: &tempfile::NamedTempFile) -> Command {
    let mut cmd = Command::cargo_bin("benchhost").unwrap();
    cmd.env_remove("BENCHHOST_CONFIG")
        .arg("--config")
        .arg(config.path());
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("benchhost")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("benchmark engine"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("benchhost")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("benchhost"));
}

#[test]
fn test_tests_lists_catalog() {
    let config = fast_config();
    benchhost(&config)
        .arg("tests")
        .assert()
        .success()
        .stdout(predicate::str::contains("AutomatedSuite"))
        .stdout(predicate::str::contains("VoiceMark"));
}

#[test]
fn test_params_marks_defaults() {
    let config = fast_config();
    benchhost(&config)
        .args(["params", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Audio Level"))
        .stdout(predicate::str::contains("1*"));
}

#[test]
fn test_params_json_is_parseable() {
    let config = fast_config();
    let output = benchhost(&config)
        .args(["params", "5", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let params = parsed.as_array().unwrap();
    assert!(params
        .iter()
        .any(|p| p["description"] == "Target CPU Load"));
}

#[test]
fn test_run_streams_until_completed() {
    let config = fast_config();
    benchhost(&config)
        .args(["run", "0", "--set", "2=2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[0] started"))
        .stdout(predicate::str::contains("[0] completed"));
}

#[test]
fn test_run_json_lines() {
    let config = fast_config();
    let output = benchhost(&config)
        .args(["run", "3", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let kinds: Vec<String> = stdout
        .lines()
        .map(|line| {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(v["at"].is_string());
            v["event"]["kind"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(kinds.first().map(String::as_str), Some("started"));
    assert!(kinds.iter().any(|k| k == "completed"));
}

#[test]
fn test_run_rejects_malformed_assignment() {
    let config = fast_config();
    benchhost(&config)
        .args(["run", "0", "--set", "nonsense"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("IDX=VALUE"));
}

#[test]
fn test_missing_config_is_error() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("benchhost")
        .unwrap()
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg("tests")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read config file"));
}

#[test]
fn test_unreadable_env_config_falls_back_with_warning() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("benchhost")
        .unwrap()
        .current_dir(dir.path())
        .env_remove("RUST_LOG")
        .env("BENCHHOST_CONFIG", dir.path().join("absent.toml"))
        .arg("tests")
        .assert()
        .success()
        .stdout(predicate::str::contains("AutomatedSuite"))
        .stderr(predicate::str::contains("could not be loaded"));
}
