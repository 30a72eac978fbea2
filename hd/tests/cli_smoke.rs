//! CLI smoke tests - the binary parses and refuses sensibly without a daemon

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_lists_subcommands() {
    Command::cargo_bin("hd")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("timeline"))
        .stdout(predicate::str::contains("decisions"));
}

#[test]
fn test_worker_subcommand_is_hidden() {
    Command::cargo_bin("hd")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("worker").not());
}

#[test]
fn test_missing_explicit_config_fails_cleanly() {
    Command::cargo_bin("hd")
        .unwrap()
        .args(["--config", "/nonexistent/hivedaemon.yml", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("config"));
}

#[test]
fn test_unknown_subcommand_rejected() {
    Command::cargo_bin("hd")
        .unwrap()
        .arg("frobnicate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("frobnicate"));
}
