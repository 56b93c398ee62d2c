use assert_cmd::Command;
use predicates::prelude::*;

fn editor_fleet() -> Command {
    Command::cargo_bin("editor-fleet").expect("binary builds")
}

#[test]
fn test_help_lists_subcommands() {
    editor_fleet()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("workers"));
}

#[test]
fn test_version_flag() {
    editor_fleet()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("editor-fleet"));
}

#[test]
fn test_completions_generate() {
    editor_fleet()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("editor-fleet"));
}

#[test]
fn test_status_without_master_fails_with_hint() {
    // Nothing should be listening on this reserved-but-unlikely port.
    editor_fleet()
        .args(["status", "--port", "19100"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No master reachable on port 19100"));
}

#[test]
fn test_run_rejects_inverted_port_range() {
    editor_fleet()
        .args([
            "run",
            "--master-port",
            "9100",
            "--worker-port-start",
            "9199",
            "--worker-port-end",
            "9101",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_run_rejects_master_port_inside_worker_range() {
    editor_fleet()
        .args(["run", "--master-port", "9150"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}
