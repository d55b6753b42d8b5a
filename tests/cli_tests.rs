// CLI integration tests: artifacts on disk, summary on stdout, errors on stderr

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

const TRACE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/fetch_trace.txt");
const FDS: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/fetch_fds.json");

fn tracelift() -> Command {
    Command::cargo_bin("tracelift").unwrap()
}

#[test]
fn test_text_summary_and_artifacts() {
    let out = TempDir::new().unwrap();
    tracelift()
        .arg(TRACE)
        .arg("-o")
        .arg(out.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("parse errors: 1"))
        .stdout(predicate::str::contains("socket_recv"))
        .stdout(predicate::str::contains("openat"));

    for name in [
        "processes.json",
        "threads.json",
        "files.json",
        "sockets.json",
        "cpus.json",
        "event_sequences.json",
        "summary.json",
    ] {
        assert!(out.path().join(name).exists(), "{name} missing");
    }
    assert!(!out.path().join("events.json").exists());
}

#[test]
fn test_json_summary() {
    let out = TempDir::new().unwrap();
    let assert = tracelift()
        .arg(TRACE)
        .args(["--format", "json", "-o"])
        .arg(out.path())
        .assert()
        .success();

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let summary: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(summary["total_lines"], 29);
    assert_eq!(summary["parse_errors"], 1);
    assert_eq!(summary["total_sequences"], 9);
}

#[test]
fn test_emit_events_and_snapshot() {
    let out = TempDir::new().unwrap();
    tracelift()
        .arg(TRACE)
        .args(["--fd-snapshot", FDS, "--emit-events", "-o"])
        .arg(out.path())
        .assert()
        .success();

    let events: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out.path().join("events.json")).unwrap()).unwrap();
    assert_eq!(events.as_array().unwrap().len(), 27);

    let files = fs::read_to_string(out.path().join("files.json")).unwrap();
    assert!(files.contains("/dev/pts/0"));
}

#[test]
fn test_config_file_applies_rules() {
    let out = TempDir::new().unwrap();
    let mut config = NamedTempFile::new().unwrap();
    writeln!(config, "[pipeline]").unwrap();
    writeln!(config, "prescan_context = true").unwrap();
    writeln!(config, "[[rule]]").unwrap();
    writeln!(config, "operation = \"wait\"").unwrap();
    writeln!(config, "syscalls = [\"wait4\"]").unwrap();
    config.flush().unwrap();

    tracelift()
        .arg(TRACE)
        .arg("--config")
        .arg(config.path())
        .arg("-o")
        .arg(out.path())
        .assert()
        .success();

    let sequences = fs::read_to_string(out.path().join("event_sequences.json")).unwrap();
    assert!(sequences.contains("\"seq_open_1\""));
    // wait4 never returned, so the rule matched nothing
    assert!(!sequences.contains("\"wait\""));
}

#[test]
fn test_invalid_config_fails() {
    let out = TempDir::new().unwrap();
    let mut config = NamedTempFile::new().unwrap();
    writeln!(config, "[[rule]]").unwrap();
    writeln!(config, "operation = \"read\"").unwrap();
    writeln!(config, "syscalls = []").unwrap();
    config.flush().unwrap();

    tracelift()
        .arg(TRACE)
        .arg("--config")
        .arg(config.path())
        .arg("-o")
        .arg(out.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("no syscalls listed"));
}

#[test]
fn test_missing_trace_fails() {
    let out = TempDir::new().unwrap();
    tracelift()
        .arg("/nonexistent/trace.txt")
        .arg("-o")
        .arg(out.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("/nonexistent/trace.txt"));
}

#[test]
fn test_bad_snapshot_fails() {
    let out = TempDir::new().unwrap();
    let mut snapshot = NamedTempFile::new().unwrap();
    writeln!(snapshot, "not json").unwrap();
    snapshot.flush().unwrap();

    tracelift()
        .arg(TRACE)
        .arg("--fd-snapshot")
        .arg(snapshot.path())
        .arg("-o")
        .arg(out.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("descriptor snapshot"));
}
