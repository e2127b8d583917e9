//! CLI smoke tests.

use assert_cmd::Command;

#[test]
fn test_help_lists_subcommands() {
    let mut cmd = Command::cargo_bin("turing").expect("binary builds");
    let assert = cmd.arg("--help").assert().success();
    let output = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(output.contains("demo"));
    assert!(output.contains("gate"));
    assert!(output.contains("verify"));
}

#[test]
fn test_gate_scores_benign_text() {
    let mut cmd = Command::cargo_bin("turing").expect("binary builds");
    let assert = cmd
        .args(["gate", "The deploy finished at 14:02."])
        .assert()
        .success();
    let output = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(
        output.starts_with("allow") || output.starts_with("quarantine"),
        "benign text should not be rejected: {output}"
    );
}

#[test]
fn test_verify_rejects_missing_file() {
    let mut cmd = Command::cargo_bin("turing").expect("binary builds");
    cmd.args(["verify", "/nonexistent/events.jsonl"])
        .assert()
        .failure();
}

#[test]
fn test_demo_prints_event_chain() {
    let mut cmd = Command::cargo_bin("turing").expect("binary builds");
    let assert = cmd.arg("demo").assert().success();
    let output = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(output.contains("events for demo-emote"));
    assert!(output.contains("decision:logged"));
    assert!(output.contains("chain valid: true"));
}
