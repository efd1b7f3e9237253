//! End-to-end CLI tests for the agent text protocol.
//!
//! Each test gets its own state directory via `SETFARM_HOME`. The external
//! scheduler CLI is absent in the test environment; job creation degrades to
//! a warning and the protocol flows still run end to end.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

const WORKFLOW_YAML: &str = r#"
id: demo
steps:
  - id: plan
    agent: demo/planner
    input: "Plan for: ${TASK}"
    outputs: [SUMMARY]
"#;

fn setfarm(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("setfarm").expect("binary builds");
    cmd.env("SETFARM_HOME", home);
    cmd
}

fn write_workflow(home: &Path) {
    let dir = home.join("workflows");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("demo.yaml"), WORKFLOW_YAML).unwrap();
}

#[test]
fn happy_path_over_the_text_protocol() {
    let home = tempfile::tempdir().unwrap();
    write_workflow(home.path());

    // start a run
    let output = setfarm(home.path())
        .args(["run", "start", "demo", "--task", "fix the bug"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let run_id = String::from_utf8(output).unwrap().trim().to_string();
    assert!(!run_id.is_empty());

    // peek: there is work for the planner, none for a stranger
    setfarm(home.path())
        .args(["step", "peek", "demo/planner"])
        .assert()
        .success()
        .stdout(predicate::str::contains("HAS_WORK"));
    setfarm(home.path())
        .args(["step", "peek", "demo/stranger"])
        .assert()
        .success()
        .stdout(predicate::str::contains("NO_WORK"));

    // claim: JSON with the resolved input
    let output = setfarm(home.path())
        .args(["step", "claim", "demo/planner"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let claim: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(claim["input"], "Plan for: fix the bug");
    let unit_id = claim["stepId"].as_str().unwrap().to_string();

    // complete with the required output key on stdin
    setfarm(home.path())
        .args(["step", "complete", &unit_id])
        .write_stdin("SUMMARY: all done\n")
        .assert()
        .success();

    // the run is done and archived
    setfarm(home.path())
        .args(["run", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("done"));
    assert!(home.path().join("runs").join(format!("{run_id}.json")).exists());
}

#[test]
fn second_claim_sees_no_work() {
    let home = tempfile::tempdir().unwrap();
    write_workflow(home.path());
    setfarm(home.path())
        .args(["run", "start", "demo", "--task", "t"])
        .assert()
        .success();
    setfarm(home.path())
        .args(["step", "claim", "demo/planner"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stepId"));
    setfarm(home.path())
        .args(["step", "claim", "demo/planner"])
        .assert()
        .success()
        .stdout(predicate::str::contains("NO_WORK"));
}

#[test]
fn missing_outputs_are_rejected_with_nonzero_exit() {
    let home = tempfile::tempdir().unwrap();
    write_workflow(home.path());
    setfarm(home.path())
        .args(["run", "start", "demo", "--task", "t"])
        .assert()
        .success();
    let output = setfarm(home.path())
        .args(["step", "claim", "demo/planner"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let claim: serde_json::Value = serde_json::from_slice(&output).unwrap();
    let unit_id = claim["stepId"].as_str().unwrap().to_string();

    setfarm(home.path())
        .args(["step", "complete", &unit_id])
        .write_stdin("WRONG: key\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("SUMMARY"));
}

#[test]
fn fail_returns_the_step_to_the_queue() {
    let home = tempfile::tempdir().unwrap();
    write_workflow(home.path());
    setfarm(home.path())
        .args(["run", "start", "demo", "--task", "t"])
        .assert()
        .success();
    let output = setfarm(home.path())
        .args(["step", "claim", "demo/planner"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let claim: serde_json::Value = serde_json::from_slice(&output).unwrap();
    let unit_id = claim["stepId"].as_str().unwrap().to_string();

    setfarm(home.path())
        .args(["step", "fail", &unit_id, "agent crashed"])
        .assert()
        .success();
    setfarm(home.path())
        .args(["step", "peek", "demo/planner"])
        .assert()
        .success()
        .stdout(predicate::str::contains("HAS_WORK"));
}

#[test]
fn unknown_workflow_is_a_user_error() {
    let home = tempfile::tempdir().unwrap();
    setfarm(home.path())
        .args(["run", "start", "nope", "--task", "t"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn bad_arguments_exit_with_two() {
    let home = tempfile::tempdir().unwrap();
    setfarm(home.path())
        .args(["step", "peek"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn events_trace_the_run() {
    let home = tempfile::tempdir().unwrap();
    write_workflow(home.path());
    let output = setfarm(home.path())
        .args(["run", "start", "demo", "--task", "t"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let run_id = String::from_utf8(output).unwrap().trim().to_string();

    setfarm(home.path())
        .args(["events", &run_id])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("run.created").and(predicate::str::contains("step.pending")),
        );
}
