//! CLI test cases.

use std::io::Write as _;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("question-forge").unwrap()
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_generation_schema() {
    cmd()
        .arg("schema")
        .arg("generation")
        .assert()
        .success()
        .stdout(predicate::str::contains("question_text"))
        .stdout(predicate::str::contains("answer_options"))
        .stdout(predicate::str::contains("stimulus"));
}

#[test]
fn test_evaluation_schema() {
    cmd()
        .arg("schema")
        .arg("evaluation")
        .assert()
        .success()
        .stdout(predicate::str::contains("clarity_score"))
        .stdout(predicate::str::contains("difficulty_score"))
        .stdout(predicate::str::contains("creativity_score"))
        .stdout(predicate::str::contains("feedback"));
}

#[test]
fn test_run_with_missing_judge_config_exits_1() {
    cmd()
        .arg("run")
        .arg("--judge-config")
        .arg("does/not/exist.yaml")
        .arg("--dry-run")
        .assert()
        .code(1);
}

#[test]
fn test_run_with_invalid_judge_config_exits_1() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    // Weights sum to 1.4, which the validator rejects.
    write!(
        config,
        r#"
version: "bad"
min_judge_score: 0.7
evaluation_criteria:
  clarity: 0.7
  validity: 0.3
  formatting: 0.2
  creativity: 0.2
default_judge:
  model: gpt-4-turbo-preview
  provider: openai
  rationale: default
judges:
  pattern: {{ model: m, provider: openai, rationale: r }}
  logic: {{ model: m, provider: openai, rationale: r }}
  spatial: {{ model: m, provider: openai, rationale: r }}
  math: {{ model: m, provider: openai, rationale: r }}
  verbal: {{ model: m, provider: openai, rationale: r }}
  memory: {{ model: m, provider: openai, rationale: r }}
"#
    )
    .unwrap();

    cmd()
        .arg("run")
        .arg("--judge-config")
        .arg(config.path())
        .arg("--dry-run")
        .assert()
        .code(1);
}

#[test]
fn test_run_with_unknown_question_type_exits_1() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    write!(
        config,
        r#"
version: "ok"
min_judge_score: 0.7
evaluation_criteria:
  clarity: 0.3
  validity: 0.3
  formatting: 0.2
  creativity: 0.2
default_judge:
  model: gpt-4-turbo-preview
  provider: openai
  rationale: default
judges:
  pattern: {{ model: m, provider: openai, rationale: r }}
  logic: {{ model: m, provider: openai, rationale: r }}
  spatial: {{ model: m, provider: openai, rationale: r }}
  math: {{ model: m, provider: openai, rationale: r }}
  verbal: {{ model: m, provider: openai, rationale: r }}
  memory: {{ model: m, provider: openai, rationale: r }}
"#
    )
    .unwrap();

    cmd()
        .arg("run")
        .arg("--judge-config")
        .arg(config.path())
        .arg("--types")
        .arg("astrology")
        .arg("--dry-run")
        .assert()
        .code(1);
}
