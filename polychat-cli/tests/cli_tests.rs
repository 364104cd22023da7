#![cfg_attr(not(test), forbid(unsafe_code))]
#![deny(warnings, clippy::pedantic)]
#![allow(clippy::multiple_crate_versions)]
//! Integration tests for the `polychat` binary.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::PredicateBooleanExt;
use std::fs;
use tempfile::tempdir;

#[test]
fn test_help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("polychat");
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicates::str::contains("compare"))
        .stdout(predicates::str::contains("defaults"))
        .stdout(predicates::str::contains("completion"))
        .stdout(predicates::str::contains("config"));
}

#[test]
fn test_compare_requires_a_model() {
    let mut cmd = cargo_bin_cmd!("polychat");
    cmd.args(["compare", "hello"])
        .timeout(std::time::Duration::from_secs(5));

    cmd.assert()
        .failure()
        .stderr(predicates::str::contains(
            "the following required arguments were not provided",
        ))
        .stderr(predicates::str::contains("--model <MODELS>"));
}

#[test]
fn test_compare_rejects_zero_runs() {
    let mut cmd = cargo_bin_cmd!("polychat");
    cmd.args(["compare", "--model", "a/b", "--runs", "0", "hello"])
        .timeout(std::time::Duration::from_secs(5));

    cmd.assert()
        .failure()
        .stderr(predicates::str::contains("invalid value"));
}

#[test]
fn test_config_writes_yaml_and_json() {
    let dir = tempdir().unwrap();
    let yaml = dir.path().join("polychat.yaml");
    let json = dir.path().join("polychat.json");

    cargo_bin_cmd!("polychat")
        .args(["config", "--format", "yaml", "--output"])
        .arg(&yaml)
        .assert()
        .success()
        .stdout(predicates::str::contains("generated successfully"));
    cargo_bin_cmd!("polychat")
        .args(["config", "--format", "json", "--output"])
        .arg(&json)
        .assert()
        .success();

    let yaml = fs::read_to_string(yaml).unwrap();
    assert!(yaml.contains("stall_timeout_secs: 30"));
    assert!(yaml.contains("id: common"));

    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(json).unwrap()).unwrap();
    assert_eq!(json["orchestrator"]["persist_debounce_ms"], 500);
}

#[test]
fn test_config_rejects_unknown_format() {
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("polychat")
        .current_dir(dir.path())
        .args(["config", "--format", "toml"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("Unsupported format"));
}

#[test]
fn test_completion_generates_script() {
    cargo_bin_cmd!("polychat")
        .args(["completion", "--shell", "bash"])
        .assert()
        .success()
        .stdout(predicates::str::contains("polychat"));

    cargo_bin_cmd!("polychat")
        .args(["completion", "--shell", "tcsh"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("invalid shell type"));
}

#[test]
fn test_defaults_merge_matching_entries() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("config.yaml");
    fs::write(
        &config,
        r#"
defaults:
  - id: common
    name: Common
    output_format: text
  - id: anthropic
    name: Anthropic
    pattern: "^anthropic/"
    temperature: 0.2
"#,
    )
    .unwrap();

    cargo_bin_cmd!("polychat")
        .args(["defaults", "--model", "anthropic/claude-3-opus", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicates::str::contains("temperature: 0.2"))
        .stdout(predicates::str::contains("output_format: text"));

    cargo_bin_cmd!("polychat")
        .args(["defaults", "--model", "openai/gpt-4o", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicates::str::contains("output_format: text"))
        .stdout(predicates::str::contains("temperature").not());
}

#[test]
fn test_invalid_config_is_reported() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("config.yaml");
    fs::write(&config, "api:\n  base_url: ftp://example.com\n").unwrap();

    cargo_bin_cmd!("polychat")
        .args(["defaults", "--model", "m", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicates::str::contains("invalid configuration"));
}
