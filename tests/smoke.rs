//! Smoke tests -- verify the binary runs and the CLI drives a full cycle.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn driftwatch(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("driftwatch").unwrap();
    cmd.env_remove("RUST_LOG")
        .env_remove("DRIFTWATCH_CONFIG")
        .arg("--config")
        .arg(config);
    cmd
}

/// Write a config whose store lives inside `dir`, plus a small labeled CSV.
fn workspace(dir: &TempDir) -> (PathBuf, PathBuf) {
    let store = dir.path().join("store");
    let config = dir.path().join("driftwatch.toml");
    std::fs::write(
        &config,
        format!(
            r#"
[features]
id_field = "host"
label_field = "label"

[[features.fields]]
name = "latency"

[store]
backend = "fs"
path = "{}"

[logging]
level = "warn"
"#,
            store.display().to_string().replace('\\', "/")
        ),
    )
    .unwrap();

    let csv = dir.path().join("hosts.csv");
    let mut body = String::from("host,latency,label\n");
    for i in 0..50 {
        body.push_str(&format!("h{},{},0\n", i, 20 + i % 9));
    }
    body.push_str("slow,400,1\n");
    std::fs::write(&csv, body).unwrap();
    (config, csv)
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("driftwatch")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("anomaly detection"))
        .stdout(predicate::str::contains("build-dataset"))
        .stdout(predicate::str::contains("train"))
        .stdout(predicate::str::contains("score"))
        .stdout(predicate::str::contains("evaluate"))
        .stdout(predicate::str::contains("versions"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("driftwatch")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("driftwatch"));
}

#[test]
fn test_versions_on_empty_store() {
    let dir = TempDir::new().unwrap();
    let (config, _) = workspace(&dir);
    driftwatch(&config)
        .arg("versions")
        .assert()
        .success()
        .stdout(predicate::str::contains("No models published."));
}

#[test]
fn test_score_requires_a_model() {
    let dir = TempDir::new().unwrap();
    let (config, csv) = workspace(&dir);
    driftwatch(&config)
        .arg("score")
        .arg("--input")
        .arg(&csv)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no model has been published"));
}

#[test]
fn test_train_needs_exactly_one_source() {
    let dir = TempDir::new().unwrap();
    let (config, csv) = workspace(&dir);
    driftwatch(&config).arg("train").assert().failure();
    driftwatch(&config)
        .args(["train", "--dataset", "x", "--input"])
        .arg(&csv)
        .assert()
        .failure();
}

#[test]
fn test_full_cycle() {
    let dir = TempDir::new().unwrap();
    let (config, csv) = workspace(&dir);

    driftwatch(&config)
        .args(["build-dataset", "--name", "hosts", "--input"])
        .arg(&csv)
        .assert()
        .success()
        .stdout(predicate::str::contains("Dataset 'hosts': 51 rows"));

    driftwatch(&config)
        .args(["train", "--input"])
        .arg(&csv)
        .assert()
        .success()
        .stdout(predicate::str::contains("Published model v000001"));

    driftwatch(&config)
        .args(["train", "--dataset", "hosts"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Published model v000002"));

    driftwatch(&config)
        .args(["score", "--anomalies-only", "--model", "v000001", "--input"])
        .arg(&csv)
        .assert()
        .success()
        .stdout(predicate::str::contains("Model v000001"))
        .stdout(predicate::str::contains("slow"));

    driftwatch(&config)
        .args(["--json", "score", "--dataset", "hosts"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"model_version\""))
        .stdout(predicate::str::contains("\"verdict\""));

    driftwatch(&config)
        .args(["evaluate", "--dataset", "hosts"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ROC AUC"));
    assert!(dir
        .path()
        .join("store/reports/v000002/score_histogram.svg")
        .is_file());

    driftwatch(&config)
        .arg("versions")
        .assert()
        .success()
        .stdout(predicate::str::contains("v000001"))
        .stdout(predicate::str::contains("v000002"));
}
