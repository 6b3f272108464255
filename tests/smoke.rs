//! Smoke tests -- verify the binary runs and every subcommand works end to end.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Small windows, raw events, no significance gate.
const FAST_CONFIG: &str = r#"
[detector]
baseline_size = 30
window_size = 30
hop_size = 10
max_capacity = 128
permutation_count = 20
require_statistical_significance = false

[tokenizer]
enable_jwt = false
enable_uuid = false
enable_hash = false
enable_base64 = false

[privacy]
enabled = false

[logging]
level = "warn"
"#;

fn driftwatch() -> Command {
    let mut cmd = Command::cargo_bin("driftwatch").unwrap();
    cmd.env_remove("DRIFTWATCH_CONFIG").env_remove("RUST_LOG");
    cmd
}

/// 59 identical events followed by one long burst of printable noise.
fn write_outlier_stream(path: &Path) {
    let mut rng = StdRng::seed_from_u64(7);
    let noise: String = (0..50_000)
        .map(|_| rng.gen_range(b'!'..=b'~') as char)
        .collect();

    let mut lines: Vec<String> = (0..59)
        .map(|_| r#"{"type":"normal","value":100}"#.to_string())
        .collect();
    lines.push(noise);
    std::fs::write(path, lines.join("\n")).unwrap();
}

#[test]
fn test_cli_help() {
    driftwatch()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Compression-based drift"));
}

#[test]
fn test_cli_version() {
    driftwatch()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("driftwatch"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["detect", "size", "tune", "config"] {
        driftwatch().args([sub, "--help"]).assert().success();
    }
}

#[test]
fn test_config_prints_toml() {
    driftwatch()
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[detector]"))
        .stdout(predicate::str::contains("baseline_size = 400"));
}

#[test]
fn test_config_applies_profile() {
    driftwatch()
        .args(["config", "--profile", "strict"])
        .assert()
        .success()
        .stdout(predicate::str::contains("baseline_size = 800"));
}

#[test]
fn test_missing_config_file_fails() {
    driftwatch()
        .args(["--config", "/nonexistent/driftwatch.toml", "config"])
        .assert()
        .failure();
}

#[test]
fn test_detect_flags_outlier() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("driftwatch.toml");
    let events = dir.path().join("events.jsonl");
    std::fs::write(&config, FAST_CONFIG).unwrap();
    write_outlier_stream(&events);

    driftwatch()
        .arg("--config")
        .arg(&config)
        .arg("detect")
        .arg("--input")
        .arg(&events)
        .assert()
        .success()
        .stdout(predicate::str::contains("ANOMALY"))
        .stdout(predicate::str::contains("60 events, 1 cycles, 1 anomalies"));
}

#[test]
fn test_detect_json_records_parse() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("driftwatch.toml");
    let events = dir.path().join("events.jsonl");
    std::fs::write(&config, FAST_CONFIG).unwrap();
    write_outlier_stream(&events);

    let output = driftwatch()
        .arg("--config")
        .arg(&config)
        .args(["detect", "--json", "--stream", "api", "--input"])
        .arg(&events)
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let records: Vec<serde_json::Value> = stdout
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["stream"], "api");
    assert_eq!(records[0]["is_anomaly"], true);
    assert!(records[0]["metrics"]["ncd"].as_f64().unwrap() > 0.9);
}

#[test]
fn test_detect_short_input_runs_no_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("driftwatch.toml");
    let events = dir.path().join("events.jsonl");
    std::fs::write(&config, FAST_CONFIG).unwrap();
    std::fs::write(&events, "a\nb\n\nc\n").unwrap();

    driftwatch()
        .arg("--config")
        .arg(&config)
        .arg("detect")
        .arg("--input")
        .arg(&events)
        .assert()
        .success()
        .stdout(predicate::str::contains("4 events, 0 cycles, 0 anomalies, 0 dropped, 1 blank"));
}

#[test]
fn test_size_recommends_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let events = dir.path().join("events.jsonl");
    let lines: Vec<&str> = std::iter::repeat(r#"{"level":"info","msg":"ok"}"#)
        .take(50)
        .collect();
    std::fs::write(&events, lines.join("\n")).unwrap();

    let output = driftwatch()
        .args(["size", "--json", "--input"])
        .arg(&events)
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let baseline = value["recommendation"]["baseline_size"].as_u64().unwrap();
    let window = value["recommendation"]["window_size"].as_u64().unwrap();
    assert!((100..=2000).contains(&baseline));
    assert!((10..=200).contains(&window));
    assert!(window <= baseline);
    assert_eq!(value["characteristics"]["pattern_diversity"], 0.0);
}

#[test]
fn test_tune_applies_then_cools_down() {
    let dir = tempfile::tempdir().unwrap();
    let history = dir.path().join("state").join("tune.jsonl");
    let args = [
        "tune",
        "--total",
        "100",
        "--false-positives",
        "30",
        "--confirmed",
        "10",
        "--ncd",
        "0.3",
        "--p-value",
        "0.05",
        "--stream",
        "api",
        "--history",
    ];

    driftwatch()
        .args(args)
        .arg(&history)
        .assert()
        .success()
        .stdout(predicate::str::contains("high_false_positive_rate"))
        .stdout(predicate::str::contains("0.3375"))
        .stdout(predicate::str::contains("applied"));

    let log = std::fs::read_to_string(&history).unwrap();
    assert_eq!(log.lines().count(), 2);

    driftwatch()
        .args(args)
        .arg(&history)
        .assert()
        .success()
        .stdout(predicate::str::contains("cooling down"));
}

#[test]
fn test_tune_rejects_inconsistent_counts() {
    driftwatch()
        .args([
            "tune",
            "--total",
            "10",
            "--false-positives",
            "8",
            "--confirmed",
            "8",
            "--ncd",
            "0.3",
            "--p-value",
            "0.05",
        ])
        .assert()
        .failure();
}
