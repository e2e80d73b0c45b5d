// Sprint 5: Command-line demo
// Integration tests running the miniprof binary end to end

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_text_output_lists_page_and_xhr_profiles() {
    let mut cmd = Command::cargo_bin("miniprof").unwrap();
    cmd.arg("--requests").arg("3").arg("--threads").arg("2");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("page profile:"))
        .stdout(predicate::str::contains("<script async id=\"mini-profiler\""))
        .stdout(predicate::str::contains("/api/items/0"))
        .stdout(predicate::str::contains("/api/items/2"))
        .stdout(predicate::str::contains("/internal/prices/warm"))
        // page + 3 xhr + 1 internal
        .stdout(predicate::str::contains("fetched 5 profiles (5 fetches), 5 stored"));
}

#[test]
fn test_json_output_is_parseable() {
    let mut cmd = Command::cargo_bin("miniprof").unwrap();
    cmd.arg("--format").arg("json").arg("-n").arg("2");

    let output = cmd.assert().success().get_output().stdout.clone();
    let report: serde_json::Value = serde_json::from_slice(&output).unwrap();

    let results = report["results"].as_array().unwrap();
    assert_eq!(results.len(), 4);
    assert_eq!(results[0]["id"], report["page_id"]);
    assert_eq!(results[0]["url_path"], "/");
    assert!(results.iter().all(|r| r["method"].is_string()));
    assert!(results.iter().all(|r| r["duration_milliseconds"].as_f64().unwrap() >= 0.0));
    assert_eq!(report["fetches_started"], 4);
}

#[test]
fn test_tree_flag_prints_page_timings() {
    let mut cmd = Command::cargo_bin("miniprof").unwrap();
    cmd.arg("--tree").arg("-n").arg("0");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("=== Timing Tree: GET http://localhost:3000/ ==="))
        .stdout(predicate::str::contains("render layout"))
        .stdout(predicate::str::contains("SELECT value FROM settings"))
        .stdout(predicate::str::contains("(duplicate)"));
}

#[test]
fn test_config_file_sets_base_path() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("miniprof.toml");
    fs::write(&config, "base_url_path = \"/profiler\"\nauto_inject = true\n").unwrap();

    let mut cmd = Command::cargo_bin("miniprof").unwrap();
    cmd.arg("--config").arg(&config).arg("-n").arg("1");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("data-path=\"/profiler/\""));
}

#[test]
fn test_auto_inject_off_omits_bootstrap() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("miniprof.toml");
    fs::write(&config, "auto_inject = false\n").unwrap();

    let mut cmd = Command::cargo_bin("miniprof").unwrap();
    cmd.arg("--config").arg(&config).arg("-n").arg("1");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("bootstrap:").not());
}

#[test]
fn test_invalid_config_fails() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("miniprof.toml");
    fs::write(&config, "retention_secs = 0\n").unwrap();

    let mut cmd = Command::cargo_bin("miniprof").unwrap();
    cmd.arg("--config").arg(&config);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("retention_secs must be > 0"));
}

#[test]
fn test_missing_config_fails() {
    let mut cmd = Command::cargo_bin("miniprof").unwrap();
    cmd.arg("--config").arg("/nonexistent/miniprof.toml");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config"));
}

#[test]
fn test_zero_threads_rejected() {
    let mut cmd = Command::cargo_bin("miniprof").unwrap();
    cmd.arg("--threads").arg("0");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("--threads"));
}
