//! End-to-end CLI tests for the netupdate binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

/// Test that the binary can be invoked and exits with code 0.
#[test]
fn test_binary_invocation_returns_zero() {
    let mut cmd = Command::cargo_bin("netupdate").unwrap();
    cmd.assert().success();
}

/// Test that --help displays usage information and exits with code 0.
#[test]
fn test_binary_help_displays_usage() {
    let mut cmd = Command::cargo_bin("netupdate").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Fetch files and apply updates"))
        .stdout(predicate::str::contains("fetch"))
        .stdout(predicate::str::contains("update"));
}

/// Test that --version displays version and exits with code 0.
#[test]
fn test_binary_version_displays_version() {
    let mut cmd = Command::cargo_bin("netupdate").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("netupdate"));
}

/// Test that invalid flags cause non-zero exit.
#[test]
fn test_binary_invalid_flag_returns_error() {
    let mut cmd = Command::cargo_bin("netupdate").unwrap();
    cmd.arg("--invalid-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_hash_prints_digest_and_path() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("abc.txt");
    std::fs::write(&file, b"abc").unwrap();

    Command::cargo_bin("netupdate")
        .unwrap()
        .args(["hash", file.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::starts_with(ABC_SHA256));
}

#[test]
fn test_hash_expect_match_succeeds() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("abc.txt");
    std::fs::write(&file, b"abc").unwrap();

    Command::cargo_bin("netupdate")
        .unwrap()
        .args(["hash", file.to_str().unwrap(), "--expect"])
        .arg(ABC_SHA256.to_uppercase())
        .assert()
        .success()
        .stdout(predicate::str::contains("OK"));
}

#[test]
fn test_hash_expect_mismatch_fails() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("abc.txt");
    std::fs::write(&file, b"abd").unwrap();

    Command::cargo_bin("netupdate")
        .unwrap()
        .args(["hash", file.to_str().unwrap(), "-e", ABC_SHA256])
        .assert()
        .failure()
        .stderr(predicate::str::contains("checksum mismatch"));
}

#[test]
fn test_hash_unknown_algorithm_fails() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("abc.txt");
    std::fs::write(&file, b"abc").unwrap();

    Command::cargo_bin("netupdate")
        .unwrap()
        .args(["hash", file.to_str().unwrap(), "-a", "crc32"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("crc32"));
}

#[test]
fn test_update_missing_config_fails() {
    Command::cargo_bin("netupdate")
        .unwrap()
        .args(["update", "--config", "/definitely/not/here.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("here.json"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_downloads_to_output() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/notes.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("release notes"))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let output = temp.path().join("notes.txt");
    let url = format!("{}/notes.txt", server.uri());
    let target = output.clone();

    tokio::task::spawn_blocking(move || {
        Command::cargo_bin("netupdate")
            .unwrap()
            .args(["-q", "fetch", url.as_str(), "-o", target.to_str().unwrap()])
            .assert()
            .success();
    })
    .await
    .unwrap();

    assert_eq!(std::fs::read_to_string(&output).unwrap(), "release notes");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_http_error_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let output = temp.path().join("missing.bin");
    let url = server.uri();
    let target = output.clone();

    tokio::task::spawn_blocking(move || {
        Command::cargo_bin("netupdate")
            .unwrap()
            .args(["fetch", url.as_str(), "-o", target.to_str().unwrap()])
            .args(["-r", "1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("HTTP 404"));
    })
    .await
    .unwrap();

    assert!(!output.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_update_check_only_reports_no_update() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/maintenance"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/update"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let config = temp.path().join("engine.json");
    std::fs::write(
        &config,
        serde_json::json!({
            "network": {"api_root": server.uri()},
            "updater": {"work_dir": temp.path()}
        })
        .to_string(),
    )
    .unwrap();

    tokio::task::spawn_blocking(move || {
        Command::cargo_bin("netupdate")
            .unwrap()
            .args(["update", "--check-only", "--config", config.to_str().unwrap()])
            .assert()
            .success()
            .stdout(predicate::str::contains("no update available"));
    })
    .await
    .unwrap();
}
