//! CLI Integration Tests
//!
//! These tests verify the CLI commands work correctly end-to-end.
//! Peer-to-peer is disabled with `--no-p2p` so lookups read the fallback
//! directory under the temporary data directory.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const KEY: &str = "9b3e4c2f9b3e4c2f9b3e4c2f9b3e4c2f9b3e4c2f9b3e4c2f9b3e4c2f9b3e4c2f";

// ============================================================================
// Test Utilities
// ============================================================================

/// Create a CLI command with a temporary data directory
fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("lingodrive").expect("Failed to find lingodrive binary");
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

/// Same, with peer-to-peer disabled
fn offline_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = cli_cmd(data_dir);
    cmd.arg("--no-p2p");
    cmd
}

fn write_fallback(data_dir: &TempDir, name: &str, contents: &str) {
    let fallback = data_dir.path().join("fallback");
    std::fs::create_dir_all(&fallback).unwrap();
    std::fs::write(fallback.join(name), contents).unwrap();
}

fn write_dictionary(data_dir: &TempDir) {
    write_fallback(
        data_dir,
        "translations.json",
        r#"{"en": {"hello": "hello", "world": "world"}, "es": {"hello": "hola", "world": "mundo"}}"#,
    );
}

// ============================================================================
// Help and Info
// ============================================================================

#[test]
fn test_help_lists_commands() {
    Command::cargo_bin("lingodrive")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("connect"))
        .stdout(predicate::str::contains("translate"))
        .stdout(predicate::str::contains("serve"));
}

#[test]
fn test_info_command() {
    let data_dir = TempDir::new().unwrap();

    offline_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("lingodrive v0.1.0"))
        .stdout(predicate::str::contains("Data directory:"))
        .stdout(predicate::str::contains("Enabled: false"))
        .stdout(predicate::str::contains("Modules: unavailable"));
}

#[test]
fn test_info_before_first_connect() {
    let data_dir = TempDir::new().unwrap();

    offline_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("(created on first connect)"));
}

// ============================================================================
// Key Validation
// ============================================================================

#[test]
fn test_connect_malformed_key_fails() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["connect", "--once", "not-a-key"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("InvalidKey: malformed"));

    assert!(!data_dir.path().join("data").exists());
}

#[test]
fn test_connect_empty_key_fails() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["connect", "--once", "   "])
        .assert()
        .failure()
        .stderr(predicate::str::contains("InvalidKey: empty"));
}

#[cfg(unix)]
#[test]
fn test_ctrl_c_during_connect_exits_cleanly() {
    use std::process::Stdio;
    use std::time::{Duration, Instant};

    let data_dir = TempDir::new().unwrap();
    let mut config = lingodrive_core::Config::with_base(data_dir.path());
    config.p2p.join_timeout_secs = 1;
    config.p2p.discovery_window_secs = 1;
    config.p2p.ready_timeout_secs = 600;
    let config_path = data_dir.path().join("config.json");
    config.save(&config_path).unwrap();

    let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin("lingodrive"))
        .arg("--config")
        .arg(&config_path)
        .args(["connect", KEY])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    // Past discovery and waiting for a drive nobody hosts.
    std::thread::sleep(Duration::from_secs(4));
    let sent = std::process::Command::new("kill")
        .args(["-INT", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(sent.success());

    let deadline = Instant::now() + Duration::from_secs(20);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if Instant::now() > deadline {
            child.kill().unwrap();
            panic!("connect kept running after Ctrl+C");
        }
        std::thread::sleep(Duration::from_millis(100));
    };

    let output = child.wait_with_output().unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!status.success());
    assert!(stderr.contains("Interrupted while connecting"), "{stderr}");
}

// ============================================================================
// Local Fallback
// ============================================================================

#[test]
fn test_connect_offline_selects_fallback() {
    let data_dir = TempDir::new().unwrap();

    offline_cmd(&data_dir)
        .args(["connect", "--once", KEY])
        .assert()
        .success()
        .stdout(predicate::str::contains("probing modules"))
        .stdout(predicate::str::contains("Peer-to-peer unavailable"));
}

#[test]
fn test_translate_offline() {
    let data_dir = TempDir::new().unwrap();
    write_dictionary(&data_dir);

    offline_cmd(&data_dir)
        .args(["translate", KEY, "--from", "en", "--to", "es", "Hello", "World"])
        .assert()
        .success()
        .stdout(predicate::str::diff("hola mundo\n"));
}

#[test]
fn test_translate_reverse_and_unknown_words() {
    let data_dir = TempDir::new().unwrap();
    write_dictionary(&data_dir);

    offline_cmd(&data_dir)
        .args(["translate", KEY, "--from", "es", "--to", "en", "hola amigo"])
        .assert()
        .success()
        .stdout(predicate::str::diff("hello amigo\n"));
}

#[test]
fn test_translate_without_dictionary_echoes() {
    let data_dir = TempDir::new().unwrap();

    offline_cmd(&data_dir)
        .args(["translate", KEY, "Hello"])
        .assert()
        .success()
        .stdout(predicate::str::diff("Hello\n"));
}

#[test]
fn test_read_offline() {
    let data_dir = TempDir::new().unwrap();
    write_fallback(&data_dir, "notes.txt", "plain text");

    offline_cmd(&data_dir)
        .args(["read", KEY, "notes.txt"])
        .assert()
        .success()
        .stdout(predicate::str::diff("plain text"));

    offline_cmd(&data_dir)
        .args(["read", KEY, "missing.txt"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing.txt"));
}

// ============================================================================
// Config
// ============================================================================

#[test]
fn test_config_show_applies_overrides() {
    let data_dir = TempDir::new().unwrap();

    offline_cmd(&data_dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"enabled\": false"))
        .stdout(predicate::str::contains("fallback"));
}

#[test]
fn test_config_init_and_load() {
    let data_dir = TempDir::new().unwrap();
    let path = data_dir.path().join("config.json");

    cli_cmd(&data_dir)
        .arg("--config")
        .arg(&path)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote"));
    assert!(path.exists());

    cli_cmd(&data_dir)
        .arg("--config")
        .arg(&path)
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    // A config file that disables peer-to-peer drives the fallback path.
    std::fs::write(&path, r#"{ "p2p": { "enabled": false } }"#).unwrap();
    write_dictionary(&data_dir);
    cli_cmd(&data_dir)
        .arg("--config")
        .arg(&path)
        .args(["translate", KEY, "hello"])
        .assert()
        .success()
        .stdout(predicate::str::diff("hola\n"));
}

#[test]
fn test_invalid_config_file_fails() {
    let data_dir = TempDir::new().unwrap();
    let path = data_dir.path().join("config.json");
    std::fs::write(&path, r#"{ "p2p": { "ready_timeout_secs": 0 } }"#).unwrap();

    cli_cmd(&data_dir)
        .arg("--config")
        .arg(&path)
        .arg("info")
        .assert()
        .failure()
        .stderr(predicate::str::contains("ready_timeout_secs"));
}
