//! Command-line tests for the flowboard binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn flowboard(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("flowboard");
    cmd.current_dir(dir.path())
        .env_remove("RUST_LOG")
        .env_remove("FLOWBOARD_DATABASE_PATH")
        .env_remove("FLOWBOARD_BUS_PATH")
        .env_remove("FLOWBOARD_LOG_DIR");
    cmd
}

// =============================================================================
// Help and version
// =============================================================================

#[test]
fn test_help_lists_commands() {
    let dir = TempDir::new().unwrap();
    flowboard(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("agent"))
        .stdout(predicate::str::contains("replay"));
}

#[test]
fn test_version() {
    let dir = TempDir::new().unwrap();
    flowboard(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

// =============================================================================
// init
// =============================================================================

#[test]
fn test_init_creates_config_and_databases() {
    let dir = TempDir::new().unwrap();
    flowboard(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("flowboard.toml"));

    assert!(dir.path().join("flowboard.toml").exists());
    assert!(dir.path().join(".flowboard/board.db").exists());
    assert!(dir.path().join(".flowboard/bus.db").exists());
}

#[test]
fn test_init_keeps_existing_config_unless_forced() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("flowboard.toml");
    fs::write(&path, "[agent]\nport = 9999\n").unwrap();

    flowboard(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Keeping existing"));
    assert!(fs::read_to_string(&path).unwrap().contains("9999"));

    flowboard(&dir).args(["init", "--force"]).assert().success();
    assert!(!fs::read_to_string(&path).unwrap().contains("9999"));
}

#[test]
fn test_init_honours_project_dir() {
    let dir = TempDir::new().unwrap();
    let project = dir.path().join("team");
    flowboard(&dir)
        .args(["init", "--project-dir"])
        .arg(&project)
        .assert()
        .success();
    assert!(project.join("flowboard.toml").exists());
    assert!(project.join(".flowboard/board.db").exists());
}

// =============================================================================
// config
// =============================================================================

#[test]
fn test_config_show_prints_sections() {
    let dir = TempDir::new().unwrap();
    flowboard(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[server]"))
        .stdout(predicate::str::contains("[agent]"));
}

#[test]
fn test_config_validate_reports_problems() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("flowboard.toml"),
        "[agent]\nmax_retries = 0\n",
    )
    .unwrap();
    flowboard(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("agent.max_retries"));
}

#[test]
fn test_invalid_log_format_is_rejected() {
    let dir = TempDir::new().unwrap();
    flowboard(&dir)
        .args(["--log-format", "xml", "config", "show"])
        .assert()
        .failure();
}

// =============================================================================
// replay
// =============================================================================

#[test]
fn test_replay_empty_log() {
    let dir = TempDir::new().unwrap();
    flowboard(&dir).arg("init").assert().success();
    flowboard(&dir)
        .arg("replay")
        .assert()
        .success()
        .stdout(predicate::str::contains("Replayed 0 event(s)"));
}
