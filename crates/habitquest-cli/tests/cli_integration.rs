//! End-to-end runs of the CLI binary against a throwaway home directory.

use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

fn run_cli(home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_habitquest-cli"))
        .args(args)
        .env("HOME", home)
        .env("HABITQUEST_ENV", "dev")
        .output()
        .expect("failed to run habitquest-cli")
}

fn run_json(home: &Path, args: &[&str]) -> Value {
    let output = run_cli(home, args);
    assert!(
        output.status.success(),
        "{args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout is not JSON")
}

// ============================================================================
// Config
// ============================================================================

/// Test: config set persists and config get reads it back.
#[test]
fn test_config_set_and_get() {
    let home = tempfile::tempdir().unwrap();

    let output = run_cli(home.path(), &["config", "set", "points.conversion_rate", "25"]);
    assert!(output.status.success());

    let output = run_cli(home.path(), &["config", "get", "points.conversion_rate"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "25");
}

/// Test: unknown keys and invalid values exit non-zero.
#[test]
fn test_config_rejects_bad_input() {
    let home = tempfile::tempdir().unwrap();

    assert!(!run_cli(home.path(), &["config", "get", "no.such.key"]).status.success());
    assert!(!run_cli(home.path(), &["config", "set", "points.conversion_rate", "0"])
        .status
        .success());
}

// ============================================================================
// Progression
// ============================================================================

/// Test: register, create a packet, assign and complete a task.
#[test]
fn test_task_flow() {
    let home = tempfile::tempdir().unwrap();
    let h = home.path();

    let profile = run_json(h, &["user", "register", "1", "Ayu"]);
    assert_eq!(profile["level"], 1);

    run_json(
        h,
        &[
            "packet", "create", "1", "--name", "Mornings", "--expected", "5", "--per-day", "1",
            "--habit", "easy:Stretch", "--habit", "normal:Walk",
        ],
    );

    let tasks = run_json(h, &["task", "assign", "1"]);
    let tasks = tasks.as_array().unwrap();
    assert_eq!(tasks.len(), 1);
    let task_id = tasks[0]["id"].as_i64().unwrap().to_string();

    let completion = run_json(h, &["task", "complete", "1", &task_id]);
    assert_eq!(completion["all_done_today"], true);
    assert_eq!(completion["packet"]["completed_task"], 1);

    let again = run_cli(h, &["task", "complete", "1", &task_id]);
    assert!(!again.status.success());
    assert!(String::from_utf8_lossy(&again.stderr).starts_with("error:"));
}

/// Test: rewards reach the leaderboard and conversions need a balance.
#[test]
fn test_points_and_leaderboard() {
    let home = tempfile::tempdir().unwrap();
    let h = home.path();

    run_json(h, &["user", "register", "1", "Ayu"]);
    run_json(h, &["user", "register", "2", "Bima"]);

    let claim = run_json(h, &["points", "claim", "2", "--name", "Chest", "--base", "40"]);
    assert!(claim["awarded"].as_i64().unwrap() >= 40);

    let top = run_json(h, &["leaderboard", "top", "--limit", "2"]);
    assert_eq!(top[0]["user_id"], 2);
    assert_eq!(top[0]["name"], "Bima");

    assert!(!run_cli(h, &["points", "convert", "1", "1"]).status.success());

    let reconciled = run_json(h, &["reconcile"]);
    // Only users with earned points are rescored.
    assert_eq!(reconciled["reconciled"], 1);
}
