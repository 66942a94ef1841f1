use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn doltkeeper(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("doltkeeper").unwrap();
    cmd.arg("--root")
        .arg(root)
        .env_remove("DOLTKEEPER_HOST")
        .env_remove("DOLTKEEPER_ROOT")
        // Keep clear of any real server on the default port.
        .env("DOLTKEEPER_PORT", "39917")
        .env("DOLTKEEPER_LOG", "warn");
    cmd
}

#[test]
fn branch_create_rejects_invalid_name() {
    let dir = tempfile::tempdir().unwrap();
    doltkeeper(dir.path())
        .args(["branch", "create", "gastown", "bad;name"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("invalid branch name"));
}

#[test]
fn branch_merge_rejects_flag_like_name() {
    let dir = tempfile::tempdir().unwrap();
    doltkeeper(dir.path())
        .args(["branch", "merge", "gastown", "--", "-d"])
        .assert()
        .code(7);
}

#[test]
fn branch_exists_rejects_invalid_database() {
    let dir = tempfile::tempdir().unwrap();
    doltkeeper(dir.path())
        .args(["branch", "exists", "gas town", "polecat-a-1"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("invalid identifier"));
}

#[test]
fn branch_name_is_lowercased() {
    let dir = tempfile::tempdir().unwrap();
    doltkeeper(dir.path())
        .args(["branch", "name", "Polecat", "Nux"])
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^polecat-nux-\d+\n$").unwrap());
}

#[test]
fn status_reports_unhealthy_signal() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = dir.path().join("daemon");
    fs::create_dir_all(&daemon).unwrap();
    fs::write(
        daemon.join("DOLT_UNHEALTHY"),
        r#"{"reason":"read_only","message":"write probe failed: database is read only","timestamp":"2026-01-01T00:00:00Z"}"#,
    )
    .unwrap();

    doltkeeper(dir.path())
        .args(["status", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""running": false"#))
        .stdout(predicate::str::contains(r#""reason": "read_only""#));

    doltkeeper(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("UNHEALTHY (read_only)"))
        .stdout(predicate::str::contains("not running"));
}

#[test]
fn status_without_signal_is_healthy() {
    let dir = tempfile::tempdir().unwrap();
    doltkeeper(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Signal:   healthy"));
}

#[test]
fn malformed_config_exits_with_config_code() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("doltkeeper.toml"), "[server\nport = ").unwrap();
    doltkeeper(dir.path())
        .arg("status")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid doltkeeper.toml"));
}

#[test]
fn init_writes_config_once() {
    let dir = tempfile::tempdir().unwrap();
    doltkeeper(dir.path()).arg("init").assert().success();

    let written = fs::read_to_string(dir.path().join("doltkeeper.toml")).unwrap();
    assert!(written.contains("# doltkeeper configuration"));
    assert!(written.contains("port = 3307"));
    assert!(dir.path().join("daemon").is_dir());

    doltkeeper(dir.path())
        .arg("init")
        .assert()
        .code(7)
        .stderr(predicate::str::contains("--force"));
    doltkeeper(dir.path()).args(["init", "--force"]).assert().success();
}

#[test]
fn schema_describes_config() {
    let dir = tempfile::tempdir().unwrap();
    doltkeeper(dir.path())
        .arg("schema")
        .assert()
        .success()
        .stdout(predicate::str::contains("max_restarts_in_window"))
        .stdout(predicate::str::contains("cooldown_secs"));
}

fn write_redispatch_fixture(root: &Path) {
    fs::write(
        root.join("doltkeeper.toml"),
        r#"
[redispatch]
max_attempts = 2
cooldown_secs = 300
status_command = ["echo", "[{\"status\": \"open\"}]"]
dispatch_command = ["true"]
escalate_command = ["true"]
"#,
    )
    .unwrap();
    fs::write(
        root.join("routes.jsonl"),
        "{\"prefix\": \"gt-\", \"database\": \"gastown\"}\n",
    )
    .unwrap();
}

#[test]
fn redispatch_then_cooldown() {
    let dir = tempfile::tempdir().unwrap();
    write_redispatch_fixture(dir.path());

    doltkeeper(dir.path())
        .args(["redispatch", "gt-abc", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""action": "redispatched""#))
        .stdout(predicate::str::contains(r#""target": "gastown""#));

    doltkeeper(dir.path())
        .args(["redispatch", "gt-abc", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""action": "cooldown""#));

    let state = fs::read_to_string(dir.path().join("supervisor/redispatch-state.json")).unwrap();
    assert!(state.contains(r#""attempt_count": 1"#));
}

#[test]
fn redispatch_unroutable_item_fails() {
    let dir = tempfile::tempdir().unwrap();
    write_redispatch_fixture(dir.path());
    doltkeeper(dir.path())
        .args(["redispatch", "zz-1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("cannot determine target"));
}

#[test]
fn redispatch_requires_work_id_or_prune() {
    let dir = tempfile::tempdir().unwrap();
    doltkeeper(dir.path())
        .arg("redispatch")
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}
