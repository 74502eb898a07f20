//! CLI surface tests: exit codes, output shape, secret redaction.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;
use tempfile::TempDir;

use wincore::settings::keys;
use wincore::store::Store;

fn seeded_db(dir: &TempDir, pairs: &[(&str, &str)]) -> PathBuf {
    let path = dir.path().join("wincore.db");
    let store = Store::open(&path).unwrap();
    for (key, value) in pairs {
        store
            .set_system_config(key, value, *key == keys::JFROG_PASS)
            .unwrap();
    }
    path
}

fn wincore() -> Command {
    let mut cmd = Command::cargo_bin("wincore").unwrap();
    // Keep the environment from leaking overrides into assertions.
    for var in [
        "WINCORE_DB",
        "WINCORE_BASE_DRIVE",
        "WINCORE_JFROG_URL",
        "WINCORE_JFROG_USER",
        "WINCORE_JFROG_PASS",
        "WINCORE_MAX_CONCURRENCY",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn config_lists_keys_and_redacts_the_password() {
    let dir = TempDir::new().unwrap();
    let db = seeded_db(
        &dir,
        &[
            (keys::JFROG_BASE_URL, "https://jfrog.example.com"),
            (keys::JFROG_USER, "svc-user"),
            (keys::JFROG_PASS, "super-secret-password"),
            (keys::BASE_DRIVE, "/data/builds"),
        ],
    );

    wincore()
        .args(["config", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(
            predicate::str::contains("SVCJFROGPAS = ********")
                .and(predicate::str::contains("super-secret-password").not())
                .and(predicate::str::contains("JFrogBaseURL = https://jfrog.example.com"))
                .and(predicate::str::contains("MaxBuildsToKeep = <unset>")),
        );
}

#[test]
fn status_with_an_empty_catalog_succeeds() {
    let dir = TempDir::new().unwrap();
    let db = seeded_db(&dir, &[]);
    wincore()
        .args(["status", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("no active tuples"));
}

#[test]
fn status_json_is_valid_json() {
    let dir = TempDir::new().unwrap();
    let db = seeded_db(&dir, &[]);
    let output = wincore()
        .args(["status", "--json", "--db"])
        .arg(&db)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let parsed: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert!(parsed.is_array());
}

#[test]
fn test_command_reports_db_failure_with_exit_two() {
    let dir = TempDir::new().unwrap();
    // A directory is not a database.
    wincore()
        .args(["test", "--db"])
        .arg(dir.path())
        .assert()
        .code(2);
}

#[test]
fn test_command_reports_unreachable_repository_with_exit_four() {
    let dir = TempDir::new().unwrap();
    let db = seeded_db(
        &dir,
        &[
            // Nothing listens on the discard port; connect is refused fast.
            (keys::JFROG_BASE_URL, "http://127.0.0.1:9"),
            (keys::JFROG_USER, "svc-user"),
            (keys::JFROG_PASS, "pw"),
        ],
    );
    wincore()
        .args(["test", "--db"])
        .arg(&db)
        .assert()
        .code(4)
        .stderr(predicate::str::contains("unreachable"));
}

#[test]
fn test_command_requires_credentials() {
    let dir = TempDir::new().unwrap();
    let db = seeded_db(&dir, &[(keys::JFROG_BASE_URL, "https://jfrog.example.com")]);
    wincore()
        .args(["test", "--db"])
        .arg(&db)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("SVCJFROGUSR"));
}

#[test]
fn poll_without_configuration_is_a_startup_error() {
    let dir = TempDir::new().unwrap();
    let db = seeded_db(&dir, &[]);
    wincore()
        .args(["poll", "--db"])
        .arg(&db)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("configuration error"));
}

#[test]
fn cleanup_on_an_empty_catalog_succeeds() {
    let dir = TempDir::new().unwrap();
    let db = seeded_db(&dir, &[]);
    wincore()
        .args(["cleanup", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("0 tuples"));
}
