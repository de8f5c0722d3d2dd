//! Smoke tests -- verify the binary runs and the subcommands are wired up.

use std::path::Path;

use assert_cmd::Command;

fn logwarden() -> Command {
    let mut cmd = Command::cargo_bin("logwarden").unwrap();
    cmd.env_remove("LOGWARDEN_CONFIG");
    cmd
}

fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("logwarden.toml");
    let db = dir.join("logwarden.db");
    std::fs::write(
        &path,
        format!(
            "[storage]\ndb_path = {:?}\n\n[ingest]\nbatch_size = 25\n",
            db.display().to_string()
        ),
    )
    .unwrap();
    path
}

#[test]
fn test_cli_help() {
    logwarden()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("lease-guarded error spike detection"));
}

#[test]
fn test_cli_version() {
    logwarden()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("logwarden"));
}

#[test]
fn test_detect_subcommand_exists() {
    logwarden().args(["detect", "--help"]).assert().success();
}

#[test]
fn test_incidents_list_subcommand_exists() {
    logwarden()
        .args(["incidents", "list", "--help"])
        .assert()
        .success();
}

#[test]
fn test_config_prints_effective_settings() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    logwarden()
        .arg("--config")
        .arg(&config)
        .arg("config")
        .assert()
        .success()
        .stdout(predicates::str::contains("batch_size = 25"))
        .stdout(predicates::str::contains("z_threshold"));
}

#[test]
fn test_missing_config_file_fails() {
    logwarden()
        .args(["--config", "/nonexistent/logwarden.toml", "config"])
        .assert()
        .failure();
}

#[test]
fn test_incidents_list_on_fresh_database() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    logwarden()
        .arg("--config")
        .arg(&config)
        .args(["incidents", "list"])
        .assert()
        .success()
        .stdout(predicates::str::contains("No incidents found."));
}

#[test]
fn test_detect_on_fresh_database_reports_insufficient_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    logwarden()
        .arg("--config")
        .arg(&config)
        .arg("detect")
        .assert()
        .success()
        .stdout(predicates::str::contains("insufficient_baseline"));
}
