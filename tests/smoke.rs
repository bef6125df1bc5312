//! Smoke tests -- drive the binary against a throwaway database.

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

fn maintd(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("maintd").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("MAINTD_CONFIG")
        .env("RUST_LOG", "warn")
        .arg("--db")
        .arg(dir.path().join("maintd.db"));
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("maintd")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Background maintenance job engine"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("maintd")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(contains("maintd"));
}

#[test]
fn test_fresh_database_lists_default_jobs() {
    let dir = TempDir::new().unwrap();
    maintd(&dir)
        .args(["jobs", "list"])
        .assert()
        .success()
        .stdout(contains("backup_daily"))
        .stdout(contains("cleanup_logs"))
        .stdout(contains("daily_report"));
}

#[test]
fn test_add_and_disable_job() {
    let dir = TempDir::new().unwrap();
    maintd(&dir)
        .args(["jobs", "add", "--id", "weekly_cleanup", "--schedule", "0 4 * * 0"])
        .args(["--kind", "cleanup", "--param", "max_age_hours=72"])
        .assert()
        .success()
        .stdout(contains("Job 'weekly_cleanup' added."));

    maintd(&dir)
        .args(["jobs", "disable", "--id", "weekly_cleanup"])
        .assert()
        .success();

    maintd(&dir)
        .args(["jobs", "list", "--json"])
        .assert()
        .success()
        .stdout(contains(r#""id": "weekly_cleanup""#))
        .stdout(contains(r#""enabled": false"#));
}

#[test]
fn test_add_rejects_bad_schedule() {
    let dir = TempDir::new().unwrap();
    maintd(&dir)
        .args(["jobs", "add", "--id", "broken", "--schedule", "61 * * * *", "--kind", "report"])
        .assert()
        .failure()
        .stderr(contains("invalid schedule"));
}

#[test]
fn test_toggle_unknown_job_fails() {
    let dir = TempDir::new().unwrap();
    maintd(&dir)
        .args(["jobs", "enable", "--id", "no_such_job"])
        .assert()
        .failure()
        .stderr(contains("not found"));
}

#[test]
fn test_trigger_records_a_run() {
    let dir = TempDir::new().unwrap();
    maintd(&dir)
        .args(["jobs", "trigger", "--id", "cleanup_logs"])
        .assert()
        .success()
        .stdout(contains("Task 'cleanup_logs' started successfully"));

    maintd(&dir)
        .args(["runs", "--json"])
        .assert()
        .success()
        .stdout(contains(r#""count": 1"#))
        .stdout(contains(r#""status": "success""#));

    maintd(&dir)
        .args(["stats", "--json"])
        .assert()
        .success()
        .stdout(contains(r#""totalExecutions": 1"#))
        .stdout(contains(r#""successRate": 100.0"#));
}

#[test]
fn test_dry_run_lists_hourly_cleanup() {
    let dir = TempDir::new().unwrap();
    maintd(&dir)
        .args(["dry-run", "--hours", "3"])
        .assert()
        .success()
        .stdout(contains("cleanup_logs (cleanup)"));
}

#[test]
fn test_unreadable_config_is_reported() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("maintd.toml"), "[engine\npool_size = ").unwrap();
    maintd(&dir)
        .args(["jobs", "list"])
        .assert()
        .success()
        .stderr(contains("could not be loaded"))
        .stdout(contains("cleanup_logs"));
}
