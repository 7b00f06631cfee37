//! Exit codes and output of the `elevate` binary.
//!
//! Tests verify:
//! - A dry run on a complete project prints the job and exits 0
//! - Configuration and packaging failures exit non-zero with their error class
//! - A remote context runs the entry point in place and keeps its exit code

#![allow(deprecated)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

const DESCRIPTOR: &str =
    r#"{"subscription_id":"sub-1","resource_group":"ml-rg","workspace_name":"ml-ws"}"#;

fn make_project(root: &Path) {
    std::fs::write(root.join("config.json"), DESCRIPTOR).unwrap();
    std::fs::write(
        root.join("elevation.toml"),
        "compute_target = \"gpu-cluster\"\nexperiment = \"cli\"\n",
    )
    .unwrap();
    std::fs::write(root.join("train.py"), "print('training')\n").unwrap();
}

/// `elevate --project <root>` with every context and override variable cleared.
fn elevate(root: &Path, home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("elevate").unwrap();
    cmd.arg("--project")
        .arg(root)
        .env("HOME", home)
        .env("RUST_LOG", "warn");
    for var in [
        "AZUREML_RUN_ID",
        "AZUREML_EXPERIMENT_NAME",
        "ELEVATION_SUBMITTED_RUN",
        "ELEVATION_COMPUTE_TARGET",
        "ELEVATION_EXPERIMENT",
        "ELEVATION_BASE_IMAGE",
        "ELEVATION_ARTIFACT_DIR",
        "ELEVATION_ACCESS_TOKEN",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

// ── Local: dry run ───────────────────────────────────────────────────

#[test]
fn dry_run_prints_job_and_exits_zero() {
    let project = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    make_project(project.path());

    elevate(project.path(), home.path())
        .args(["run", "--dry-run", "train.py", "--epochs", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("python train.py --epochs 2"))
        .stdout(predicate::str::contains("ELEVATION_SUBMITTED_RUN"))
        .stdout(predicate::str::contains("gpu-cluster"));
}

// ── Local: failures map to a non-zero exit ───────────────────────────

#[test]
fn missing_workspace_descriptor_exits_nonzero() {
    let project = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    make_project(project.path());
    std::fs::remove_file(project.path().join("config.json")).unwrap();

    elevate(project.path(), home.path())
        .args(["run", "--dry-run", "train.py"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("error[CONFIGURATION]"));
}

#[test]
fn missing_entry_point_exits_nonzero() {
    let project = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    make_project(project.path());

    elevate(project.path(), home.path())
        .args(["run", "--dry-run", "evaluate.py"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error[PACKAGING]"));
}

#[test]
fn submission_without_credentials_exits_nonzero() {
    let project = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    make_project(project.path());

    elevate(project.path(), home.path())
        .args(["run", "train.py"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error[CONFIGURATION]"))
        .stderr(predicate::str::contains("elevate login"));
}

// ── Remote: run in place ─────────────────────────────────────────────

#[test]
fn detect_reports_remote_marker() {
    let project = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();

    elevate(project.path(), home.path())
        .env("ELEVATION_SUBMITTED_RUN", "cli_20240101_000000_abcd1234")
        .arg("detect")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"remote\""))
        .stdout(predicate::str::contains("cli_20240101_000000_abcd1234"));
}

#[cfg(unix)]
#[test]
fn remote_run_keeps_entry_point_exit_code() {
    let project = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    // No config.json: the remote branch must not need one
    std::fs::write(project.path().join("fail.sh"), "exit 3\n").unwrap();

    elevate(project.path(), home.path())
        .env("ELEVATION_SUBMITTED_RUN", "cli_20240101_000000_abcd1234")
        .args(["run", "sh", "fail.sh"])
        .assert()
        .code(3);
}
