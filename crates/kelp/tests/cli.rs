//! Exit status and output of the kelp binary

#![allow(deprecated)] // Command::cargo_bin

use assert_cmd::assert::OutputAssertExt;
use assert_cmd::cargo::CommandCargoExt;
use predicates::prelude::*;
use std::process::Command;

fn chart(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("templates")).unwrap();
    for (path, contents) in files {
        std::fs::write(dir.path().join(path), contents).unwrap();
    }
    dir
}

fn kelp() -> Command {
    let mut command = Command::cargo_bin("kelp").unwrap();
    command
        .env_remove("KELP_ENGINE")
        .env_remove("KELP_KUSTOMIZE")
        .env_remove("KELP_TEMPLATES_DIR")
        .env_remove("KELP_EXTENSIONS");
    command
}

#[test]
fn no_arguments() {
    kelp()
        .assert()
        .failure()
        .stderr(predicate::str::contains("No arguments given"));
}

#[test]
fn missing_chart_directory() {
    let dir = tempfile::tempdir().unwrap();

    kelp()
        .current_dir(dir.path())
        .arg("chart")
        .assert()
        .failure()
        .stderr(predicate::str::contains("package directory chart not found"));
}

#[test]
fn skipped_files_are_not_failures() {
    let dir = chart(&[
        ("templates/a.yaml", "image: {{ .Values.image }}\n"),
        ("templates/NOTES.txt", "Thank you for installing {{ .Chart.Name }}\n"),
    ]);

    kelp()
        .args(["--engine", "none"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout("---\n# Source: templates/a.yaml\nimage: {{ .Values.image }}\n")
        .stderr(predicate::str::contains("skipped: 1"));
}

#[test]
fn failed_document() {
    let dir = chart(&[
        ("templates/a.yaml", "image: {{ .Values.image }}\n"),
        ("templates/b.yaml", "broken: {{ .Values.x\n"),
    ]);

    kelp()
        .args(["--engine", "none", "--report-format", "json"])
        .arg(dir.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("# Source: templates/a.yaml"))
        .stderr(predicate::str::contains("1 of 2 manifests failed, 0 cancelled"))
        .stderr(predicate::str::contains(
            "line 1: unterminated expression starting at column 9",
        ));
}

#[cfg(unix)]
#[test]
fn engine_error() {
    let dir = chart(&[("templates/a.yaml", "image: {{ .Values.image }}\n")]);

    kelp()
        .args(["--engine", "kustomize", "--kustomize", "false"])
        .arg(dir.path())
        .assert()
        .failure()
        .stdout("")
        .stderr(predicate::str::contains("false exited with"))
        .stderr(predicate::str::contains("1 of 1 manifests failed"));
}

#[test]
fn change_directory() {
    let dir = chart(&[("templates/a.yaml", "kind: Pod\n")]);

    kelp()
        .arg("-C")
        .arg(dir.path())
        .args(["--engine", "none", "."])
        .assert()
        .success()
        .stdout(predicate::str::contains("kind: Pod"));
}
