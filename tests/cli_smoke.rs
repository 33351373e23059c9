//! Behavioural smoke tests for the CLI entrypoint.

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;
use tempfile::TempDir;

const VALID_DOCUMENT: &str = "\
apiVersion: longhorn-volume-manager/v1
kind: LonghornVolumeSpec
spec:
  volumes:
    pvc-a:
      size: 10Gi
    pvc-b:
      size: 20Gi
      restore: true
      createPVC: true
      namespace: apps
";

fn write_document(dir: &TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join("volumes.yaml");
    fs::write(&path, contents).unwrap_or_else(|err| panic!("write document: {err}"));
    path
}

#[test]
fn validate_summarises_a_valid_document() {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = write_document(&dir, VALID_DOCUMENT);

    let mut cmd = cargo_bin_cmd!("longhorn-volume-manager");
    cmd.arg("validate")
        .arg("--config")
        .arg(&path)
        .env("LOG_LEVEL", "off");
    cmd.assert()
        .success()
        .stdout(contains("2 volume(s) declared"));
}

#[test]
fn validate_rejects_unsupported_kind() {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = write_document(
        &dir,
        "apiVersion: longhorn-volume-manager/v1\nkind: Volumes\nspec:\n  volumes: {}\n",
    );

    let mut cmd = cargo_bin_cmd!("longhorn-volume-manager");
    cmd.arg("validate")
        .arg("--config")
        .arg(&path)
        .env("LOG_LEVEL", "off");
    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("kind 'Volumes' not supported"));
}

#[test]
fn apply_fails_on_invalid_document_before_contacting_longhorn() {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = write_document(
        &dir,
        "apiVersion: longhorn-volume-manager/v1\nkind: LonghornVolumeSpec\nspec:\n  volumes:\n    pvc-a:\n      claimRef: data\n",
    );

    let mut cmd = cargo_bin_cmd!("longhorn-volume-manager");
    cmd.arg("--config")
        .arg(&path)
        .env("LONGHORN_URL", "http://127.0.0.1:9/v1")
        .env("LOG_LEVEL", "off");
    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("does not define 'namespace'"));
}
