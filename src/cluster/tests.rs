//! Unit tests for the kubectl-backed cluster admin.

use std::path::PathBuf;

use super::*;
use crate::test_support::{ScriptedRunner, pv_manifest};
use rstest::{fixture, rstest};

#[fixture]
fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
}

fn claim() -> ClaimReference {
    ClaimReference {
        name: String::from("data"),
        namespace: String::from("apps"),
    }
}

#[rstest]
fn label_overwrites_existing_value(runner: ScriptedRunner) {
    runner.push_success();
    let kubectl = Kubectl::new(DEFAULT_KUBECTL_BIN, runner.clone());

    kubectl
        .label(PERSISTENT_VOLUME_KIND, "pv-a", "app", "pv-a")
        .unwrap_or_else(|err| panic!("label should succeed: {err}"));

    let invocations = runner.invocations();
    assert_eq!(invocations.len(), 1);
    assert_eq!(
        invocations[0].command_string(),
        "kubectl label pv pv-a app=pv-a --overwrite"
    );
}

#[rstest]
fn label_failure_reports_stderr(runner: ScriptedRunner) {
    runner.push_output(
        Some(1),
        "",
        "Error from server (NotFound): persistentvolumes \"pv-a\" not found\n",
    );
    let kubectl = Kubectl::new(DEFAULT_KUBECTL_BIN, runner);

    let err = kubectl
        .label(PERSISTENT_VOLUME_KIND, "pv-a", "app", "pv-a")
        .expect_err("label should fail");

    assert_eq!(
        err,
        ClusterError::CommandFailure {
            command: String::from("kubectl label pv pv-a app=pv-a --overwrite"),
            status_text: String::from("1"),
            stderr: String::from(
                "Error from server (NotFound): persistentvolumes \"pv-a\" not found"
            ),
        }
    );
}

#[rstest]
fn get_manifest_returns_stdout(runner: ScriptedRunner) {
    runner.push_output(Some(0), pv_manifest("pv-a"), "");
    let kubectl = Kubectl::new("kubectl", runner.clone());

    let manifest = kubectl
        .get_manifest(PERSISTENT_VOLUME_KIND, "pv-a", Some("apps"))
        .unwrap_or_else(|err| panic!("get should succeed: {err}"));

    assert_eq!(manifest, pv_manifest("pv-a"));
    assert_eq!(
        runner.invocations()[0].command_string(),
        "kubectl get pv pv-a -n apps -o yaml"
    );
}

#[rstest]
fn replace_manifest_stages_and_removes_temp_file(runner: ScriptedRunner) {
    runner.push_success();
    let kubectl = Kubectl::new("kubectl", runner.clone());

    kubectl
        .replace_manifest(&pv_manifest("pv-a"))
        .unwrap_or_else(|err| panic!("replace should succeed: {err}"));

    let invocations = runner.invocations();
    let args = &invocations[0].args;
    assert_eq!(args[0], "replace");
    assert_eq!(args[1], "-f");
    let staged = PathBuf::from(&args[2]);
    assert!(staged.extension().is_some_and(|ext| ext == "yaml"));
    assert!(!staged.exists(), "temp manifest should be removed");
}

#[rstest]
fn replace_failure_still_removes_temp_file(runner: ScriptedRunner) {
    runner.push_failure(1);
    let kubectl = Kubectl::new("kubectl", runner.clone());

    let err = kubectl
        .replace_manifest(&pv_manifest("pv-a"))
        .expect_err("replace should fail");

    assert!(matches!(err, ClusterError::CommandFailure { .. }));
    let staged = PathBuf::from(&runner.invocations()[0].args[2]);
    assert!(!staged.exists());
}

/// Deletes the staged manifest before reporting `code`.
struct StagedFileRemover {
    code: i32,
}

impl CommandRunner for StagedFileRemover {
    fn run(&self, _program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        if let Some(path) = args.get(2) {
            std::fs::remove_file(path).unwrap_or_else(|err| panic!("remove staged file: {err}"));
        }
        Ok(CommandOutput {
            code: Some(self.code),
            stdout: String::new(),
            stderr: String::from("replace rejected"),
        })
    }
}

#[test]
fn replace_failure_wins_over_cleanup_failure() {
    let kubectl = Kubectl::new("kubectl", StagedFileRemover { code: 1 });

    let err = kubectl
        .replace_manifest(&pv_manifest("pv-a"))
        .expect_err("replace should fail");

    let ClusterError::CommandFailure { stderr, .. } = err else {
        panic!("expected the replace failure, got {err}");
    };
    assert_eq!(stderr, "replace rejected");
}

#[test]
fn cleanup_failure_is_reported_after_successful_replace() {
    let kubectl = Kubectl::new("kubectl", StagedFileRemover { code: 0 });

    let err = kubectl
        .replace_manifest(&pv_manifest("pv-a"))
        .expect_err("cleanup should fail");

    assert!(matches!(err, ClusterError::Staging { .. }), "unexpected error: {err}");
}

#[rstest]
fn missing_kubectl_surfaces_runner_error(runner: ScriptedRunner) {
    let kubectl = Kubectl::new("kubectl", runner);
    let err = kubectl
        .label(PERSISTENT_VOLUME_KIND, "pv-a", "app", "pv-a")
        .expect_err("no scripted response");
    assert!(matches!(err, ClusterError::Runner(CommandError::Spawn { .. })));
}

#[test]
fn with_claim_ref_injects_reference_and_keeps_fields() {
    let rewritten = with_claim_ref("pv/pv-a", &pv_manifest("pv-a"), &claim())
        .unwrap_or_else(|err| panic!("rewrite should succeed: {err}"));
    let document: Value =
        serde_yaml::from_str(&rewritten).unwrap_or_else(|err| panic!("reparse: {err}"));

    let claim_ref = &document["spec"]["claimRef"];
    assert_eq!(claim_ref["apiVersion"], Value::from("v1"));
    assert_eq!(claim_ref["kind"], Value::from("PersistentVolumeClaim"));
    assert_eq!(claim_ref["name"], Value::from("data"));
    assert_eq!(claim_ref["namespace"], Value::from("apps"));
    assert_eq!(
        document["spec"]["persistentVolumeReclaimPolicy"],
        Value::from("Retain")
    );
    assert_eq!(document["metadata"]["name"], Value::from("pv-a"));
}

#[test]
fn with_claim_ref_replaces_previous_reference() {
    let manifest = "spec:\n  claimRef:\n    name: old\n    namespace: legacy\n    uid: 1234\n";
    let rewritten = with_claim_ref("pv/pv-a", manifest, &claim())
        .unwrap_or_else(|err| panic!("rewrite should succeed: {err}"));
    let document: Value =
        serde_yaml::from_str(&rewritten).unwrap_or_else(|err| panic!("reparse: {err}"));

    assert_eq!(document["spec"]["claimRef"]["name"], Value::from("data"));
    assert!(document["spec"]["claimRef"].get("uid").is_none());
}

#[rstest]
#[case("")]
#[case("kind: PersistentVolume\n")]
#[case("spec: []\n")]
#[case("spec: [unclosed\n")]
fn with_claim_ref_rejects_manifests_without_spec(#[case] manifest: &str) {
    let err = with_claim_ref("pv/pv-a", manifest, &claim()).expect_err("should be rejected");
    assert!(matches!(err, ClusterError::Manifest { .. }));
}
