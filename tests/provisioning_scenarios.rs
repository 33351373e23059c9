//! End-to-end provisioning scenarios against in-memory collaborators.

#[path = "common/harness.rs"]
mod harness;

use std::collections::BTreeMap;

use harness::{lifecycle, orchestrator, queue_successes, volumes};
use longhorn_volume_manager::backend::KUBERNETES_STATUS_LABEL;
use longhorn_volume_manager::test_support::{BackendCall, FakeBackend, ScriptedRunner, pv_manifest};
use longhorn_volume_manager::{
    Backup, BatchSummary, CreateVolumeRequest, PendingFinalization, PvStatus,
};

fn commands(runner: &ScriptedRunner) -> Vec<String> {
    runner
        .invocations()
        .iter()
        .map(|invocation| invocation.command_string())
        .collect()
}

#[tokio::test]
async fn new_volume_gets_persistent_volume_without_claim() {
    let backend = FakeBackend::new();
    let runner = ScriptedRunner::new();
    queue_successes(&runner, 2);
    let config =
        volumes("    pvc-a:\n      size: 10Gi\n      createPV: true\n      createPVC: false\n");

    let summary = orchestrator(&backend, &runner)
        .run(&config)
        .await
        .unwrap_or_else(|err| panic!("batch: {err}"));

    assert_eq!(
        summary,
        BatchSummary {
            prepared: 1,
            finalized: 1
        }
    );
    let issued: Vec<BackendCall> = backend
        .calls()
        .into_iter()
        .filter(BackendCall::is_command)
        .collect();
    assert_eq!(
        issued,
        [
            BackendCall::CreateVolume(CreateVolumeRequest::empty("pvc-a", "10Gi")),
            BackendCall::CreatePv(String::from("pvc-a"), String::from("pvc-a")),
        ]
    );

    let calls = backend.calls();
    let pv_created = calls
        .iter()
        .position(|call| matches!(call, BackendCall::CreatePv(..)))
        .unwrap_or_else(|| panic!("PV should be created: {calls:?}"));
    let state_polls = calls
        .get(..pv_created)
        .unwrap_or_default()
        .iter()
        .skip_while(|call| **call != BackendCall::ListVolumes)
        .filter(|call| matches!(call, BackendCall::GetVolume(_)))
        .count();
    assert_eq!(state_polls, 2, "calls: {calls:?}");

    assert_eq!(
        commands(&runner),
        [
            "kubectl label pv pvc-a app=pvc-a --overwrite",
            "kubectl label pv pvc-a app.kubernetes.io/name=pvc-a --overwrite",
        ]
    );
}

#[tokio::test]
async fn restore_uses_backup_url_and_seeds_recovered_status() {
    let backend = FakeBackend::new();
    let runner = ScriptedRunner::new();
    let backup = Backup {
        name: String::from("backup-42"),
        url: String::from("s3://backups@eu-west-1/?backup=backup-42&volume=pvc-b"),
        labels: BTreeMap::from([(
            KUBERNETES_STATUS_LABEL.to_owned(),
            String::from(
                r#"{"pvName":"pvc-b","pvStatus":"Bound","namespace":"apps","pvcName":"data","lastPVCRefAt":"","lastPodRefAt":""}"#,
            ),
        )]),
    };
    backend.insert_backup("pvc-b", backup.clone());
    let config = volumes(
        "    pvc-b:\n      size: 20Gi\n      restore: true\n      namespace: apps\n      claimRef: data\n      createPVC: true\n      pvcName: data\n",
    );
    let entry = config
        .volumes()
        .first()
        .unwrap_or_else(|| panic!("one volume declared"));
    let controller = lifecycle(&backend, &runner);
    let mut pending = PendingFinalization::new();

    controller
        .prepare(&entry.id, &entry.spec, &mut pending)
        .await
        .unwrap_or_else(|err| panic!("prepare: {err}"));

    assert_eq!(
        backend.create_requests(),
        [CreateVolumeRequest::from_backup("pvc-b", "20Gi", backup.url)]
    );
    let recovered = pending
        .recovered("pvc-b")
        .unwrap_or_else(|| panic!("recovered status should be seeded"));
    assert_eq!(recovered.pvc_name, "data");
    assert_eq!(recovered.namespace, "apps");
    assert_eq!(recovered.pv_status, PvStatus::One(String::from("Bound")));

    queue_successes(&runner, 2);
    runner.push_output(Some(0), pv_manifest("pvc-b"), "");
    runner.push_success();
    controller
        .finalize(&entry.id, &entry.spec, &mut pending)
        .await
        .unwrap_or_else(|err| panic!("finalize: {err}"));

    assert!(pending.is_empty());
    assert_eq!(
        backend.count_calls(|call| matches!(
            call,
            BackendCall::CreatePvc(_, namespace, name) if namespace == "apps" && name == "data"
        )),
        1
    );
    let issued = commands(&runner);
    assert_eq!(
        issued.get(2).map(String::as_str),
        Some("kubectl get pv pvc-b -n apps -o yaml")
    );
}

#[tokio::test]
async fn rerunning_a_batch_does_not_recreate_volumes() {
    let backend = FakeBackend::new();
    let runner = ScriptedRunner::new();
    queue_successes(&runner, 4);
    let config = volumes("    pvc-a:\n      size: 10Gi\n      groups: [daily]\n");

    for run in 1..=2 {
        orchestrator(&backend, &runner)
            .run(&config)
            .await
            .unwrap_or_else(|err| panic!("run {run}: {err}"));
    }

    assert_eq!(backend.create_requests().len(), 1);
    assert_eq!(
        backend.count_calls(|call| matches!(call, BackendCall::AddRecurringJobGroup(..))),
        2
    );
    assert_eq!(runner.invocations().len(), 4);
}
