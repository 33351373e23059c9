//! Test support utilities shared across unit and integration tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsString;
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{
    Backup, BackupVolume, BackendError, BackendFuture, CreateVolumeRequest, VolumeBackend,
    VolumeRecord, VolumeState,
};
use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::status::PvStatus;

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<CommandOutput>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Minimal PersistentVolume manifest as returned by `kubectl get pv -o yaml`.
#[must_use]
pub fn pv_manifest(name: &str) -> String {
    format!(
        "apiVersion: v1\nkind: PersistentVolume\nmetadata:\n  name: {name}\nspec:\n  capacity:\n    storage: 10Gi\n  csi:\n    driver: driver.longhorn.io\n    volumeHandle: {name}\n  persistentVolumeReclaimPolicy: Retain\n"
    )
}

/// A call recorded by [`FakeBackend`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BackendCall {
    /// `list_backup_volumes`.
    ListBackupVolumes,
    /// `last_backup` for the named volume.
    LastBackup(String),
    /// `list_volumes`.
    ListVolumes,
    /// `get_volume` for the named volume.
    GetVolume(String),
    /// `create_volume` with the given request.
    CreateVolume(CreateVolumeRequest),
    /// `create_pv` for `(volume, pv_name)`.
    CreatePv(String, String),
    /// `create_pvc` for `(volume, namespace, pvc_name)`.
    CreatePvc(String, String, String),
    /// `add_recurring_job_group` for `(volume, group)`.
    AddRecurringJobGroup(String, String),
}

impl BackendCall {
    /// Returns `true` for calls that issue a command rather than a read.
    #[must_use]
    pub const fn is_command(&self) -> bool {
        matches!(
            self,
            Self::CreateVolume(_)
                | Self::CreatePv(..)
                | Self::CreatePvc(..)
                | Self::AddRecurringJobGroup(..)
        )
    }
}

#[derive(Debug, Default)]
struct FakeState {
    volumes: BTreeMap<String, VecDeque<VolumeRecord>>,
    backups: BTreeMap<String, Backup>,
    backup_volumes: Vec<BackupVolume>,
    created_states: Vec<VolumeState>,
    calls: Vec<BackendCall>,
    failures: BTreeMap<&'static str, BackendError>,
    group_failures: BTreeMap<String, BackendError>,
    pv_reports_claim: bool,
    pvc_stays_unbound: bool,
}

/// In-memory [`VolumeBackend`] that simulates Longhorn's asynchronous state
/// transitions.
///
/// Each volume holds a queue of observations: reads consume the queue until
/// its last entry, which then sticks. Creating a volume queues
/// `creating` followed by `detached` unless other states are configured.
/// PV and PVC creation update the sticky observation the way Longhorn
/// updates `kubernetesStatus`.
#[derive(Clone, Debug, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(|err| panic!("fake backend lock poisoned: {err}"))
    }

    /// Seeds an existing volume observed in `state`.
    pub fn insert_volume(&self, name: &str, state: VolumeState) {
        self.insert_observations(
            name,
            vec![VolumeRecord {
                name: name.to_owned(),
                state,
                ..VolumeRecord::default()
            }],
        );
    }

    /// Seeds a volume whose reads return `observations` in order.
    pub fn insert_observations(&self, name: &str, observations: Vec<VolumeRecord>) {
        self.lock()
            .volumes
            .insert(name.to_owned(), observations.into_iter().collect());
    }

    /// Seeds the latest backup of `volume`.
    pub fn insert_backup(&self, volume: &str, backup: Backup) {
        let mut state = self.lock();
        state.backup_volumes.push(BackupVolume {
            name: volume.to_owned(),
            last_backup_name: backup.name.clone(),
            labels: backup.labels.clone(),
        });
        state.backups.insert(volume.to_owned(), backup);
    }

    /// Overrides the states a newly created volume reports, in order.
    pub fn set_created_states(&self, states: Vec<VolumeState>) {
        self.lock().created_states = states;
    }

    /// Makes the named operation fail with `error`.
    ///
    /// Recognised operations: `list_backup_volumes`, `create_volume`,
    /// `create_pv`, `create_pvc`.
    pub fn fail(&self, operation: &'static str, error: BackendError) {
        self.lock().failures.insert(operation, error);
    }

    /// Makes assigning `group` fail with `error`.
    pub fn fail_group(&self, group: &str, error: BackendError) {
        self.lock().group_failures.insert(group.to_owned(), error);
    }

    /// Makes PVs report a pending claim reference so PV waits never settle.
    pub fn pv_reports_claim(&self) {
        self.lock().pv_reports_claim = true;
    }

    /// Makes created PVCs never bind.
    pub fn pvc_stays_unbound(&self) {
        self.lock().pvc_stays_unbound = true;
    }

    /// Returns every call recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    /// Returns the create-volume requests recorded so far.
    #[must_use]
    pub fn create_requests(&self) -> Vec<CreateVolumeRequest> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::CreateVolume(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    /// Returns how many recorded calls satisfy `predicate`.
    #[must_use]
    pub fn count_calls(&self, predicate: impl Fn(&BackendCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    fn record(&self, call: BackendCall) -> MutexGuard<'_, FakeState> {
        let mut state = self.lock();
        state.calls.push(call);
        state
    }

    fn sticky_mut<'s>(state: &'s mut FakeState, volume: &str) -> Option<&'s mut VolumeRecord> {
        state.volumes.get_mut(volume).and_then(VecDeque::back_mut)
    }

    fn injected(state: &FakeState, operation: &str) -> Result<(), BackendError> {
        state.failures.get(operation).cloned().map_or(Ok(()), Err)
    }

    fn not_found(operation: &str, volume: &str) -> BackendError {
        BackendError::Api {
            operation: operation.to_owned(),
            status: 404,
            message: format!("volume {volume} not found"),
        }
    }
}

impl VolumeBackend for FakeBackend {
    fn list_backup_volumes(&self) -> BackendFuture<'_, Vec<BackupVolume>, BackendError> {
        Box::pin(async move {
            let state = self.record(BackendCall::ListBackupVolumes);
            Self::injected(&state, "list_backup_volumes")?;
            Ok(state.backup_volumes.clone())
        })
    }

    fn last_backup<'a>(
        &'a self,
        volume: &'a str,
    ) -> BackendFuture<'a, Option<Backup>, BackendError> {
        Box::pin(async move {
            let state = self.record(BackendCall::LastBackup(volume.to_owned()));
            Ok(state.backups.get(volume).cloned())
        })
    }

    fn list_volumes(&self) -> BackendFuture<'_, Vec<VolumeRecord>, BackendError> {
        Box::pin(async move {
            let state = self.record(BackendCall::ListVolumes);
            Ok(state
                .volumes
                .values()
                .filter_map(|observations| observations.front().cloned())
                .collect())
        })
    }

    fn get_volume<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<VolumeRecord>, BackendError> {
        Box::pin(async move {
            let mut state = self.record(BackendCall::GetVolume(name.to_owned()));
            let Some(observations) = state.volumes.get_mut(name) else {
                return Ok(None);
            };
            if observations.len() > 1 {
                return Ok(observations.pop_front());
            }
            Ok(observations.front().cloned())
        })
    }

    fn create_volume<'a>(
        &'a self,
        request: &'a CreateVolumeRequest,
    ) -> BackendFuture<'a, VolumeRecord, BackendError> {
        Box::pin(async move {
            let mut state = self.record(BackendCall::CreateVolume(request.clone()));
            Self::injected(&state, "create_volume")?;
            let states = if state.created_states.is_empty() {
                vec![VolumeState::Creating, VolumeState::Detached]
            } else {
                state.created_states.clone()
            };
            let observations: VecDeque<VolumeRecord> = states
                .into_iter()
                .map(|volume_state| VolumeRecord {
                    name: request.name.clone(),
                    state: volume_state,
                    ..VolumeRecord::default()
                })
                .collect();
            let created = observations.front().cloned().unwrap_or_default();
            state.volumes.insert(request.name.clone(), observations);
            Ok(created)
        })
    }

    fn create_pv<'a>(
        &'a self,
        volume: &'a str,
        pv_name: &'a str,
        _fs_type: &'a str,
    ) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            let mut state = self.record(BackendCall::CreatePv(
                volume.to_owned(),
                pv_name.to_owned(),
            ));
            let reports_claim = state.pv_reports_claim;
            let injected = Self::injected(&state, "create_pv");
            let record = Self::sticky_mut(&mut state, volume)
                .ok_or_else(|| Self::not_found("create_pv", volume))?;
            record.kubernetes_status.pv_name = pv_name.to_owned();
            record.kubernetes_status.pv_status = PvStatus::One(String::from("Available"));
            if reports_claim {
                record.kubernetes_status.last_pvc_ref_at = String::from("2024-01-01T00:00:00Z");
            }
            injected
        })
    }

    fn create_pvc<'a>(
        &'a self,
        volume: &'a str,
        namespace: &'a str,
        pvc_name: &'a str,
    ) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            let mut state = self.record(BackendCall::CreatePvc(
                volume.to_owned(),
                namespace.to_owned(),
                pvc_name.to_owned(),
            ));
            let stays_unbound = state.pvc_stays_unbound;
            let injected = Self::injected(&state, "create_pvc");
            let record = Self::sticky_mut(&mut state, volume)
                .ok_or_else(|| Self::not_found("create_pvc", volume))?;
            record.kubernetes_status.namespace = namespace.to_owned();
            record.kubernetes_status.pvc_name = pvc_name.to_owned();
            if !stays_unbound {
                record.kubernetes_status.pv_status = PvStatus::One(String::from("Bound"));
            }
            injected
        })
    }

    fn add_recurring_job_group<'a>(
        &'a self,
        volume: &'a str,
        group: &'a str,
    ) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            let state = self.record(BackendCall::AddRecurringJobGroup(
                volume.to_owned(),
                group.to_owned(),
            ));
            state.group_failures.get(group).cloned().map_or(Ok(()), Err)
        })
    }
}
