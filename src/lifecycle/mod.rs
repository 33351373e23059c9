//! Volume lifecycle controller.
//!
//! Provisioning is split into two passes so the backend can build every
//! volume in parallel while this controller stays sequential:
//!
//! * [`VolumeLifecycle::prepare`] issues the create (or restore) command and
//!   records the volume in [`PendingFinalization`].
//! * [`VolumeLifecycle::finalize`] waits for the volume to settle, assigns
//!   recurring-job groups, creates and labels the PersistentVolume, binds it
//!   to a claim when configured, and creates the claim.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, CreateVolumeRequest, VolumeBackend, VolumeRecord};
use crate::cluster::{ClusterAdmin, ClusterError, PERSISTENT_VOLUME_KIND, with_claim_ref};
use crate::config::VolumeSpec;
use crate::poll::{Attempt, PollError, PollPolicy, poll_until};
use crate::status::{ExpectedStatus, KubernetesStatus, Presence, PvStatusExpectation, matches};

/// Filesystem requested for created PersistentVolumes.
pub const PV_FS_TYPE: &str = "ext4";

/// Label keys set to the PV name on every created PersistentVolume.
pub const PV_LABEL_KEYS: [&str; 2] = ["app", "app.kubernetes.io/name"];

/// Volumes prepared but not yet finalized, keyed by volume id.
///
/// Each entry holds the Kubernetes status recovered from the volume's latest
/// backup, when one was found.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PendingFinalization {
    entries: BTreeMap<String, Option<KubernetesStatus>>,
}

impl PendingFinalization {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `id` as prepared, replacing any earlier entry.
    pub fn record(&mut self, id: impl Into<String>, recovered: Option<KubernetesStatus>) {
        self.entries.insert(id.into(), recovered);
    }

    /// Returns `true` when `id` awaits finalization.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Returns the status recovered for `id`, if the id is pending and a
    /// backup carried one.
    #[must_use]
    pub fn recovered(&self, id: &str) -> Option<&KubernetesStatus> {
        self.entries.get(id).and_then(Option::as_ref)
    }

    /// Marks `id` as fully provisioned.
    pub fn complete(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Number of pending ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pending ids in sorted order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

/// Errors raised while provisioning a single volume.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LifecycleError {
    /// Raised when the volume never appeared on the backend.
    #[error("volume {volume} not found after {attempts} attempts")]
    NotFoundTimeout {
        /// Volume id.
        volume: String,
        /// Number of lookups made.
        attempts: u32,
    },
    /// Raised when the volume exists but never reached the awaited
    /// condition.
    #[error(
        "volume {volume} did not satisfy {condition} after {attempts} attempts; last observed: {last_observed}"
    )]
    ConditionTimeout {
        /// Volume id.
        volume: String,
        /// Description of the awaited condition.
        condition: String,
        /// Number of lookups made.
        attempts: u32,
        /// What the final lookup observed.
        last_observed: String,
    },
    /// Raised when a backend command or lookup fails fatally.
    #[error("volume {volume}: {source}")]
    Backend {
        /// Volume id.
        volume: String,
        /// Underlying backend error.
        #[source]
        source: BackendError,
    },
    /// Raised when labelling or re-binding the PersistentVolume fails.
    #[error("volume {volume}: {source}")]
    Cluster {
        /// Volume id.
        volume: String,
        /// Underlying cluster error.
        #[source]
        source: ClusterError,
    },
    /// Raised when the volume must be created but no size is configured.
    #[error("volume {volume} must be created but has no size configured")]
    MissingSize {
        /// Volume id.
        volume: String,
    },
}

impl LifecycleError {
    /// Returns the id of the volume the error concerns.
    #[must_use]
    pub fn volume(&self) -> &str {
        match self {
            Self::NotFoundTimeout { volume, .. }
            | Self::ConditionTimeout { volume, .. }
            | Self::Backend { volume, .. }
            | Self::Cluster { volume, .. }
            | Self::MissingSize { volume } => volume,
        }
    }

    fn backend(volume: &str, source: BackendError) -> Self {
        Self::Backend {
            volume: volume.to_owned(),
            source,
        }
    }

    fn cluster(volume: &str, source: ClusterError) -> Self {
        Self::Cluster {
            volume: volume.to_owned(),
            source,
        }
    }

    fn from_wait(volume: &str, err: PollError<BackendError>) -> Self {
        match err {
            PollError::Probe(source) => Self::backend(volume, source),
            PollError::Timeout {
                condition,
                attempts,
                last_observed,
            } => Self::ConditionTimeout {
                volume: volume.to_owned(),
                condition,
                attempts,
                last_observed,
            },
        }
    }
}

/// Drives volumes through prepare and finalize against a backend and a
/// cluster admin.
#[derive(Clone, Debug)]
pub struct VolumeLifecycle<B, C> {
    backend: B,
    cluster: C,
    poll: PollPolicy,
}

impl<B, C> VolumeLifecycle<B, C>
where
    B: VolumeBackend,
    C: ClusterAdmin,
{
    /// Creates a controller that waits according to `poll`.
    #[must_use]
    pub const fn new(backend: B, cluster: C, poll: PollPolicy) -> Self {
        Self {
            backend,
            cluster,
            poll,
        }
    }

    /// Returns the volume backend.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns the wait policy.
    #[must_use]
    pub const fn poll_policy(&self) -> PollPolicy {
        self.poll
    }

    /// First pass: makes sure the volume exists on the backend or is being
    /// created, then records it in `pending`.
    ///
    /// An existing volume is left untouched. Otherwise the volume is
    /// restored from its latest backup when `restore` is set and a backup
    /// exists, or created empty.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Backend`] when a lookup or the create
    /// command fails and [`LifecycleError::MissingSize`] when the volume
    /// has to be created without a configured size.
    pub async fn prepare(
        &self,
        id: &str,
        spec: &VolumeSpec,
        pending: &mut PendingFinalization,
    ) -> Result<(), LifecycleError> {
        let backup = self
            .backend
            .last_backup(id)
            .await
            .map_err(|err| LifecycleError::backend(id, err))?;
        let existing = self
            .backend
            .get_volume(id)
            .await
            .map_err(|err| LifecycleError::backend(id, err))?;

        if existing.is_some() {
            info!(volume = id, "volume already exists, skipping creation");
        } else {
            let size = spec
                .size
                .as_ref()
                .ok_or_else(|| LifecycleError::MissingSize {
                    volume: id.to_owned(),
                })?;
            let request = backup.as_ref().filter(|_| spec.restore).map_or_else(
                || {
                    info!(volume = id, size = size.as_str(), "creating empty volume");
                    CreateVolumeRequest::empty(id, size.as_str())
                },
                |found| {
                    info!(volume = id, backup = %found.name, "restoring volume from latest backup");
                    CreateVolumeRequest::from_backup(id, size.as_str(), found.url.as_str())
                },
            );
            self.backend
                .create_volume(&request)
                .await
                .map_err(|err| LifecycleError::backend(id, err))?;
        }

        let recovered = backup
            .map(|found| found.recovered_status())
            .transpose()
            .map_err(|err| LifecycleError::backend(id, err))?
            .flatten();
        if recovered.is_none() {
            debug!(volume = id, "no recovered kubernetes status");
        }
        pending.record(id, recovered);
        Ok(())
    }

    /// Second pass: wires up a prepared volume and removes it from
    /// `pending`. Ids that are not pending are ignored.
    ///
    /// # Errors
    ///
    /// Returns a [`LifecycleError`] when a wait times out, a fatal backend
    /// command fails, or a cluster mutation fails. The id stays pending.
    pub async fn finalize(
        &self,
        id: &str,
        spec: &VolumeSpec,
        pending: &mut PendingFinalization,
    ) -> Result<(), LifecycleError> {
        if !pending.contains(id) {
            debug!(volume = id, "volume not pending, nothing to finalize");
            return Ok(());
        }
        if let Some(recovered) = pending.recovered(id) {
            report_previous_binding(id, spec, recovered);
        }

        self.wait_for_existence(id).await?;
        info!(volume = id, "waiting for volume to become attached or detached");
        let volume = self.wait_for_settled(id).await?;
        info!(volume = id, state = %volume.state, "volume is ready");

        self.assign_groups(id, &spec.groups).await;

        if spec.create_pv {
            self.create_persistent_volume(id, spec).await?;
        }
        if spec.create_pvc {
            self.create_persistent_volume_claim(id, spec).await?;
        }

        pending.complete(id);
        info!(volume = id, "volume finalized");
        Ok(())
    }

    async fn wait_for_existence(&self, id: &str) -> Result<(), LifecycleError> {
        let backend = &self.backend;
        let condition = format!("volume {id} to exist");
        poll_until(self.poll, &condition, || async move {
            let volumes = backend.list_volumes().await?;
            let attempt = if volumes.iter().any(|volume| volume.name == id) {
                Attempt::Ready(())
            } else {
                Attempt::Pending(format!("{} volumes listed, none named {id}", volumes.len()))
            };
            Ok::<_, BackendError>(attempt)
        })
        .await
        .map_err(|err| match err {
            PollError::Timeout { attempts, .. } => LifecycleError::NotFoundTimeout {
                volume: id.to_owned(),
                attempts,
            },
            PollError::Probe(source) => LifecycleError::backend(id, source),
        })
    }

    async fn wait_for_settled(&self, id: &str) -> Result<VolumeRecord, LifecycleError> {
        let backend = &self.backend;
        poll_until(self.poll, "state in [attached,detached]", || async move {
            let attempt = match backend.get_volume(id).await? {
                Some(volume) if volume.state.is_settled() => Attempt::Ready(volume),
                Some(volume) => Attempt::Pending(format!("state={}", volume.state)),
                None => Attempt::Pending(String::from("volume missing")),
            };
            Ok::<_, BackendError>(attempt)
        })
        .await
        .map_err(|err| LifecycleError::from_wait(id, err))
    }

    async fn wait_for_status(
        &self,
        id: &str,
        expected: &ExpectedStatus,
    ) -> Result<(), LifecycleError> {
        let backend = &self.backend;
        let condition = expected.to_string();
        poll_until(self.poll, &condition, || async move {
            let attempt = match backend.get_volume(id).await? {
                Some(volume) if matches(&volume.kubernetes_status, expected) => {
                    Attempt::Ready(())
                }
                Some(volume) => Attempt::Pending(volume.kubernetes_status.to_string()),
                None => Attempt::Pending(String::from("volume missing")),
            };
            Ok::<_, BackendError>(attempt)
        })
        .await
        .map_err(|err| LifecycleError::from_wait(id, err))
    }

    async fn assign_groups(&self, id: &str, groups: &[String]) {
        for group in groups {
            info!(volume = id, group = %group, "assigning recurring job group");
            if let Err(err) = self.backend.add_recurring_job_group(id, group).await {
                warn!(
                    volume = id,
                    group = %group,
                    error = %err,
                    "failed to assign recurring job group"
                );
            }
        }
    }

    async fn create_persistent_volume(
        &self,
        id: &str,
        spec: &VolumeSpec,
    ) -> Result<(), LifecycleError> {
        let pv_name = spec.pv_name_for(id);
        info!(volume = id, pv = pv_name, "creating persistent volume");
        tolerate_existing(id, self.backend.create_pv(id, pv_name, PV_FS_TYPE).await)?;

        info!(volume = id, pv = pv_name, "waiting for persistent volume");
        let expected = ExpectedStatus::new()
            .pv_name(pv_name)
            .pv_status(PvStatusExpectation::any_of(["Available", "Bound"]))
            .last_pvc_ref_at(Presence::Empty)
            .last_pod_ref_at(Presence::Empty);
        self.wait_for_status(id, &expected).await?;

        for key in PV_LABEL_KEYS {
            info!(volume = id, pv = pv_name, "labelling persistent volume with {key}={pv_name}");
            self.cluster
                .label(PERSISTENT_VOLUME_KIND, pv_name, key, pv_name)
                .map_err(|err| LifecycleError::cluster(id, err))?;
        }

        if let Some(claim) = spec.claim_reference() {
            info!(
                volume = id,
                pv = pv_name,
                claim = %claim.name,
                namespace = %claim.namespace,
                "reserving persistent volume for claim"
            );
            let manifest = self
                .cluster
                .get_manifest(PERSISTENT_VOLUME_KIND, pv_name, Some(&claim.namespace))
                .map_err(|err| LifecycleError::cluster(id, err))?;
            let updated = with_claim_ref(pv_name, &manifest, &claim)
                .map_err(|err| LifecycleError::cluster(id, err))?;
            self.cluster
                .replace_manifest(&updated)
                .map_err(|err| LifecycleError::cluster(id, err))?;
        }
        Ok(())
    }

    async fn create_persistent_volume_claim(
        &self,
        id: &str,
        spec: &VolumeSpec,
    ) -> Result<(), LifecycleError> {
        let pvc_name = spec.pvc_name_for(id);
        let namespace = spec.namespace.as_deref().unwrap_or_default();
        info!(volume = id, namespace, pvc = pvc_name, "creating persistent volume claim");
        tolerate_existing(
            id,
            self.backend.create_pvc(id, namespace, pvc_name).await,
        )?;

        info!(volume = id, namespace, pvc = pvc_name, "waiting for persistent volume claim");
        let expected = ExpectedStatus::new()
            .pv_status(PvStatusExpectation::Exactly(String::from("Bound")))
            .last_pvc_ref_at(Presence::Empty);
        self.wait_for_status(id, &expected).await
    }
}

fn tolerate_existing(id: &str, result: Result<(), BackendError>) -> Result<(), LifecycleError> {
    match result {
        Err(err) if err.is_already_exists() => {
            info!(volume = id, reason = %err, "object already exists, continuing");
            Ok(())
        }
        other => other.map_err(|err| LifecycleError::backend(id, err)),
    }
}

/// Logs the claim recorded in the backup and warns when the configured
/// claim differs from it.
fn report_previous_binding(id: &str, spec: &VolumeSpec, recovered: &KubernetesStatus) {
    info!(volume = id, previous = %recovered, "recovered kubernetes status from backup");
    if recovered.pvc_name.is_empty() {
        return;
    }
    let configured = spec
        .claim_ref
        .as_deref()
        .or_else(|| spec.create_pvc.then(|| spec.pvc_name_for(id)));
    if let Some(claim) = configured.filter(|claim| *claim != recovered.pvc_name) {
        warn!(
            volume = id,
            previous_claim = %recovered.pvc_name,
            configured_claim = claim,
            "configured claim differs from the claim recorded in the backup"
        );
    }
}
