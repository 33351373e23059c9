//! Volume backend abstraction for the block-storage platform.
//!
//! The lifecycle controller only needs a narrow slice of the storage API:
//! volume and backup lookups plus a handful of commands. [`VolumeBackend`]
//! captures that slice so the HTTP client can be swapped for a scripted
//! double in tests.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::status::KubernetesStatus;

/// Backup label holding the JSON-encoded Kubernetes status of the volume at
/// backup time.
pub const KUBERNETES_STATUS_LABEL: &str = "KubernetesStatus";

/// Lifecycle state reported for a volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(from = "String", into = "String")]
pub enum VolumeState {
    /// The volume is still being provisioned.
    #[default]
    Creating,
    /// The volume is ready and not attached to a node.
    Detached,
    /// The volume is ready and attached to a node.
    Attached,
    /// Any state this tool does not act on.
    Other(String),
}

impl VolumeState {
    /// Returns the wire representation of the state.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Creating => "creating",
            Self::Detached => "detached",
            Self::Attached => "attached",
            Self::Other(value) => value,
        }
    }

    /// Returns `true` for the states in which the volume can be wired up.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self, Self::Attached | Self::Detached)
    }
}

impl From<String> for VolumeState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "creating" => Self::Creating,
            "detached" => Self::Detached,
            "attached" => Self::Attached,
            _ => Self::Other(value),
        }
    }
}

impl From<VolumeState> for String {
    fn from(value: VolumeState) -> Self {
        value.as_str().to_owned()
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-side view of a volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRecord {
    /// Volume name, unique within the backend.
    pub name: String,
    /// Current lifecycle state.
    #[serde(default)]
    pub state: VolumeState,
    /// PV/PVC binding status tracked by the backend.
    #[serde(default)]
    pub kubernetes_status: KubernetesStatus,
}

/// Backup volume summary, grouping every backup taken of one volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupVolume {
    /// Name of the backed-up volume.
    pub name: String,
    /// Name of the most recent backup, empty when none completed.
    #[serde(default)]
    pub last_backup_name: String,
    /// Labels copied from the latest backup.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub labels: BTreeMap<String, String>,
}

impl BackupVolume {
    /// Decodes the Kubernetes status stored in the backup labels.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Decode`] when the label is not valid JSON.
    pub fn recovered_status(&self) -> Result<Option<KubernetesStatus>, BackendError> {
        decode_status_label(&self.labels, &self.name)
    }
}

/// A single backup that a volume can be restored from.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    /// Backup name.
    pub name: String,
    /// Backup target URL passed as `fromBackup` when restoring.
    pub url: String,
    /// Labels recorded when the backup was taken.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Backup {
    /// Decodes the Kubernetes status stored in the backup labels.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Decode`] when the label is not valid JSON.
    pub fn recovered_status(&self) -> Result<Option<KubernetesStatus>, BackendError> {
        decode_status_label(&self.labels, &self.name)
    }
}

fn decode_status_label(
    labels: &BTreeMap<String, String>,
    owner: &str,
) -> Result<Option<KubernetesStatus>, BackendError> {
    let Some(raw) = labels.get(KUBERNETES_STATUS_LABEL) else {
        return Ok(None);
    };
    serde_json::from_str(raw)
        .map(Some)
        .map_err(|err| BackendError::Decode {
            operation: format!("{KUBERNETES_STATUS_LABEL} label of {owner}"),
            message: err.to_string(),
        })
}

/// Parameters for creating a volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateVolumeRequest {
    /// Volume name.
    pub name: String,
    /// Size as a quantity string (`10Gi`) or byte count.
    pub size: String,
    /// Backup URL to restore from, if any.
    pub from_backup: Option<String>,
}

impl CreateVolumeRequest {
    /// Requests an empty volume.
    #[must_use]
    pub fn empty(name: impl Into<String>, size: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: size.into(),
            from_backup: None,
        }
    }

    /// Requests a volume restored from `backup_url`.
    #[must_use]
    pub fn from_backup(
        name: impl Into<String>,
        size: impl Into<String>,
        backup_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            size: size.into(),
            from_backup: Some(backup_url.into()),
        }
    }
}

/// Errors raised by volume backends.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when the request could not be sent or the response not read.
    #[error("{operation} request failed: {message}")]
    Transport {
        /// Operation being performed.
        operation: String,
        /// Transport error message.
        message: String,
    },
    /// Raised when the backend rejects a command because the object it
    /// would create already exists.
    #[error("{operation} rejected, object already exists: {message}")]
    AlreadyExists {
        /// Operation being performed.
        operation: String,
        /// Message returned by the backend.
        message: String,
    },
    /// Raised for any other non-success response.
    #[error("{operation} failed with status {status}: {message}")]
    Api {
        /// Operation being performed.
        operation: String,
        /// HTTP status code.
        status: u16,
        /// Message returned by the backend.
        message: String,
    },
    /// Raised when a response or embedded document cannot be decoded.
    #[error("failed to decode {operation}: {message}")]
    Decode {
        /// Operation or document being decoded.
        operation: String,
        /// Parser error message.
        message: String,
    },
}

impl BackendError {
    /// Returns `true` when the error reports an object that already exists.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Longhorn sends `null` for an unset label map.
fn null_as_empty<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::deserialize(deserializer)?.unwrap_or_default())
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Operations consumed from the block-storage backend.
pub trait VolumeBackend {
    /// Lists every backup volume known to the backup target.
    fn list_backup_volumes(&self) -> BackendFuture<'_, Vec<BackupVolume>, BackendError>;

    /// Returns the most recent backup of `volume`, if any exists.
    fn last_backup<'a>(
        &'a self,
        volume: &'a str,
    ) -> BackendFuture<'a, Option<Backup>, BackendError>;

    /// Lists every volume.
    fn list_volumes(&self) -> BackendFuture<'_, Vec<VolumeRecord>, BackendError>;

    /// Fetches a single volume, returning `None` when it does not exist.
    fn get_volume<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<VolumeRecord>, BackendError>;

    /// Creates a volume, optionally restoring it from a backup.
    fn create_volume<'a>(
        &'a self,
        request: &'a CreateVolumeRequest,
    ) -> BackendFuture<'a, VolumeRecord, BackendError>;

    /// Asks the backend to create a PersistentVolume for `volume`.
    fn create_pv<'a>(
        &'a self,
        volume: &'a str,
        pv_name: &'a str,
        fs_type: &'a str,
    ) -> BackendFuture<'a, (), BackendError>;

    /// Asks the backend to create a PersistentVolumeClaim for `volume`.
    fn create_pvc<'a>(
        &'a self,
        volume: &'a str,
        namespace: &'a str,
        pvc_name: &'a str,
    ) -> BackendFuture<'a, (), BackendError>;

    /// Attaches a recurring-job group to `volume`.
    fn add_recurring_job_group<'a>(
        &'a self,
        volume: &'a str,
        group: &'a str,
    ) -> BackendFuture<'a, (), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::PvStatus;

    #[test]
    fn volume_state_round_trips_unknown_values() {
        let state = VolumeState::from(String::from("attaching"));
        assert_eq!(state, VolumeState::Other(String::from("attaching")));
        assert_eq!(String::from(state), "attaching");
        assert!(!VolumeState::Creating.is_settled());
        assert!(VolumeState::Detached.is_settled());
        assert!(VolumeState::Attached.is_settled());
    }

    #[test]
    fn volume_record_deserialises_longhorn_shape() {
        let payload = r#"{
            "name": "pvc-a",
            "state": "detached",
            "size": "10737418240",
            "kubernetesStatus": {"pvName": "pvc-a", "pvStatus": "Available"}
        }"#;
        let record: VolumeRecord =
            serde_json::from_str(payload).unwrap_or_else(|err| panic!("parse volume: {err}"));

        assert_eq!(record.state, VolumeState::Detached);
        assert_eq!(
            record.kubernetes_status.pv_status,
            PvStatus::One(String::from("Available"))
        );
    }

    #[test]
    fn backup_recovers_status_label() {
        let backup = Backup {
            name: String::from("backup-1"),
            url: String::from("s3://bucket@region/?backup=backup-1&volume=pvc-b"),
            labels: BTreeMap::from([(
                String::from(KUBERNETES_STATUS_LABEL),
                String::from(r#"{"pvName":"pvc-b","pvcName":"data","namespace":"apps"}"#),
            )]),
        };

        let status = backup
            .recovered_status()
            .unwrap_or_else(|err| panic!("decode label: {err}"))
            .unwrap_or_else(|| panic!("label should be present"));
        assert_eq!(status.pvc_name, "data");
        assert_eq!(status.namespace, "apps");
    }

    #[test]
    fn null_labels_decode_as_empty() {
        let volume: BackupVolume = serde_json::from_str(
            r#"{"name":"pvc-a","lastBackupName":"backup-1","labels":null}"#,
        )
        .unwrap_or_else(|err| panic!("parse backup volume: {err}"));
        assert!(volume.labels.is_empty());
        assert_eq!(volume.last_backup_name, "backup-1");
        assert_eq!(volume.recovered_status(), Ok(None));

        let backup: Backup = serde_json::from_str(
            r#"{"name":"backup-1","url":"s3://b/?backup=backup-1","labels":null}"#,
        )
        .unwrap_or_else(|err| panic!("parse backup: {err}"));
        assert!(backup.labels.is_empty());
    }

    #[test]
    fn missing_status_label_recovers_nothing() {
        let backup = BackupVolume {
            name: String::from("pvc-c"),
            ..BackupVolume::default()
        };
        assert_eq!(backup.recovered_status(), Ok(None));
    }

    #[test]
    fn malformed_status_label_is_a_decode_error() {
        let backup = BackupVolume {
            name: String::from("pvc-d"),
            last_backup_name: String::new(),
            labels: BTreeMap::from([(
                String::from(KUBERNETES_STATUS_LABEL),
                String::from("{not json"),
            )]),
        };
        assert!(matches!(
            backup.recovered_status(),
            Err(BackendError::Decode { .. })
        ));
    }
}
