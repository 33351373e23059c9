//! Core library for the Longhorn volume manager.
//!
//! The crate provisions Longhorn volumes from a declarative document: each
//! volume is created or restored from its latest backup, awaited until the
//! storage backend reports it ready, and optionally exposed to the cluster
//! through a PersistentVolume and PersistentVolumeClaim. Waits are built on a
//! generic bounded poller and a typed status matcher.

pub mod backend;
pub mod cluster;
pub mod command;
pub mod config;
pub mod lifecycle;
pub mod longhorn;
pub mod orchestrator;
pub mod poll;
pub mod status;
pub mod test_support;

pub use backend::{
    Backup, BackupVolume, BackendError, CreateVolumeRequest, VolumeBackend, VolumeRecord,
    VolumeState,
};
pub use cluster::{ClaimReference, ClusterAdmin, ClusterError, Kubectl};
pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ConfigError, VolumeEntry, VolumeSize, VolumeSpec, VolumesConfig};
pub use lifecycle::{LifecycleError, PendingFinalization, VolumeLifecycle};
pub use longhorn::{LonghornBackend, LonghornSettings, LonghornSetupError};
pub use orchestrator::{BatchError, BatchOrchestrator, BatchPolicy, BatchSummary};
pub use poll::{Attempt, PollError, PollPolicy, poll_until};
pub use status::{ExpectedStatus, KubernetesStatus, Presence, PvStatus, PvStatusExpectation};
