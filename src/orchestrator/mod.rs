//! Batch orchestration across every declared volume.
//!
//! All volumes are prepared before any is finalized, so the backend can
//! provision them concurrently while this process waits on each in turn.

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backend::VolumeBackend;
use crate::cluster::ClusterAdmin;
use crate::config::{VolumeEntry, VolumesConfig};
use crate::lifecycle::{LifecycleError, PendingFinalization, VolumeLifecycle};

/// What to do when a volume fails.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BatchPolicy {
    /// Abort the batch on the first failure.
    #[default]
    FailFast,
    /// Keep going with the remaining volumes and report every failure at
    /// the end.
    ContinueOnError,
}

/// Outcome of a successful batch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BatchSummary {
    /// Volumes that completed the prepare pass.
    pub prepared: usize,
    /// Volumes that completed the finalize pass.
    pub finalized: usize,
}

/// Errors raised by [`BatchOrchestrator::run`].
#[derive(Debug, Error, Eq, PartialEq)]
pub enum BatchError {
    /// A volume failed under [`BatchPolicy::FailFast`].
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// One or more volumes failed under [`BatchPolicy::ContinueOnError`].
    #[error("{} volume(s) failed: {}", .failures.len(), failed_ids(.failures))]
    Incomplete {
        /// Every failure, in the order it occurred.
        failures: Vec<LifecycleError>,
    },
    /// Volumes were prepared but never finalized.
    #[error("volumes left unfinalized: {}", .ids.join(", "))]
    Unfinalized {
        /// Ids still pending after the finalize pass.
        ids: Vec<String>,
    },
}

fn failed_ids(failures: &[LifecycleError]) -> String {
    failures
        .iter()
        .map(LifecycleError::volume)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Runs the two-pass lifecycle over a volumes document.
#[derive(Clone, Debug)]
pub struct BatchOrchestrator<B, C> {
    lifecycle: VolumeLifecycle<B, C>,
    policy: BatchPolicy,
}

impl<B, C> BatchOrchestrator<B, C>
where
    B: VolumeBackend,
    C: ClusterAdmin,
{
    /// Creates an orchestrator.
    #[must_use]
    pub const fn new(lifecycle: VolumeLifecycle<B, C>, policy: BatchPolicy) -> Self {
        Self { lifecycle, policy }
    }

    /// Prepares every declared volume, then finalizes every declared volume,
    /// both in declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::Lifecycle`] on the first failure when failing
    /// fast, [`BatchError::Incomplete`] after both passes when continuing on
    /// error, and [`BatchError::Unfinalized`] if any prepared volume was not
    /// finalized.
    pub async fn run(&self, config: &VolumesConfig) -> Result<BatchSummary, BatchError> {
        self.report_available_backups().await;

        let mut pending = PendingFinalization::new();
        let mut failures = Vec::new();
        let mut summary = BatchSummary::default();

        for VolumeEntry { id, spec } in config.volumes() {
            match self.lifecycle.prepare(id, spec, &mut pending).await {
                Ok(()) => summary.prepared += 1,
                Err(err) => self.record_failure(err, &mut failures)?,
            }
        }

        for VolumeEntry { id, spec } in config.volumes() {
            if !pending.contains(id) {
                continue;
            }
            match self.lifecycle.finalize(id, spec, &mut pending).await {
                Ok(()) => summary.finalized += 1,
                Err(err) => self.record_failure(err, &mut failures)?,
            }
        }

        if !failures.is_empty() {
            return Err(BatchError::Incomplete { failures });
        }
        if !pending.is_empty() {
            return Err(BatchError::Unfinalized { ids: pending.ids() });
        }

        info!(
            prepared = summary.prepared,
            finalized = summary.finalized,
            "volume setup completed"
        );
        Ok(summary)
    }

    fn record_failure(
        &self,
        err: LifecycleError,
        failures: &mut Vec<LifecycleError>,
    ) -> Result<(), BatchError> {
        error!(volume = err.volume(), error = %err, "volume provisioning failed");
        match self.policy {
            BatchPolicy::FailFast => Err(BatchError::Lifecycle(err)),
            BatchPolicy::ContinueOnError => {
                failures.push(err);
                Ok(())
            }
        }
    }

    async fn report_available_backups(&self) {
        let backup_volumes = match self.lifecycle.backend().list_backup_volumes().await {
            Ok(found) => found,
            Err(err) => {
                warn!(error = %err, "failed to list backup volumes");
                return;
            }
        };

        let mut pv_names = Vec::with_capacity(backup_volumes.len());
        for backup_volume in &backup_volumes {
            match backup_volume.recovered_status() {
                Ok(Some(status)) => pv_names.push(status.pv_name),
                Ok(None) => debug!(
                    backup_volume = %backup_volume.name,
                    "backup volume has no kubernetes status"
                ),
                Err(err) => debug!(
                    backup_volume = %backup_volume.name,
                    error = %err,
                    "unreadable kubernetes status"
                ),
            }
        }
        info!(pv_names = ?pv_names, "available backup PV names");
    }
}
