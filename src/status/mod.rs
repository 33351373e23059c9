//! Structural matching of a volume's Kubernetes status document.
//!
//! Longhorn tracks the PV/PVC binding of each volume in a nested
//! `kubernetesStatus` document. Provisioning waits until that document
//! reaches a partially specified shape, described here by
//! [`ExpectedStatus`]. Matching is a pure predicate: it never performs I/O
//! and reports a mismatch as `false` rather than as an error.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Observed PV status. Longhorn reports a single phase, but older payloads
/// and backup labels may carry a list of phases.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PvStatus {
    /// A single phase such as `Available` or `Bound`.
    One(String),
    /// A list of phases.
    Many(Vec<String>),
}

impl Default for PvStatus {
    fn default() -> Self {
        Self::One(String::new())
    }
}

impl fmt::Display for PvStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::One(phase) => f.write_str(phase),
            Self::Many(phases) => write!(f, "[{}]", phases.join(",")),
        }
    }
}

/// Typed view of the `kubernetesStatus` sub-document of a volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubernetesStatus {
    /// Name of the bound PersistentVolume, empty when none exists.
    pub pv_name: String,
    /// Phase of the PersistentVolume.
    pub pv_status: PvStatus,
    /// Namespace of the bound claim.
    pub namespace: String,
    /// Name of the bound PersistentVolumeClaim.
    pub pvc_name: String,
    /// Timestamp of the last time a claim stopped referencing the volume.
    #[serde(rename = "lastPVCRefAt")]
    pub last_pvc_ref_at: String,
    /// Timestamp of the last time a pod stopped referencing the volume.
    pub last_pod_ref_at: String,
}

impl fmt::Display for KubernetesStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pvName={:?} pvStatus={} namespace={:?} pvcName={:?} lastPVCRefAt={:?} lastPodRefAt={:?}",
            self.pv_name,
            self.pv_status,
            self.namespace,
            self.pvc_name,
            self.last_pvc_ref_at,
            self.last_pod_ref_at
        )
    }
}

/// Existence check applied to the reference timestamps.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Presence {
    /// The observed value must be the empty string.
    Empty,
    /// The observed value must be non-empty.
    NonEmpty,
}

impl Presence {
    /// Interprets an expected literal: `""` means empty, anything else
    /// means non-empty.
    #[must_use]
    pub const fn from_literal(value: &str) -> Self {
        if value.is_empty() {
            Self::Empty
        } else {
            Self::NonEmpty
        }
    }

    const fn holds_for(self, observed: &str) -> bool {
        match self {
            Self::Empty => observed.is_empty(),
            Self::NonEmpty => !observed.is_empty(),
        }
    }
}

/// Expected PV status.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PvStatusExpectation {
    /// A single expected phase. Against an observed list this is a
    /// membership check, otherwise an equality check.
    Exactly(String),
    /// Any of the listed phases. Against an observed single phase this is a
    /// membership check, otherwise the lists must be equal.
    AnyOf(Vec<String>),
}

impl PvStatusExpectation {
    /// Builds an [`PvStatusExpectation::AnyOf`] from string-like values.
    #[must_use]
    pub fn any_of<I, S>(phases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AnyOf(phases.into_iter().map(Into::into).collect())
    }

    fn holds_for(&self, observed: &PvStatus) -> bool {
        match (observed, self) {
            (PvStatus::Many(phases), Self::Exactly(expected)) => phases.contains(expected),
            (PvStatus::One(phase), Self::Exactly(expected)) => phase == expected,
            (PvStatus::One(phase), Self::AnyOf(expected)) => expected.contains(phase),
            (PvStatus::Many(phases), Self::AnyOf(expected)) => phases == expected,
        }
    }
}

impl fmt::Display for PvStatusExpectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exactly(phase) => f.write_str(phase),
            Self::AnyOf(phases) => write!(f, "one of [{}]", phases.join(",")),
        }
    }
}

/// Partial condition over a [`KubernetesStatus`]. Unset fields are not
/// checked, so the default value matches every document.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExpectedStatus {
    pv_name: Option<String>,
    pv_status: Option<PvStatusExpectation>,
    namespace: Option<String>,
    pvc_name: Option<String>,
    last_pvc_ref_at: Option<Presence>,
    last_pod_ref_at: Option<Presence>,
}

impl ExpectedStatus {
    /// Creates an empty condition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `pvName` to equal `value`.
    #[must_use]
    pub fn pv_name(mut self, value: impl Into<String>) -> Self {
        self.pv_name = Some(value.into());
        self
    }

    /// Requires `pvStatus` to satisfy `value`.
    #[must_use]
    pub fn pv_status(mut self, value: PvStatusExpectation) -> Self {
        self.pv_status = Some(value);
        self
    }

    /// Requires `namespace` to equal `value`.
    #[must_use]
    pub fn namespace(mut self, value: impl Into<String>) -> Self {
        self.namespace = Some(value.into());
        self
    }

    /// Requires `pvcName` to equal `value`.
    #[must_use]
    pub fn pvc_name(mut self, value: impl Into<String>) -> Self {
        self.pvc_name = Some(value.into());
        self
    }

    /// Applies an existence check to `lastPVCRefAt`.
    #[must_use]
    pub const fn last_pvc_ref_at(mut self, value: Presence) -> Self {
        self.last_pvc_ref_at = Some(value);
        self
    }

    /// Applies an existence check to `lastPodRefAt`.
    #[must_use]
    pub const fn last_pod_ref_at(mut self, value: Presence) -> Self {
        self.last_pod_ref_at = Some(value);
        self
    }

    /// Returns `true` when every configured key holds for `observed`.
    #[must_use]
    pub fn is_satisfied_by(&self, observed: &KubernetesStatus) -> bool {
        matches(observed, self)
    }
}

impl fmt::Display for ExpectedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(name) = &self.pv_name {
            parts.push(format!("pvName={name:?}"));
        }
        if let Some(status) = &self.pv_status {
            parts.push(format!("pvStatus={status}"));
        }
        if let Some(namespace) = &self.namespace {
            parts.push(format!("namespace={namespace:?}"));
        }
        if let Some(name) = &self.pvc_name {
            parts.push(format!("pvcName={name:?}"));
        }
        if let Some(presence) = self.last_pvc_ref_at {
            parts.push(format!("lastPVCRefAt={presence:?}"));
        }
        if let Some(presence) = self.last_pod_ref_at {
            parts.push(format!("lastPodRefAt={presence:?}"));
        }
        write!(f, "{{{}}}", parts.join(" "))
    }
}

fn check_equal(key: &str, observed: &str, expected: Option<&String>) -> bool {
    let Some(value) = expected else {
        return true;
    };
    let holds = observed == value;
    if !holds {
        debug!(key, observed, expected = %value, "status key mismatch");
    }
    holds
}

fn check_presence(key: &str, observed: &str, expected: Option<Presence>) -> bool {
    let Some(presence) = expected else {
        return true;
    };
    let holds = presence.holds_for(observed);
    if !holds {
        debug!(key, observed, expected = ?presence, "status key mismatch");
    }
    holds
}

/// Evaluates `expected` against `observed`, short-circuiting on the first
/// failing key.
#[must_use]
pub fn matches(observed: &KubernetesStatus, expected: &ExpectedStatus) -> bool {
    check_equal("pvName", &observed.pv_name, expected.pv_name.as_ref())
        && expected.pv_status.as_ref().is_none_or(|status| {
            let holds = status.holds_for(&observed.pv_status);
            if !holds {
                debug!(
                    key = "pvStatus",
                    observed = %observed.pv_status,
                    expected = %status,
                    "status key mismatch"
                );
            }
            holds
        })
        && check_equal("namespace", &observed.namespace, expected.namespace.as_ref())
        && check_equal("pvcName", &observed.pvc_name, expected.pvc_name.as_ref())
        && check_presence(
            "lastPVCRefAt",
            &observed.last_pvc_ref_at,
            expected.last_pvc_ref_at,
        )
        && check_presence(
            "lastPodRefAt",
            &observed.last_pod_ref_at,
            expected.last_pod_ref_at,
        )
}
