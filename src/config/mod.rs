//! Declarative volume configuration.
//!
//! The volumes document is a small YAML file:
//!
//! ```yaml
//! apiVersion: longhorn-volume-manager/v1
//! kind: LonghornVolumeSpec
//! spec:
//!   volumes:
//!     pvc-a:
//!       size: 10Gi
//!       groups: [daily]
//! ```
//!
//! Volumes keep their declaration order. Every check that can be made
//! without contacting the backend happens here, so a bad document fails
//! before any volume is touched.

use std::io;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::cluster::ClaimReference;

/// Supported `apiVersion` of the volumes document.
pub const API_VERSION: &str = "longhorn-volume-manager/v1";

/// Supported `kind` of the volumes document.
pub const KIND: &str = "LonghornVolumeSpec";

/// Default location of the volumes document.
pub const DEFAULT_CONFIG_PATH: &str = "/config/volumes.yaml";

/// Errors raised while loading or validating the volumes document.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Raised when the file cannot be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Path that could not be read.
        path: String,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the document is not valid YAML or not a mapping.
    #[error("failed to parse volumes config: {0}")]
    Parse(String),
    /// Raised when a required key is absent.
    #[error("'{0}' is not defined in volumes config")]
    MissingKey(String),
    /// Raised when `apiVersion` does not match [`API_VERSION`].
    #[error("apiVersion '{0}' not supported")]
    UnsupportedApiVersion(String),
    /// Raised when `kind` does not match [`KIND`].
    #[error("kind '{0}' not supported")]
    UnsupportedKind(String),
    /// Raised when `spec.volumes` is not a mapping.
    #[error("'spec.volumes' must be a mapping of volume ids to settings")]
    InvalidVolumes,
    /// Raised when a single volume entry is malformed.
    #[error("invalid settings for volume '{id}': {message}")]
    InvalidVolume {
        /// Volume identifier.
        id: String,
        /// Description of the problem.
        message: String,
    },
    /// Raised when a volume needs a namespace that is not configured.
    #[error("volume '{id}' sets {field} but does not define 'namespace'")]
    MissingNamespace {
        /// Volume identifier.
        id: String,
        /// Setting that requires the namespace.
        field: &'static str,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSize {
    Bytes(u64),
    Quantity(String),
}

/// Requested volume size: a quantity string such as `10Gi` or a byte count.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(from = "RawSize")]
pub struct VolumeSize(String);

impl VolumeSize {
    /// Creates a size from its textual form.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_owned())
    }

    /// Returns the size as sent to the backend.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<RawSize> for VolumeSize {
    fn from(value: RawSize) -> Self {
        match value {
            RawSize::Bytes(bytes) => Self(bytes.to_string()),
            RawSize::Quantity(quantity) => Self::new(quantity),
        }
    }
}

const fn default_create_pv() -> bool {
    true
}

/// Per-volume settings. Immutable once loaded.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Size used when the volume has to be created.
    #[serde(default)]
    pub size: Option<VolumeSize>,
    /// Restore from the latest backup when one exists.
    #[serde(default)]
    pub restore: bool,
    /// Create a PersistentVolume for the volume.
    #[serde(rename = "createPV", default = "default_create_pv")]
    pub create_pv: bool,
    /// Create a PersistentVolumeClaim for the volume.
    #[serde(rename = "createPVC", default)]
    pub create_pvc: bool,
    /// PersistentVolume name; defaults to the volume id.
    #[serde(default)]
    pub pv_name: Option<String>,
    /// PersistentVolumeClaim name; defaults to the volume id.
    #[serde(default)]
    pub pvc_name: Option<String>,
    /// Namespace of the claim.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Claim the PersistentVolume is reserved for.
    #[serde(default)]
    pub claim_ref: Option<String>,
    /// Recurring-job groups assigned to the volume.
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Default for VolumeSpec {
    fn default() -> Self {
        Self {
            size: None,
            restore: false,
            create_pv: default_create_pv(),
            create_pvc: false,
            pv_name: None,
            pvc_name: None,
            namespace: None,
            claim_ref: None,
            groups: Vec::new(),
        }
    }
}

impl VolumeSpec {
    /// PersistentVolume name for the volume `id`.
    #[must_use]
    pub fn pv_name_for<'a>(&'a self, id: &'a str) -> &'a str {
        self.pv_name.as_deref().unwrap_or(id)
    }

    /// PersistentVolumeClaim name for the volume `id`.
    #[must_use]
    pub fn pvc_name_for<'a>(&'a self, id: &'a str) -> &'a str {
        self.pvc_name.as_deref().unwrap_or(id)
    }

    /// Claim the PV should be pre-bound to, when configured.
    #[must_use]
    pub fn claim_reference(&self) -> Option<ClaimReference> {
        let name = self.claim_ref.as_ref()?;
        let namespace = self.namespace.as_ref()?;
        Some(ClaimReference {
            name: name.clone(),
            namespace: namespace.clone(),
        })
    }

    fn validate(&self, id: &str) -> Result<(), ConfigError> {
        if self
            .size
            .as_ref()
            .is_some_and(|size| size.as_str().is_empty())
        {
            return Err(ConfigError::InvalidVolume {
                id: id.to_owned(),
                message: String::from("'size' must not be empty"),
            });
        }
        let has_namespace = self
            .namespace
            .as_deref()
            .is_some_and(|ns| !ns.trim().is_empty());
        if self.create_pvc && !has_namespace {
            return Err(ConfigError::MissingNamespace {
                id: id.to_owned(),
                field: "createPVC",
            });
        }
        if self.claim_ref.is_some() && !has_namespace {
            return Err(ConfigError::MissingNamespace {
                id: id.to_owned(),
                field: "claimRef",
            });
        }
        if self.groups.iter().any(|group| group.trim().is_empty()) {
            return Err(ConfigError::InvalidVolume {
                id: id.to_owned(),
                message: String::from("recurring-job group names must not be empty"),
            });
        }
        Ok(())
    }
}

/// A declared volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeEntry {
    /// Volume identifier, unique within the document.
    pub id: String,
    /// Volume settings.
    pub spec: VolumeSpec,
}

/// Validated volumes document.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VolumesConfig {
    volumes: Vec<VolumeEntry>,
}

impl VolumesConfig {
    /// Builds a document from entries, validating each one.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when an entry is invalid or an id repeats.
    pub fn from_entries(volumes: Vec<VolumeEntry>) -> Result<Self, ConfigError> {
        for (index, entry) in volumes.iter().enumerate() {
            if entry.id.trim().is_empty() {
                return Err(ConfigError::InvalidVolume {
                    id: entry.id.clone(),
                    message: String::from("volume id must not be empty"),
                });
            }
            if volumes
                .iter()
                .take(index)
                .any(|earlier| earlier.id == entry.id)
            {
                return Err(ConfigError::InvalidVolume {
                    id: entry.id.clone(),
                    message: String::from("volume id declared more than once"),
                });
            }
            entry.spec.validate(&entry.id)?;
        }
        Ok(Self { volumes })
    }

    /// Reads and validates the document at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read, and any
    /// validation error from [`VolumesConfig::from_yaml`].
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = read_document(path)?;
        Self::from_yaml(&contents)
    }

    /// Parses and validates a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the document is malformed, declares an
    /// unsupported `apiVersion`/`kind`, or contains an invalid volume.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let document: Value =
            serde_yaml::from_str(contents).map_err(|err| ConfigError::Parse(err.to_string()))?;
        let root = match &document {
            Value::Mapping(root) => root,
            Value::Null => return Err(ConfigError::MissingKey(String::from("apiVersion"))),
            _ => return Err(ConfigError::Parse(String::from("document must be a mapping"))),
        };

        let api_version = required(root, "apiVersion")?;
        let kind = required(root, "kind")?;
        let spec = required(root, "spec")?;

        if api_version.as_str() != Some(API_VERSION) {
            return Err(ConfigError::UnsupportedApiVersion(describe(api_version)));
        }
        if kind.as_str() != Some(KIND) {
            return Err(ConfigError::UnsupportedKind(describe(kind)));
        }

        let volumes = spec
            .as_mapping()
            .and_then(|spec_map| spec_map.get("volumes"))
            .ok_or_else(|| ConfigError::MissingKey(String::from("volumes")))?;
        let entries = match volumes {
            Value::Mapping(declared) => parse_entries(declared)?,
            Value::Null => Vec::new(),
            _ => return Err(ConfigError::InvalidVolumes),
        };

        Self::from_entries(entries)
    }

    /// Declared volumes in declaration order.
    #[must_use]
    pub fn volumes(&self) -> &[VolumeEntry] {
        &self.volumes
    }

    /// Number of declared volumes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    /// Returns `true` when no volume is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }
}

fn required<'a>(root: &'a Mapping, key: &str) -> Result<&'a Value, ConfigError> {
    root.get(key)
        .ok_or_else(|| ConfigError::MissingKey(key.to_owned()))
}

fn describe(value: &Value) -> String {
    value.as_str().map_or_else(
        || {
            serde_yaml::to_string(value)
                .map_or_else(|_| format!("{value:?}"), |text| text.trim().to_owned())
        },
        str::to_owned,
    )
}

fn parse_entries(declared: &Mapping) -> Result<Vec<VolumeEntry>, ConfigError> {
    declared
        .iter()
        .map(|(key, value)| {
            let id = key
                .as_str()
                .ok_or_else(|| ConfigError::InvalidVolume {
                    id: describe(key),
                    message: String::from("volume id must be a string"),
                })?
                .to_owned();
            let spec = if value.is_null() {
                VolumeSpec::default()
            } else {
                serde_yaml::from_value(value.clone()).map_err(|err| {
                    ConfigError::InvalidVolume {
                        id: id.clone(),
                        message: err.to_string(),
                    }
                })?
            };
            Ok(VolumeEntry { id, spec })
        })
        .collect()
}

fn read_document(path: &Utf8Path) -> Result<String, ConfigError> {
    let io_error = |err: io::Error| ConfigError::Io {
        path: path.to_string(),
        message: err.to_string(),
    };
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| ConfigError::Io {
        path: path.to_string(),
        message: String::from("configuration path is missing a file name"),
    })?;

    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(io_error)?;
    dir.read_to_string(file_name).map_err(io_error)
}
