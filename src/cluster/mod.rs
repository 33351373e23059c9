//! Cluster administration through `kubectl`.
//!
//! After the storage backend creates a PersistentVolume, the PV is labelled
//! and optionally pre-bound to a claim. Those mutations go through
//! [`ClusterAdmin`]; [`Kubectl`] implements it by shelling out, mirroring
//! how the tool is deployed next to a cluster CLI.

use std::ffi::OsString;
use std::io::Write as _;

use serde_yaml::{Mapping, Value};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

use crate::command::{
    CommandError, CommandOutput, CommandRunner, ProcessCommandRunner, render_command,
};

/// Default cluster CLI binary name.
pub const DEFAULT_KUBECTL_BIN: &str = "kubectl";

/// Kind used when addressing PersistentVolumes.
pub const PERSISTENT_VOLUME_KIND: &str = "pv";

/// Claim that a PersistentVolume should be reserved for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClaimReference {
    /// Claim name.
    pub name: String,
    /// Claim namespace.
    pub namespace: String,
}

/// Errors raised while mutating cluster objects.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ClusterError {
    /// Raised when the CLI exits unsuccessfully.
    #[error("{command} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Rendered command line.
        command: String,
        /// Human readable exit status.
        status_text: String,
        /// Stderr captured from the CLI.
        stderr: String,
    },
    /// Raised when a manifest cannot be parsed or lacks expected fields.
    #[error("invalid manifest for {object}: {message}")]
    Manifest {
        /// Object the manifest describes.
        object: String,
        /// Description of the problem.
        message: String,
    },
    /// Raised when the temporary manifest file cannot be written.
    #[error("failed to stage manifest: {message}")]
    Staging {
        /// I/O error message.
        message: String,
    },
    /// Raised when command execution fails.
    #[error(transparent)]
    Runner(#[from] CommandError),
}

/// Structured cluster operations used after PV creation.
///
/// Calls block the calling thread; volumes are processed one at a time.
pub trait ClusterAdmin {
    /// Sets `key=value` on the object identified by `kind` and `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when the label cannot be applied.
    fn label(&self, kind: &str, name: &str, key: &str, value: &str) -> Result<(), ClusterError>;

    /// Fetches the current manifest of an object as YAML.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when the object cannot be fetched.
    fn get_manifest(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<String, ClusterError>;

    /// Replaces an object with the given YAML manifest.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when the replacement is rejected.
    fn replace_manifest(&self, manifest: &str) -> Result<(), ClusterError>;
}

/// [`ClusterAdmin`] backed by the `kubectl` CLI.
#[derive(Clone, Debug)]
pub struct Kubectl<R: CommandRunner> {
    program: String,
    runner: R,
}

impl Kubectl<ProcessCommandRunner> {
    /// Creates an admin wired to the real process runner.
    #[must_use]
    pub fn with_process_runner(program: impl Into<String>) -> Self {
        Self::new(program, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> Kubectl<R> {
    /// Creates an admin that invokes `program` through `runner`.
    #[must_use]
    pub fn new(program: impl Into<String>, runner: R) -> Self {
        Self {
            program: program.into(),
            runner,
        }
    }

    fn run(&self, args: &[OsString]) -> Result<CommandOutput, ClusterError> {
        debug!(command = %render_command(&self.program, args), "running cluster command");
        let output = self.runner.run(&self.program, args)?;
        if output.is_success() {
            return Ok(output);
        }
        Err(ClusterError::CommandFailure {
            command: render_command(&self.program, args),
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        })
    }
}

impl<R: CommandRunner> ClusterAdmin for Kubectl<R> {
    fn label(&self, kind: &str, name: &str, key: &str, value: &str) -> Result<(), ClusterError> {
        let args = [
            OsString::from("label"),
            OsString::from(kind),
            OsString::from(name),
            OsString::from(format!("{key}={value}")),
            OsString::from("--overwrite"),
        ];
        self.run(&args).map(|_| ())
    }

    fn get_manifest(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<String, ClusterError> {
        let mut args = vec![OsString::from("get"), OsString::from(kind), OsString::from(name)];
        if let Some(ns) = namespace {
            args.push(OsString::from("-n"));
            args.push(OsString::from(ns));
        }
        args.push(OsString::from("-o"));
        args.push(OsString::from("yaml"));
        self.run(&args).map(|output| output.stdout)
    }

    fn replace_manifest(&self, manifest: &str) -> Result<(), ClusterError> {
        let staging_error = |err: std::io::Error| ClusterError::Staging {
            message: err.to_string(),
        };
        let mut file = tempfile::Builder::new()
            .prefix("pv-override-")
            .suffix(".yaml")
            .tempfile()
            .map_err(staging_error)?;
        file.write_all(manifest.as_bytes()).map_err(staging_error)?;
        file.flush().map_err(staging_error)?;

        let result = self.replace_from(&file);
        let closed = file.close().map_err(staging_error);
        result.and(closed)
    }
}

impl<R: CommandRunner> Kubectl<R> {
    fn replace_from(&self, file: &NamedTempFile) -> Result<(), ClusterError> {
        let args = [
            OsString::from("replace"),
            OsString::from("-f"),
            file.path().as_os_str().to_owned(),
        ];
        self.run(&args).map(|_| ())
    }
}

/// Returns `manifest` with `spec.claimRef` set to `claim`.
///
/// Any existing claim reference is overwritten; every other field is kept.
///
/// # Errors
///
/// Returns [`ClusterError::Manifest`] when the manifest is not a YAML
/// mapping with a `spec` mapping.
pub fn with_claim_ref(
    object: &str,
    manifest: &str,
    claim: &ClaimReference,
) -> Result<String, ClusterError> {
    let invalid = |message: String| ClusterError::Manifest {
        object: object.to_owned(),
        message,
    };

    let mut document: Value =
        serde_yaml::from_str(manifest).map_err(|err| invalid(err.to_string()))?;
    let spec = document
        .get_mut("spec")
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| invalid(String::from("missing spec mapping")))?;

    let mut claim_ref = Mapping::new();
    claim_ref.insert(Value::from("apiVersion"), Value::from("v1"));
    claim_ref.insert(Value::from("kind"), Value::from("PersistentVolumeClaim"));
    claim_ref.insert(Value::from("name"), Value::from(claim.name.as_str()));
    claim_ref.insert(
        Value::from("namespace"),
        Value::from(claim.namespace.as_str()),
    );
    spec.insert(Value::from("claimRef"), Value::Mapping(claim_ref));

    serde_yaml::to_string(&document).map_err(|err| invalid(err.to_string()))
}

#[cfg(test)]
mod tests;
