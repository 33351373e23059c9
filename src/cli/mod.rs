//! Command-line interface definitions for the `longhorn-volume-manager`
//! binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page. Every
//! setting falls back to an environment variable so the tool runs unchanged
//! as a container entrypoint.

use clap::builder::FalseyValueParser;
use clap::{Parser, Subcommand};

/// Top-level CLI for the `longhorn-volume-manager` binary.
#[derive(Debug, Parser)]
#[command(
    name = "longhorn-volume-manager",
    version,
    about = "Provision Longhorn volumes and their PersistentVolumes from a declarative document"
)]
pub(crate) struct Cli {
    /// Base URL of the Longhorn v1 API.
    #[arg(
        long,
        env = "LONGHORN_URL",
        value_name = "URL",
        default_value = "http://longhorn-frontend.longhorn-system/v1",
        global = true
    )]
    pub(crate) longhorn_url: String,
    /// Path to the volumes document.
    #[arg(
        long,
        env = "VOLUMES_CONFIG_PATH",
        value_name = "PATH",
        default_value = "/config/volumes.yaml",
        global = true
    )]
    pub(crate) config: String,
    /// Seconds to wait before contacting Longhorn.
    #[arg(
        long,
        env = "START_DELAY_IN_SECONDS",
        value_name = "SECONDS",
        default_value_t = 0,
        global = true
    )]
    pub(crate) start_delay: u64,
    /// Skip TLS certificate verification for Longhorn requests.
    #[arg(
        long,
        env = "DISABLE_SSL_VERIFICATION",
        value_parser = FalseyValueParser::new(),
        global = true
    )]
    pub(crate) disable_ssl_verification: bool,
    /// Log filter directive, for example `info` or `longhorn_volume_manager=debug`.
    #[arg(
        long,
        env = "LOG_LEVEL",
        value_name = "FILTER",
        default_value = "info",
        global = true
    )]
    pub(crate) log_level: String,
    /// Cluster CLI used to label and re-bind PersistentVolumes.
    #[arg(
        long,
        env = "KUBECTL_BIN",
        value_name = "PATH",
        default_value = "kubectl",
        global = true
    )]
    pub(crate) kubectl: String,
    /// Seconds between status polls.
    #[arg(
        long,
        env = "RETRY_INTERVAL_SECONDS",
        value_name = "SECONDS",
        default_value_t = 1,
        global = true
    )]
    pub(crate) retry_interval: u64,
    /// Polls made before a wait times out.
    #[arg(
        long,
        env = "RETRY_COUNT",
        value_name = "COUNT",
        default_value_t = 180,
        value_parser = clap::value_parser!(u32).range(1..),
        global = true
    )]
    pub(crate) retry_attempts: u32,
    /// Per-request HTTP timeout in seconds.
    #[arg(
        long,
        env = "REQUEST_TIMEOUT_SECONDS",
        value_name = "SECONDS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..),
        global = true
    )]
    pub(crate) request_timeout: u64,
    /// Keep provisioning the remaining volumes after one fails.
    #[arg(
        long,
        env = "CONTINUE_ON_ERROR",
        value_parser = FalseyValueParser::new(),
        global = true
    )]
    pub(crate) continue_on_error: bool,
    /// Action to perform; defaults to `apply`.
    #[command(subcommand)]
    pub(crate) command: Option<Command>,
}

/// Subcommands of the `longhorn-volume-manager` binary.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Subcommand)]
pub(crate) enum Command {
    /// Create, restore, and wire up every declared volume.
    #[command(name = "apply")]
    Apply,
    /// Check the volumes document without contacting any service.
    #[command(name = "validate")]
    Validate,
}
