//! Binary entry point for `longhorn-volume-manager`.

use std::io::{self, Write};
use std::process;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use longhorn_volume_manager::{
    BatchError, BatchOrchestrator, BatchPolicy, ConfigError, Kubectl, LonghornBackend,
    LonghornSettings, LonghornSetupError, PollPolicy, VolumeLifecycle, VolumesConfig,
};

mod cli;

use cli::{Cli, Command};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("backend error: {0}")]
    Backend(#[from] LonghornSetupError),
    #[error("volume setup failed: {0}")]
    Batch(#[from] BatchError),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            error!(error = %err, "exiting after fatal error");
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing(directive: &str) {
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli.command.unwrap_or(Command::Apply) {
        Command::Apply => apply(&cli).await,
        Command::Validate => validate(&cli, io::stdout()),
    }
}

fn load_config(cli: &Cli) -> Result<VolumesConfig, CliError> {
    let path = Utf8PathBuf::from(cli.config.as_str());
    info!(path = %path, "loading volumes document");
    Ok(VolumesConfig::load(&path)?)
}

fn validate(cli: &Cli, mut out: impl Write) -> Result<(), CliError> {
    let config = load_config(cli)?;
    writeln!(
        out,
        "{}: {} volume(s) declared",
        cli.config,
        config.len()
    )?;
    Ok(())
}

async fn apply(cli: &Cli) -> Result<(), CliError> {
    let config = load_config(cli)?;

    if cli.start_delay > 0 {
        info!(seconds = cli.start_delay, "waiting before start");
        tokio::time::sleep(Duration::from_secs(cli.start_delay)).await;
    }

    info!(
        longhorn_url = %cli.longhorn_url,
        disable_ssl_verification = cli.disable_ssl_verification,
        "connecting to Longhorn"
    );
    let backend = LonghornBackend::new(&backend_settings(cli))?;
    let lifecycle = VolumeLifecycle::new(
        backend,
        Kubectl::with_process_runner(cli.kubectl.as_str()),
        poll_policy(cli),
    );
    let orchestrator = BatchOrchestrator::new(lifecycle, batch_policy(cli));
    orchestrator.run(&config).await?;
    Ok(())
}

fn backend_settings(cli: &Cli) -> LonghornSettings {
    LonghornSettings {
        request_timeout: Duration::from_secs(cli.request_timeout),
        accept_invalid_certs: cli.disable_ssl_verification,
        ..LonghornSettings::new(cli.longhorn_url.as_str())
    }
}

const fn poll_policy(cli: &Cli) -> PollPolicy {
    PollPolicy::new(Duration::from_secs(cli.retry_interval), cli.retry_attempts)
}

const fn batch_policy(cli: &Cli) -> BatchPolicy {
    if cli.continue_on_error {
        BatchPolicy::ContinueOnError
    } else {
        BatchPolicy::FailFast
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use longhorn_volume_manager::cluster::DEFAULT_KUBECTL_BIN;
    use longhorn_volume_manager::config::DEFAULT_CONFIG_PATH;
    use longhorn_volume_manager::longhorn::{DEFAULT_LONGHORN_URL, DEFAULT_REQUEST_TIMEOUT};
    use rstest::rstest;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let argv = std::iter::once("longhorn-volume-manager").chain(args.iter().copied());
        Cli::try_parse_from(argv).unwrap_or_else(|err| panic!("parse: {err}"))
    }

    #[test]
    fn defaults_match_in_cluster_deployment() {
        let cli = parse(&[]);

        assert_eq!(cli.command, None);
        assert_eq!(cli.config, DEFAULT_CONFIG_PATH);
        assert_eq!(cli.longhorn_url, DEFAULT_LONGHORN_URL);
        assert_eq!(cli.kubectl, DEFAULT_KUBECTL_BIN);
        assert_eq!(
            Duration::from_secs(cli.request_timeout),
            DEFAULT_REQUEST_TIMEOUT
        );
        assert_eq!(cli.retry_attempts, 180);
        assert_eq!(poll_policy(&cli), PollPolicy::default());
        assert_eq!(batch_policy(&cli), BatchPolicy::FailFast);
    }

    #[test]
    fn settings_flow_into_backend_and_policies() {
        let cli = parse(&[
            "--longhorn-url",
            "https://longhorn.example/v1/",
            "--request-timeout",
            "5",
            "--disable-ssl-verification",
            "--retry-interval",
            "2",
            "--retry-attempts",
            "10",
            "--continue-on-error",
            "apply",
        ]);

        let settings = backend_settings(&cli);
        assert_eq!(settings.url, "https://longhorn.example/v1");
        assert_eq!(settings.request_timeout, Duration::from_secs(5));
        assert!(settings.accept_invalid_certs);
        assert_eq!(
            poll_policy(&cli),
            PollPolicy::new(Duration::from_secs(2), 10)
        );
        assert_eq!(batch_policy(&cli), BatchPolicy::ContinueOnError);
        assert_eq!(cli.command, Some(Command::Apply));
    }

    #[rstest]
    #[case(&["--retry-attempts", "0"])]
    #[case(&["--retry-attempts=-1"])]
    #[case(&["--request-timeout", "0"])]
    fn rejects_non_positive_limits(#[case] args: &[&str]) {
        let argv = std::iter::once("longhorn-volume-manager").chain(args.iter().copied());
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn validate_reports_missing_document() {
        let cli = parse(&["--config", "/definitely/missing/volumes.yaml", "validate"]);
        let mut buf = Vec::new();

        let err = validate(&cli, &mut buf).expect_err("missing file should fail");

        assert!(matches!(err, CliError::Config(ConfigError::Io { .. })));
        assert!(buf.is_empty());
    }

    #[test]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        let err = CliError::Batch(BatchError::Unfinalized {
            ids: vec![String::from("pvc-a")],
        });
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).unwrap_or_else(|err| panic!("utf8: {err}"));
        assert!(
            rendered.contains("volumes left unfinalized: pvc-a"),
            "rendered: {rendered}"
        );
    }
}
