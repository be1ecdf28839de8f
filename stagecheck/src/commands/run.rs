// stagecheck/src/commands/run.rs
//! The `run` command: wires HTTP collaborators from the config and the
//! environment, runs one validation, writes the report and maps the outcome
//! to an exit code.

use crate::cli::{OutputFormat, RunCommand};
use crate::commands::Presentation;
use crate::errors::CliError;
use crate::ui::output_format;
use crate::ui::summary::render_summary;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use stagecheck_core::collaborators::github::GitHubCiStatus;
use stagecheck_core::collaborators::http::{
    ChatWebhookChannel, HttpLogQuery, HttpParameterStore, HttpTargetClient,
};
use stagecheck_core::collaborators::CiStatus;
use stagecheck_core::report::{self, ArtifactSet};
use stagecheck_core::{
    exit_code, Collaborators, ConfigOverrides, Orchestrator, RetryPolicy, StagecheckError,
    ValidationConfig, ValidationRun,
};
use std::path::Path;
use std::sync::Arc;

pub const PARAMETER_STORE_TOKEN_ENV: &str = "STAGECHECK_PARAMETER_STORE_TOKEN";
pub const LOG_QUERY_TOKEN_ENV: &str = "STAGECHECK_LOG_QUERY_TOKEN";
pub const CHAT_TOKEN_ENV: &str = "STAGECHECK_CHAT_TOKEN";
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";
pub const REPORT_KEY_ENV: &str = "STAGECHECK_REPORT_KEY";

/// Credentials read from the environment. Never logged, never serialized.
#[derive(Default)]
pub struct Credentials {
    pub parameter_store: Option<String>,
    pub log_query: Option<String>,
    pub chat: Option<String>,
    pub github: Option<String>,
    pub report_key: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            parameter_store: read(PARAMETER_STORE_TOKEN_ENV),
            log_query: read(LOG_QUERY_TOKEN_ENV),
            chat: read(CHAT_TOKEN_ENV),
            github: read(GITHUB_TOKEN_ENV),
            report_key: read(REPORT_KEY_ENV),
        }
    }
}

/// Loads the config from `path`, or from the first standard location that exists.
pub(crate) fn load_config(path: Option<&Path>) -> Result<ValidationConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => ValidationConfig::discover().ok_or(CliError::NoConfig)?,
    };
    ValidationConfig::load_from_file(&path).map_err(|e| CliError::Config(e).into())
}

fn overrides(cmd: &RunCommand) -> ConfigOverrides {
    ConfigOverrides {
        dry_run: cmd.dry_run.then_some(true),
        verbose: cmd.verbose.then_some(true),
        dedup_window_seconds: cmd.dedup_window,
        staging_only_guard: cmd.allow_production.then_some(false),
        report_dir: cmd.report_dir.clone(),
    }
}

fn require<'a>(value: &'a str, setting: &'static str) -> Result<&'a str> {
    if value.trim().is_empty() {
        return Err(CliError::MissingSetting(setting).into());
    }
    Ok(value)
}

/// Builds the HTTP collaborators. No network traffic happens here.
pub fn build_collaborators(config: &ValidationConfig, credentials: &Credentials) -> Result<Collaborators> {
    let endpoints = &config.endpoints;
    let timeout = config.request_timeout();
    let retry = RetryPolicy::from(&config.retry);

    let parameters = HttpParameterStore::new(
        require(&endpoints.parameter_store_url, "endpoints.parameter_store_url")?,
        credentials.parameter_store.clone(),
        timeout,
        retry.clone(),
    )?;
    let logs = HttpLogQuery::new(
        require(&endpoints.log_query_url, "endpoints.log_query_url")?,
        credentials.log_query.clone(),
        timeout,
        retry,
    )?;
    let channel = ChatWebhookChannel::new(
        require(&endpoints.chat_webhook_url, "endpoints.chat_webhook_url")?,
        credentials.chat.clone(),
        timeout,
    )?;
    let target = HttpTargetClient::new(require(&config.target.base_url, "target.base_url")?, timeout)?;

    let ci: Option<Arc<dyn CiStatus>> = if endpoints.github_repo.trim().is_empty() {
        debug!("No GitHub repository configured; CI status will not be consulted");
        None
    } else {
        Some(Arc::new(GitHubCiStatus::new(
            Some(endpoints.github_api_url.as_str()),
            &endpoints.github_repo,
            credentials.github.clone(),
            timeout,
        )?))
    };

    Ok(Collaborators {
        parameters: Arc::new(parameters),
        logs: Arc::new(logs),
        channel: Arc::new(channel),
        ci,
        target: Arc::new(target),
    })
}

fn print_run(run: &ValidationRun, artifacts: Option<&ArtifactSet>, format: OutputFormat, presentation: &Presentation) -> Result<()> {
    match format {
        OutputFormat::Summary => print!(
            "{}",
            render_summary(run, artifacts, &presentation.theme, presentation.stdout_colors)
        ),
        OutputFormat::Markdown => println!("{}", report::render_markdown(run)),
        OutputFormat::Json => println!("{}", report::to_json(run)?),
    }
    Ok(())
}

pub async fn run_command(cmd: &RunCommand, presentation: &Presentation) -> Result<i32> {
    let mut config = load_config(cmd.config.as_deref())?;
    config.apply_overrides(&overrides(cmd));
    config.validate().map_err(CliError::Config)?;

    let credentials = Credentials::from_env();
    let collaborators = build_collaborators(&config, &credentials)?;
    let orchestrator = Orchestrator::new(config.clone(), collaborators).map_err(|e| match e {
        StagecheckError::Config(_) => anyhow::Error::new(CliError::Config(e.into())),
        other => anyhow::Error::new(other),
    })?;

    let cancel = orchestrator.cancel_signal();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling the run and restoring flags");
            cancel.cancel("interrupted by operator");
        }
    });
    let run = orchestrator.run().await;
    ctrl_c.abort();

    let mut code = run.exit_code();
    let artifacts = if cmd.no_artifacts {
        None
    } else {
        let key = credentials.report_key.as_deref().map(str::as_bytes);
        match report::write_artifacts(&run, &config.report_dir, key)
            .with_context(|| format!("Failed to write report under {}", config.report_dir.display()))
        {
            Ok(set) => {
                info!("Report for {} written to {}", run.correlation_id, set.dir.display());
                Some(set)
            }
            Err(e) => {
                let _ = output_format::print_error_message(
                    &mut std::io::stderr(),
                    &format!("{:#}", e),
                    &presentation.theme,
                    presentation.stderr_colors,
                );
                // A run without its report is not a pass.
                if matches!(code, exit_code::PASSED | exit_code::INCONSISTENT) {
                    code = exit_code::FAILED;
                }
                None
            }
        }
    };

    print_run(&run, artifacts.as_ref(), cmd.format, presentation)?;
    Ok(code)
}
