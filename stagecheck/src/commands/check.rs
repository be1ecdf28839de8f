//! The `check` command: validates a config and prints it, redacted, with
//! the guards that will apply.

use crate::cli::CheckCommand;
use crate::commands::run::load_config;
use crate::commands::Presentation;
use crate::ui::output_format;
use anyhow::{Context, Result};
use regex::Regex;
use stagecheck_core::redact_serializable;

pub fn check_command(cmd: &CheckCommand, presentation: &Presentation) -> Result<i32> {
    let config = load_config(cmd.config.as_deref())?;

    let redacted = redact_serializable(&config);
    let yaml = serde_yaml::to_string(&redacted).context("Failed to render config as YAML")?;
    print!("{}", yaml);

    let production = Regex::new(&config.production_pattern)
        .context("production_pattern is not a valid regex")?;
    if production.is_match(&config.target.base_url) {
        let message = if config.options.staging_only_guard {
            "target looks like production; `run` will abort before any write"
        } else {
            "target looks like production and the staging-only guard is disabled"
        };
        let _ = output_format::print_warn_message(
            &mut std::io::stderr(),
            message,
            &presentation.theme,
            presentation.stderr_colors,
        );
    }
    let _ = output_format::print_info_message(
        &mut std::io::stderr(),
        &format!(
            "config is valid: {} flag(s) under {}",
            config.flags.len(),
            config.flag_prefix
        ),
        &presentation.theme,
        presentation.stderr_colors,
    );
    if config.options.dry_run {
        let _ = output_format::print_warn_message(
            &mut std::io::stderr(),
            "dry_run is enabled; no flag writes or alerts will be issued",
            &presentation.theme,
            presentation.stderr_colors,
        );
    }
    Ok(0)
}
