// stagecheck/src/cli.rs
//! Command-line interface definition for the stagecheck binary.
//!
//! Credentials are never taken as arguments; they are read from the
//! environment (optionally populated from a `.env` file).
//!
//! License: MIT OR APACHE 2.0

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Top-level CLI definition.
#[derive(Parser, Debug)]
#[command(
    name = "stagecheck",
    author = "Relay",
    version = env!("CARGO_PKG_VERSION"),
    about = "Validate a staging deployment end to end and always restore its flags",
    long_about = "stagecheck toggles feature flags on a staging deployment, verifies health, commands, logs and the alert path with two independent methods each, restores every flag it touched to its safe default, and writes a redacted, evidence-backed report.",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Suppress informational messages.
    #[arg(long, short = 'q', global = true, help = "Suppress informational and debug messages.")]
    pub quiet: bool,

    /// Enable debug logging (overrides RUST_LOG).
    #[arg(long, short = 'd', global = true, help = "Enable debug logging.")]
    pub debug: bool,

    /// Disable colored output even on a terminal. `NO_COLOR` is honoured too.
    #[arg(long = "no-color", global = true, help = "Disable colored output.")]
    pub no_color: bool,

    /// Path to a custom YAML theme file.
    #[arg(long = "theme", value_name = "FILE", global = true, help = "Path to a custom YAML theme file.")]
    pub theme: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs a full validation against the configured staging deployment.
    #[command(about = "Run a validation against the configured staging deployment.")]
    Run(RunCommand),

    /// Redacts secrets from stdin or a file.
    #[command(about = "Redact secrets from text or JSON read from stdin or a file.")]
    Redact(RedactCommand),

    /// Renders a saved report.json.
    #[command(about = "Render a saved report.json as a summary, Markdown or JSON.")]
    Render(RenderCommand),

    /// Checks a report directory against its manifest.
    #[command(about = "Verify a report directory against its manifest and signature.")]
    Verify(VerifyCommand),

    /// Validates a configuration file and prints the effective settings.
    #[command(about = "Validate a config file and print the effective, redacted settings.")]
    Check(CheckCommand),
}

/// How a finished run (or a loaded report) is printed to stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// A table of checks with the run status.
    Summary,
    Markdown,
    Json,
}

#[derive(Parser, Debug)]
pub struct RunCommand {
    /// Validation config (YAML). Falls back to the standard locations.
    #[arg(long, short = 'c', value_name = "FILE", env = "STAGECHECK_CONFIG", help = "Path to the validation config (YAML).")]
    pub config: Option<PathBuf>,

    /// Plan flag writes and alerts without issuing them.
    #[arg(long = "dry-run", help = "Plan flag writes and alerts without issuing them.")]
    pub dry_run: bool,

    /// Record verbose detail in the run.
    #[arg(long, short = 'v', help = "Log every probe and collaborator call.")]
    pub verbose: bool,

    /// Window in which identical alerts are delivered once.
    #[arg(long = "dedup-window", value_name = "SECONDS", help = "Alert deduplication window in seconds.")]
    pub dedup_window: Option<u64>,

    /// Disables the staging-only guard. Dangerous.
    #[arg(long = "allow-production", help = "Disable the staging-only guard (runs even if the target looks like production).")]
    pub allow_production: bool,

    /// Where run directories are written.
    #[arg(long = "report-dir", value_name = "DIR", help = "Directory that receives the run's report and evidence.")]
    pub report_dir: Option<PathBuf>,

    /// Skip writing the report directory.
    #[arg(long = "no-artifacts", help = "Do not write report and evidence files.")]
    pub no_artifacts: bool,

    #[arg(long, short = 'f', value_enum, default_value = "summary", help = "What to print on stdout when the run finishes.")]
    pub format: OutputFormat,
}

#[derive(Parser, Debug)]
pub struct RedactCommand {
    /// Input file (reads stdin if not provided).
    #[arg(long, short = 'i', value_name = "FILE", help = "Read input from a file instead of stdin.")]
    pub input_file: Option<PathBuf>,

    /// Output file (writes stdout if not provided).
    #[arg(long, short = 'o', value_name = "FILE", help = "Write output to a file instead of stdout.")]
    pub output: Option<PathBuf>,

    /// Treat the input as JSON and mask values under secret-shaped keys.
    #[arg(long, help = "Parse the input as JSON and redact it structurally.")]
    pub json: bool,

    /// Additional secret key words (comma-separated).
    #[arg(long = "keyword", short = 'k', value_delimiter = ',', help = "Extra key words that mark a field as secret (comma-separated).")]
    pub keywords: Vec<String>,
}

#[derive(Parser, Debug)]
pub struct RenderCommand {
    /// Path to a report.json written by `stagecheck run`.
    #[arg(value_name = "REPORT")]
    pub report: PathBuf,

    #[arg(long, short = 'f', value_enum, default_value = "markdown", help = "Output format.")]
    pub format: OutputFormat,
}

#[derive(Parser, Debug)]
pub struct VerifyCommand {
    /// A run directory containing manifest.json.
    #[arg(value_name = "DIR")]
    pub dir: PathBuf,

    /// Key the manifest was signed with.
    #[arg(long = "key", env = "STAGECHECK_REPORT_KEY", hide_env_values = true, help = "HMAC key to check the manifest signature with.")]
    pub key: Option<String>,
}

#[derive(Parser, Debug)]
pub struct CheckCommand {
    #[arg(long, short = 'c', value_name = "FILE", env = "STAGECHECK_CONFIG", help = "Path to the validation config (YAML).")]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "stagecheck",
            "run",
            "--config",
            "stagecheck.yaml",
            "--dry-run",
            "--dedup-window",
            "60",
            "--format",
            "json",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(cmd) => {
                assert!(cmd.dry_run);
                assert_eq!(cmd.dedup_window, Some(60));
                assert_eq!(cmd.format, OutputFormat::Json);
                assert!(!cmd.allow_production);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
