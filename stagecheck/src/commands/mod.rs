//! Subcommand implementations. Each returns the process exit code.

pub mod check;
pub mod redact;
pub mod render;
pub mod run;
pub mod verify;

use crate::cli::{Cli, Commands};
use crate::ui::theme::ThemeMap;
use anyhow::Result;

/// Output settings shared by every subcommand.
pub struct Presentation {
    pub theme: ThemeMap,
    pub stdout_colors: bool,
    pub stderr_colors: bool,
}

pub async fn dispatch(cli: &Cli, presentation: &Presentation) -> Result<i32> {
    match &cli.command {
        Commands::Run(cmd) => run::run_command(cmd, presentation).await,
        Commands::Redact(cmd) => redact::redact_command(cmd),
        Commands::Render(cmd) => render::render_command(cmd, presentation),
        Commands::Verify(cmd) => verify::verify_command(cmd, presentation),
        Commands::Check(cmd) => check::check_command(cmd, presentation),
    }
}
