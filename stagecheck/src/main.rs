// stagecheck/src/main.rs
//! stagecheck entry point.
//!
//! Loads `.env`, parses arguments, sets up logging and the theme, then hands
//! off to the selected subcommand. The process exit code is the command's
//! result: see `stagecheck_core::exit_code`.

use clap::Parser;
use is_terminal::IsTerminal;
use stagecheck::cli::{Cli, Commands};
use stagecheck::commands::{self, Presentation};
use stagecheck::ui::output_format;
use stagecheck::ui::theme::{build_theme_map, ThemeStyle};
use stagecheck::{exit_code_for, logger};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    // Credentials may live in a local .env; a missing file is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let verbose = matches!(&cli.command, Commands::Run(cmd) if cmd.verbose);
    logger::init_logger(logger::level_for(cli.quiet, cli.debug, verbose));

    let colors_allowed = !cli.no_color && std::env::var_os("NO_COLOR").is_none();
    let stderr_colors = colors_allowed && std::io::stderr().is_terminal();
    let theme = match build_theme_map(cli.theme.as_deref()) {
        Ok(theme) => theme,
        Err(e) => {
            let fallback = ThemeStyle::default_theme_map();
            let _ = output_format::print_warn_message(
                &mut std::io::stderr(),
                &format!("{:#}; using the default theme", e),
                &fallback,
                stderr_colors,
            );
            fallback
        }
    };
    let presentation = Presentation {
        theme,
        stdout_colors: colors_allowed && std::io::stdout().is_terminal(),
        stderr_colors,
    };

    let code = match commands::dispatch(&cli, &presentation).await {
        Ok(code) => code,
        Err(e) => {
            let _ = output_format::print_error_message(
                &mut std::io::stderr(),
                &format!("{:#}", e),
                &presentation.theme,
                presentation.stderr_colors,
            );
            exit_code_for(&e)
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
