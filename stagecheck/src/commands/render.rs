//! The `render` command: prints a saved report.json in another format.

use crate::cli::{OutputFormat, RenderCommand};
use crate::commands::Presentation;
use crate::ui::summary::render_summary;
use anyhow::{Context, Result};
use stagecheck_core::report;
use std::fs;

pub fn render_command(cmd: &RenderCommand, presentation: &Presentation) -> Result<i32> {
    let text = fs::read_to_string(&cmd.report)
        .with_context(|| format!("Failed to read report {}", cmd.report.display()))?;
    let run = report::from_json(&text)
        .with_context(|| format!("{} is not a stagecheck report", cmd.report.display()))?;

    match cmd.format {
        OutputFormat::Markdown => println!("{}", report::render_markdown(&run)),
        OutputFormat::Json => println!("{}", report::to_json(&run)?),
        OutputFormat::Summary => print!(
            "{}",
            render_summary(&run, None, &presentation.theme, presentation.stdout_colors)
        ),
    }
    Ok(0)
}
