//! The `verify` command: re-hashes a run directory against its manifest.

use crate::cli::VerifyCommand;
use crate::commands::Presentation;
use crate::ui::output_format;
use crate::ui::theme::{paint, ThemeEntry};
use anyhow::{Context, Result};
use stagecheck_core::exit_code;
use stagecheck_core::report::verify_artifacts;

pub fn verify_command(cmd: &VerifyCommand, presentation: &Presentation) -> Result<i32> {
    let key = cmd.key.as_deref().map(str::as_bytes);
    let verification = verify_artifacts(&cmd.dir, key)
        .with_context(|| format!("Failed to read manifest in {}", cmd.dir.display()))?;

    for path in &verification.mismatched {
        let _ = output_format::print_error_message(
            &mut std::io::stderr(),
            &format!("{} does not match the manifest", path),
            &presentation.theme,
            presentation.stderr_colors,
        );
    }
    match verification.signature_valid {
        Some(false) => {
            let _ = output_format::print_error_message(
                &mut std::io::stderr(),
                "manifest signature is invalid for the supplied key",
                &presentation.theme,
                presentation.stderr_colors,
            );
        }
        None => {
            let _ = output_format::print_warn_message(
                &mut std::io::stderr(),
                "no key supplied; signature not checked",
                &presentation.theme,
                presentation.stderr_colors,
            );
        }
        Some(true) => {}
    }

    if verification.is_ok() {
        println!(
            "{}",
            paint("verified", ThemeEntry::Success, &presentation.theme, presentation.stdout_colors)
        );
        Ok(exit_code::PASSED)
    } else {
        println!(
            "{}",
            paint("verification failed", ThemeEntry::Error, &presentation.theme, presentation.stdout_colors)
        );
        Ok(exit_code::FAILED)
    }
}
