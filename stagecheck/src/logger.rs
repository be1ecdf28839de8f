// stagecheck/src/logger.rs
//! Logging setup for the stagecheck binary.
//!
//! Logs go to stderr through `env_logger`. Every record passes through the
//! core redactor before it is written, so a credential that reaches a log
//! call is masked like anything else leaving the process.

use env_logger::{Builder, Env, Target};
use log::LevelFilter;
use stagecheck_core::redact_text;
use std::io::Write;

/// Initializes the global logger.
///
/// `level` overrides `RUST_LOG` when given; otherwise `RUST_LOG` applies with
/// `info` as the default. Calling this twice is harmless.
pub fn init_logger(level: Option<LevelFilter>) {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    if let Some(level) = level {
        builder.filter_level(level);
    }
    builder
        .target(Target::Stderr)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {:<5} {}] {}",
                buf.timestamp_seconds(),
                record.level(),
                record.target(),
                redact_text(&record.args().to_string())
            )
        });
    let _ = builder.try_init();
}

/// Picks the level override from the global flags: quiet wins over debug.
pub fn level_for(quiet: bool, debug: bool, verbose: bool) -> Option<LevelFilter> {
    if quiet {
        Some(LevelFilter::Warn)
    } else if debug || verbose {
        Some(LevelFilter::Debug)
    } else {
        None
    }
}
