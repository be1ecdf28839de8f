// stagecheck/src/lib.rs
//! # stagecheck CLI Application
//!
//! Terminal front end for `stagecheck-core`: argument parsing, logging,
//! HTTP collaborator wiring and the run summary. The binary in `main.rs` is a
//! thin wrapper around [`commands::dispatch`].
//!
//! License: MIT OR APACHE 2.0

pub mod cli;
pub mod commands;
pub mod errors;
pub mod logger;
pub mod ui;

pub use errors::{exit_code_for, CliError};
