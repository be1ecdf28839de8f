// stagecheck-core/src/lib.rs
//! # stagecheck Core Library
//!
//! `stagecheck-core` validates a staging deployment end to end: it toggles
//! feature flags under a declared prefix, verifies health, commands, logs and
//! the alert path with two independent methods per assertion, always restores
//! the flags to their safe defaults, and emits a redacted, evidence-backed
//! report.
//!
//! ## Modules
//!
//! * `redaction`: masks secret-shaped values in JSON and free text.
//! * `traces`: bounded per-user and global rings of command traces.
//! * `alerts`: fingerprints, the dedup/rate-limit gate and the dispatcher.
//! * `flags`: verified flag writes and guaranteed reverts.
//! * `double_check`: the primary/secondary verification engine.
//! * `orchestrator`: the staged validation run.
//! * `report`: JSON and Markdown reports plus the evidence bundle.
//! * `collaborators`: traits for the external systems, with HTTP and in-memory implementations.
//! * `config`, `errors`, `retry`, `cancel`, `governor`, `correlation`: shared plumbing.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stagecheck_core::collaborators::memory::{
//!     InMemoryChannel, InMemoryLogQuery, InMemoryParameterStore, InMemoryTarget,
//! };
//! use stagecheck_core::{Collaborators, Orchestrator, ValidationConfig};
//!
//! # async fn demo() -> stagecheck_core::Result<()> {
//! let config = ValidationConfig {
//!     alert_channel_id: "staging-alerts".to_string(),
//!     ..ValidationConfig::default()
//! };
//! let collaborators = Collaborators {
//!     parameters: Arc::new(InMemoryParameterStore::default()),
//!     logs: Arc::new(InMemoryLogQuery::default()),
//!     channel: Arc::new(InMemoryChannel::default()),
//!     ci: None,
//!     target: Arc::new(InMemoryTarget::healthy("https://app.staging.example.com")),
//! };
//! let run = Orchestrator::new(config, collaborators)?.run().await;
//! println!("{}", stagecheck_core::report::render_markdown(&run));
//! std::process::exit(run.exit_code());
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Library calls return [`StagecheckError`]; configuration loading uses
//! `anyhow` so file and parse errors carry context.
//!
//! ---
//! License: MIT OR APACHE 2.0

pub mod alerts;
pub mod cancel;
pub mod collaborators;
pub mod config;
pub mod correlation;
pub mod double_check;
pub mod errors;
pub mod flags;
pub mod governor;
pub mod orchestrator;
pub mod redaction;
pub mod report;
pub mod retry;
pub mod traces;

/// Re-exports the configuration types.
pub use config::{ConfigOverrides, FlagSpec, ValidationConfig};

/// Re-exports the error type and result alias.
pub use errors::{Result, StagecheckError};

/// Re-exports the redaction entry points.
pub use redaction::{redact, redact_serializable, redact_text, Redactor};

pub use alerts::{Alert, AlertDispatcher, AlertFingerprint, AlertGate, DispatchOutcome, Severity};
pub use cancel::CancelSignal;
pub use collaborators::Collaborators;
pub use correlation::CorrelationId;
pub use double_check::{CheckResult, CheckType, DoubleCheckEngine, Probe, ProbeReport, Verdict};
pub use flags::{FlagController, FlagState, RevertReport};
pub use orchestrator::{exit_code, Orchestrator, RunHooks, RunStatus, Stage, ValidationRun};
pub use retry::RetryPolicy;
pub use traces::{Trace, TraceHandle, TraceStore};
