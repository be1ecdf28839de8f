//! Double-check framework: two independent methods per assertion.

pub mod engine;
pub mod types;

pub use engine::DoubleCheckEngine;
pub use types::{CheckResult, CheckType, Probe, ProbeFuture, ProbeOutcome, ProbeReport, Verdict};
