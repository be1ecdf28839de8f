//! Validation orchestration: the staged run, its probes and its record.

mod checks;
pub mod run;
pub mod runner;
pub mod stage;

pub use checks::RUN_USER;
pub use run::{exit_code, EvidenceItem, RunError, StageRecord, ValidationRun};
pub use runner::{Orchestrator, RunHooks};
pub use stage::{RunStatus, Stage, StageOutcome};
