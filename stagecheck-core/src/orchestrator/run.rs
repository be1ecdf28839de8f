// stagecheck-core/src/orchestrator/run.rs
//! The record of one validation run, serialized as the machine-readable report.

use crate::correlation::CorrelationId;
use crate::double_check::CheckResult;
use crate::errors::StagecheckError;
use crate::flags::{FlagState, RevertReport};
use crate::orchestrator::stage::{RunStatus, Stage, StageOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Process exit codes derived from a finished run.
pub mod exit_code {
    pub const PASSED: i32 = 0;
    pub const FAILED: i32 = 1;
    pub const ABORTED: i32 = 2;
    pub const CLEANUP_FAILED: i32 = 3;
    pub const CONFIG_ERROR: i32 = 4;
    /// Passed, but at least one non-required check was inconsistent.
    pub const INCONSISTENT: i32 = 5;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub outcome: StageOutcome,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub stage: Stage,
    pub kind: String,
    /// Redacted.
    pub message: String,
    pub fatal: bool,
}

impl RunError {
    pub fn from_error(stage: Stage, err: &StagecheckError) -> Self {
        Self {
            stage,
            kind: err.kind().to_string(),
            message: crate::redaction::redact_text(&err.to_string()),
            fatal: err.is_fatal(),
        }
    }
}

/// A named, already-redacted evidence document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    /// File name under the run's `evidence/` directory.
    pub name: String,
    pub description: String,
    pub content: serde_json::Value,
}

impl EvidenceItem {
    pub fn reference(&self) -> String {
        format!("evidence/{}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRun {
    pub correlation_id: CorrelationId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub environment: String,
    pub target: String,
    pub dry_run: bool,
    /// Redacted snapshot of the configuration the run used.
    pub config: serde_json::Value,
    pub stages: Vec<StageRecord>,
    pub checks: Vec<CheckResult>,
    pub flag_baseline: Vec<FlagState>,
    pub flags_reverted: bool,
    pub revert: Option<RevertReport>,
    pub errors: Vec<RunError>,
    pub evidence_refs: Vec<String>,
    pub alerts_suppressed: u64,
    pub trace_id: Option<Uuid>,
    #[serde(skip)]
    pub evidence: Vec<EvidenceItem>,
}

impl ValidationRun {
    pub fn new(
        correlation_id: CorrelationId,
        environment: &str,
        target: &str,
        dry_run: bool,
        config: serde_json::Value,
    ) -> Self {
        Self {
            correlation_id,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            environment: environment.to_string(),
            target: target.to_string(),
            dry_run,
            config,
            stages: Vec::new(),
            checks: Vec::new(),
            flag_baseline: Vec::new(),
            flags_reverted: false,
            revert: None,
            errors: Vec::new(),
            evidence_refs: Vec::new(),
            alerts_suppressed: 0,
            trace_id: None,
            evidence: Vec::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed())
    }

    pub fn inconsistent_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.consistent)
    }

    pub fn cleanup_failed(&self) -> bool {
        !self.flags_reverted
    }

    pub fn has_fatal_error(&self) -> bool {
        self.errors.iter().any(|e| e.fatal)
    }

    pub fn push_evidence(&mut self, item: EvidenceItem) {
        self.evidence_refs.push(item.reference());
        self.evidence.push(item);
    }

    /// 0 only when the run passed and every check both passed and was consistent.
    pub fn exit_code(&self) -> i32 {
        if self.cleanup_failed() {
            return exit_code::CLEANUP_FAILED;
        }
        match self.status {
            RunStatus::Aborted => exit_code::ABORTED,
            RunStatus::Failed | RunStatus::Running => exit_code::FAILED,
            RunStatus::Passed if self.failed_checks().next().is_some() => exit_code::FAILED,
            RunStatus::Passed if self.inconsistent_checks().next().is_some() => {
                exit_code::INCONSISTENT
            }
            RunStatus::Passed => exit_code::PASSED,
        }
    }
}
