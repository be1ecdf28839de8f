// stagecheck-core/src/double_check/types.rs
use crate::errors::{Result, StagecheckError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    Health,
    Flag,
    Command,
    Alert,
    Log,
}

impl CheckType {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckType::Health => "health",
            CheckType::Flag => "flag",
            CheckType::Command => "command",
            CheckType::Alert => "alert",
            CheckType::Log => "log",
        }
    }
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    /// The probe could not produce an answer (collaborator error, panic).
    Error,
}

impl Verdict {
    pub fn is_pass(self) -> bool {
        self == Verdict::Pass
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
            Verdict::Error => "error",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub verdict: Verdict,
    /// Redacted.
    pub detail: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_id: String,
    pub check_type: CheckType,
    pub required: bool,
    pub primary_outcome: ProbeOutcome,
    pub secondary_outcome: ProbeOutcome,
    pub consistent: bool,
    pub discrepancy_note: Option<String>,
    pub remediation_attempted: bool,
    pub remediation_outcome: Option<String>,
    pub duration_ms: u64,
}

impl CheckResult {
    /// The check's own assertion held, judged by the primary method.
    pub fn passed(&self) -> bool {
        self.primary_outcome.verdict.is_pass()
    }

    pub fn clean(&self) -> bool {
        self.passed() && self.consistent
    }

    pub fn mismatch_error(&self) -> Option<StagecheckError> {
        if self.consistent {
            return None;
        }
        Some(StagecheckError::ConsistencyMismatch {
            check_id: self.check_id.clone(),
            note: self.discrepancy_note.clone().unwrap_or_default(),
        })
    }
}

/// What a probe found, before timing and redaction are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub passed: bool,
    pub detail: String,
}

impl ProbeReport {
    pub fn pass(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            detail: detail.into(),
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail: detail.into(),
        }
    }

    pub fn from_bool(passed: bool, detail: impl Into<String>) -> Self {
        Self {
            passed,
            detail: detail.into(),
        }
    }
}

pub type ProbeFuture = Pin<Box<dyn Future<Output = Result<ProbeReport>> + Send + 'static>>;

/// A re-runnable, read-only verification method.
#[derive(Clone)]
pub struct Probe {
    label: String,
    run: Arc<dyn Fn() -> ProbeFuture + Send + Sync>,
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe").field("label", &self.label).finish()
    }
}

impl Probe {
    pub fn new<F, Fut>(label: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ProbeReport>> + Send + 'static,
    {
        Self {
            label: label.into(),
            run: Arc::new(move || Box::pin(f())),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn start(&self) -> ProbeFuture {
        (self.run)()
    }
}
