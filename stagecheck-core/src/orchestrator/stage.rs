// stagecheck-core/src/orchestrator/stage.rs
use serde::{Deserialize, Serialize};
use std::fmt;

/// The states of a validation run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preflight,
    PermissionCheck,
    ReadBaseline,
    MutateFlags,
    FunctionalCheck,
    AlertPathCheck,
    CollectEvidence,
    RevertFlags,
    Report,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Preflight,
        Stage::PermissionCheck,
        Stage::ReadBaseline,
        Stage::MutateFlags,
        Stage::FunctionalCheck,
        Stage::AlertPathCheck,
        Stage::CollectEvidence,
        Stage::RevertFlags,
        Stage::Report,
    ];

    /// Stages that may be skipped after a failure. Cleanup and reporting always run.
    pub const STEPS: [Stage; 7] = [
        Stage::Preflight,
        Stage::PermissionCheck,
        Stage::ReadBaseline,
        Stage::MutateFlags,
        Stage::FunctionalCheck,
        Stage::AlertPathCheck,
        Stage::CollectEvidence,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Preflight => "preflight",
            Stage::PermissionCheck => "permission_check",
            Stage::ReadBaseline => "read_baseline",
            Stage::MutateFlags => "mutate_flags",
            Stage::FunctionalCheck => "functional_check",
            Stage::AlertPathCheck => "alert_path_check",
            Stage::CollectEvidence => "collect_evidence",
            Stage::RevertFlags => "revert_flags",
            Stage::Report => "report",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Passed,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    Failed,
    /// Interrupted by cancellation while in flight.
    Interrupted,
    /// Never entered because an earlier stage failed or aborted.
    Skipped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_is_fixed() {
        assert!(Stage::ALL.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(&Stage::ALL[..7], &Stage::STEPS[..]);
        assert_eq!(
            serde_json::to_string(&Stage::AlertPathCheck).unwrap(),
            "\"alert_path_check\""
        );
    }
}
