// stagecheck-core/src/report/markdown.rs
//! Human-readable report.
//!
//! Failed, inconsistent and cleanup-failed outcomes get separate sections
//! because each one calls for a different next step.

use crate::double_check::{CheckResult, CheckType};
use crate::flags::FlagRevert;
use crate::orchestrator::{RunStatus, StageOutcome, ValidationRun};
use crate::redaction;
use std::fmt::Write;

/// Escapes a value for use inside a Markdown table cell.
fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace(['\r', '\n'], " ")
}

fn yes_no(b: bool) -> &'static str {
    if b { "yes" } else { "no" }
}

fn remediation_cell(check: &CheckResult) -> String {
    check
        .remediation_outcome
        .as_deref()
        .map_or_else(|| "-".to_string(), cell)
}

/// Concrete next action for a check whose assertion did not hold.
fn failed_action(check: &CheckResult) -> String {
    let subject = check.check_id.split_once(':').map(|(_, s)| s);
    match check.check_type {
        CheckType::Health => format!(
            "Health check failed ({}). Inspect the deployment's health endpoint and the most recent deploy; request traces are in `evidence/traces.json`.",
            check.primary_outcome.detail
        ),
        CheckType::Flag => format!(
            "Flag `{}` did not read back its test value ({}). Confirm parameter-store replication and that the run's credentials can write under the flag prefix.",
            subject.unwrap_or(check.check_id.as_str()),
            check.primary_outcome.detail
        ),
        CheckType::Command => format!(
            "The diagnostic command failed ({}). Reproduce it with the run's correlation id and check the service logs in `evidence/logs.json`.",
            check.primary_outcome.detail
        ),
        CheckType::Alert => format!(
            "The test alert did not go out ({}). Check the chat integration's credentials and whether the alert gate was already holding this fingerprint (`evidence/alert-gate.json`).",
            check.primary_outcome.detail
        ),
        CheckType::Log => format!(
            "Error-level log entries were recorded during the run ({}). Triage them from `evidence/logs.json` before promoting this build.",
            check.primary_outcome.detail
        ),
    }
}

/// Concrete next action when the two verification methods disagreed.
fn inconsistent_action(check: &CheckResult) -> String {
    let hint = match check.check_type {
        CheckType::Health => {
            "the full health endpoint and the liveness path are served by different code paths; look for a degraded dependency or a routing rule that only affects one of them"
        }
        CheckType::Flag => {
            "the direct read and the prefix listing disagree; suspect read-replica lag or caching in the parameter store"
        }
        CheckType::Command => {
            "the command answered but its log trail is missing (or the reverse); check log shipping delay and correlation-id propagation"
        }
        CheckType::Alert => {
            "the channel response and the gate record disagree; check whether the message was posted to the expected channel"
        }
        CheckType::Log => {
            "server-side logs and client-side traces disagree; compare `evidence/logs.json` with `evidence/traces.json`"
        }
    };
    format!(
        "Re-run with `--verbose` and compare both methods for `{}`: {}.",
        check.check_id, hint
    )
}

fn cleanup_action(revert: &FlagRevert) -> String {
    format!(
        "Set `{}` back to `{}` by hand (last observed {}) and confirm with a direct read. The environment may be left mutated until this is done.",
        revert.name,
        revert.safe_default,
        revert
            .observed
            .as_deref()
            .map_or_else(|| "nothing".to_string(), |v| format!("`{}`", v))
    )
}

fn write_header(out: &mut String, run: &ValidationRun) {
    let _ = writeln!(
        out,
        "# Staging validation report: {}\n",
        run.status.as_str().to_uppercase()
    );
    let _ = writeln!(out, "| Field | Value |\n|---|---|");
    let _ = writeln!(out, "| Correlation id | `{}` |", run.correlation_id);
    let _ = writeln!(out, "| Environment | {} |", cell(&run.environment));
    let _ = writeln!(out, "| Target | {} |", cell(&run.target));
    let _ = writeln!(out, "| Mode | {} |", if run.dry_run { "dry run" } else { "live" });
    let _ = writeln!(out, "| Started | {} |", run.started_at.to_rfc3339());
    let _ = writeln!(
        out,
        "| Finished | {} |",
        run.finished_at.map_or_else(|| "-".to_string(), |t| t.to_rfc3339())
    );
    if let Some(done) = run.finished_at {
        let _ = writeln!(
            out,
            "| Duration | {} ms |",
            (done - run.started_at).num_milliseconds().max(0)
        );
    }
    let _ = writeln!(out, "| Flags reverted | {} |", yes_no(run.flags_reverted));
    let _ = writeln!(out, "| Alerts suppressed | {} |", run.alerts_suppressed);
    let _ = writeln!(out, "| Exit code | {} |\n", run.exit_code());
}

fn write_stages(out: &mut String, run: &ValidationRun) {
    let _ = writeln!(out, "## Stages\n\n| Stage | Outcome | Duration |\n|---|---|---|");
    for record in &run.stages {
        let outcome = match record.outcome {
            StageOutcome::Completed => "completed",
            StageOutcome::Failed => "failed",
            StageOutcome::Interrupted => "interrupted",
            StageOutcome::Skipped => "skipped",
        };
        let _ = writeln!(
            out,
            "| {} | {} | {} ms |",
            record.stage, outcome, record.duration_ms
        );
    }
    out.push('\n');
}

fn write_matrix(out: &mut String, run: &ValidationRun) {
    let _ = writeln!(out, "## Double-check matrix\n");
    if run.checks.is_empty() {
        let _ = writeln!(out, "No checks were executed.\n");
        return;
    }
    let _ = writeln!(
        out,
        "| Check | Type | Required | Primary | Secondary | Consistent | Remediation |\n|---|---|---|---|---|---|---|"
    );
    for check in &run.checks {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {} | {} | {} |",
            cell(&check.check_id),
            check.check_type,
            yes_no(check.required),
            check.primary_outcome.verdict,
            check.secondary_outcome.verdict,
            if check.consistent { "y" } else { "n" },
            remediation_cell(check)
        );
    }
    out.push('\n');
}

fn write_failed(out: &mut String, run: &ValidationRun) {
    let _ = writeln!(out, "## Failed checks\n");
    let mut any = false;
    for check in run.failed_checks() {
        any = true;
        let _ = writeln!(
            out,
            "- **{}** ({}{}): primary {} - {}",
            check.check_id,
            check.check_type,
            if check.required { ", required" } else { "" },
            check.primary_outcome.verdict,
            check.primary_outcome.detail
        );
    }
    if !any {
        let _ = writeln!(out, "None.");
    }
    out.push('\n');
}

fn write_inconsistent(out: &mut String, run: &ValidationRun) {
    let _ = writeln!(out, "## Inconsistent checks\n");
    let mut any = false;
    for check in run.inconsistent_checks() {
        any = true;
        let _ = writeln!(
            out,
            "- **{}**{}: {}",
            check.check_id,
            if check.required { " (required, fails the run)" } else { "" },
            check.discrepancy_note.as_deref().unwrap_or("methods disagreed")
        );
        if let Some(outcome) = &check.remediation_outcome {
            let _ = writeln!(out, "  - Remediation: {}", outcome);
        }
    }
    if !any {
        let _ = writeln!(out, "None.");
    }
    out.push('\n');
}

fn write_cleanup(out: &mut String, run: &ValidationRun) {
    let _ = writeln!(out, "## Cleanup\n");
    match &run.revert {
        None => {
            let _ = writeln!(out, "Revert did not run.");
        }
        Some(report) if report.flags.is_empty() => {
            let _ = writeln!(out, "No flags were mutated; nothing to revert.");
        }
        Some(report) => {
            let _ = writeln!(
                out,
                "{}\n\n| Flag | Safe default | Observed | Verified |\n|---|---|---|---|",
                if report.verified {
                    "All mutated flags were read back at their safe defaults."
                } else {
                    "**CLEANUP FAILED: at least one flag could not be verified at its safe default.**"
                }
            );
            for flag in &report.flags {
                let _ = writeln!(
                    out,
                    "| `{}` | `{}` | {} | {} |",
                    cell(&flag.name),
                    cell(&flag.safe_default),
                    flag.observed.as_deref().map_or_else(|| "-".to_string(), |v| format!("`{}`", cell(v))),
                    yes_no(flag.verified)
                );
            }
        }
    }
    out.push('\n');
}

fn write_errors(out: &mut String, run: &ValidationRun) {
    if run.errors.is_empty() {
        return;
    }
    let _ = writeln!(out, "## Errors\n");
    for err in &run.errors {
        let _ = writeln!(
            out,
            "- [{}] {}{}: {}",
            err.stage,
            err.kind,
            if err.fatal { " (fatal)" } else { "" },
            err.message
        );
    }
    out.push('\n');
}

fn write_playbook(out: &mut String, run: &ValidationRun) {
    let mut steps = Vec::new();
    if let Some(report) = &run.revert {
        steps.extend(report.flags.iter().filter(|f| !f.verified).map(cleanup_action));
    }
    if run.status == RunStatus::Aborted {
        for err in run.errors.iter().filter(|e| e.fatal) {
            steps.push(match err.kind.as_str() {
                "permission" => format!(
                    "The run was aborted by a safety gate: {}. Fix the target, credentials or channel before re-running; no flags were written.",
                    err.message
                ),
                "cancelled" => format!(
                    "The run was cancelled during {} ({}). Re-run when the environment is quiet.",
                    err.stage, err.message
                ),
                _ => format!("Resolve '{}' before re-running.", err.message),
            });
        }
    }
    if run.status == RunStatus::Failed {
        for err in run.errors.iter().filter(|e| e.kind == "precondition") {
            steps.push(format!("Preflight refused the run: {}. Fix the build first.", err.message));
        }
    }
    steps.extend(run.failed_checks().map(failed_action));
    steps.extend(run.inconsistent_checks().map(inconsistent_action));

    let _ = writeln!(out, "## Playbook\n");
    if steps.is_empty() {
        let _ = writeln!(out, "Nothing to do. Every check passed and agreed with its second method.");
        return;
    }
    for (i, step) in steps.iter().enumerate() {
        let _ = writeln!(out, "{}. {}", i + 1, step);
    }
}

/// Renders the Markdown report. The result is redacted as a whole.
pub fn render(run: &ValidationRun) -> String {
    let mut out = String::with_capacity(4096);
    write_header(&mut out, run);
    write_stages(&mut out, run);
    write_matrix(&mut out, run);
    write_failed(&mut out, run);
    write_inconsistent(&mut out, run);
    write_cleanup(&mut out, run);
    write_errors(&mut out, run);
    write_playbook(&mut out, run);
    if !run.evidence_refs.is_empty() {
        let _ = writeln!(out, "\n## Evidence\n");
        for reference in &run.evidence_refs {
            let _ = writeln!(out, "- [{}]({})", reference, reference);
        }
    }
    redaction::redact_text(&out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationId;
    use crate::double_check::{ProbeOutcome, Verdict};
    use crate::flags::RevertReport;

    fn outcome(verdict: Verdict, detail: &str) -> ProbeOutcome {
        ProbeOutcome {
            verdict,
            detail: detail.to_string(),
            duration_ms: 3,
        }
    }

    fn check(id: &str, check_type: CheckType, primary: Verdict, secondary: Verdict) -> CheckResult {
        let consistent = primary.is_pass() == secondary.is_pass();
        CheckResult {
            check_id: id.to_string(),
            check_type,
            required: false,
            primary_outcome: outcome(primary, "GET /health -> 200"),
            secondary_outcome: outcome(secondary, "GET / -> 404"),
            consistent,
            discrepancy_note: (!consistent).then(|| "primary passed but secondary returned fail".to_string()),
            remediation_attempted: !consistent,
            remediation_outcome: (!consistent).then(|| "re-ran both probes; outcomes still disagree".to_string()),
            duration_ms: 10,
        }
    }

    fn base() -> ValidationRun {
        let mut run = ValidationRun::new(
            CorrelationId::generate(),
            "staging",
            "https://app.staging.example.com",
            false,
            serde_json::json!({}),
        );
        run.flags_reverted = true;
        run.revert = Some(RevertReport::default());
        run
    }

    #[test]
    fn test_matrix_lists_every_check() {
        let mut run = base();
        run.status = RunStatus::Passed;
        run.checks = vec![
            check("health", CheckType::Health, Verdict::Pass, Verdict::Fail),
            check("log", CheckType::Log, Verdict::Pass, Verdict::Pass),
        ];
        let md = render(&run);
        assert!(md.starts_with("# Staging validation report: PASSED"));
        assert!(md.contains("| health | health | no | pass | fail | n |"));
        assert!(md.contains("| log | log | no | pass | pass | y | - |"));
        assert!(md.contains("## Inconsistent checks\n\n- **health**"));
        assert!(md.contains("## Failed checks\n\nNone."));
        assert!(md.contains("liveness path"));
    }

    #[test]
    fn test_cleanup_failure_is_loud_and_actionable() {
        let mut run = base();
        run.status = RunStatus::Failed;
        run.flags_reverted = false;
        run.revert = Some(RevertReport {
            verified: false,
            flags: vec![FlagRevert {
                name: "/staging/flags/new-checkout".to_string(),
                safe_default: "off".to_string(),
                observed: Some("on".to_string()),
                verified: false,
                error: Some("did not propagate".to_string()),
            }],
        });
        let md = render(&run);
        assert!(md.contains("CLEANUP FAILED"));
        assert!(md.contains("Set `/staging/flags/new-checkout` back to `off` by hand (last observed `on`)"));
        assert!(md.contains("| Exit code | 3 |"));
    }

    #[test]
    fn test_table_cells_are_escaped() {
        assert_eq!(cell("a|b\nc"), "a\\|b c");
    }
}
