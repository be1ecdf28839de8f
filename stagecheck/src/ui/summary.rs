//! Terminal summary of a validation run: a headline, the double-check table,
//! errors and the cleanup outcome.

use crate::ui::theme::{paint, ThemeEntry, ThemeMap};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color, ContentArrangement, Table};
use stagecheck_core::report::ArtifactSet;
use stagecheck_core::{CheckResult, RunStatus, ValidationRun, Verdict};
use std::fmt::Write as _;

fn status_entry(run: &ValidationRun) -> ThemeEntry {
    if run.cleanup_failed() {
        return ThemeEntry::Critical;
    }
    match run.status {
        RunStatus::Passed if run.inconsistent_checks().next().is_some() => ThemeEntry::Warn,
        RunStatus::Passed => ThemeEntry::Success,
        RunStatus::Aborted => ThemeEntry::Warn,
        _ => ThemeEntry::Error,
    }
}

fn verdict_cell(verdict: Verdict, enable_colors: bool) -> Cell {
    let cell = Cell::new(verdict.as_str());
    if !enable_colors {
        return cell;
    }
    if verdict.is_pass() {
        cell.fg(Color::Green)
    } else {
        cell.fg(Color::Red)
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn checks_table(checks: &[CheckResult], enable_colors: bool) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "Check",
            "Type",
            "Required",
            "Primary",
            "Secondary",
            "Consistent",
            "Remediation",
        ]);
    if enable_colors {
        table.enforce_styling();
    }
    for check in checks {
        let consistent = Cell::new(yes_no(check.consistent));
        let consistent = match (enable_colors, check.consistent) {
            (true, false) => consistent.fg(Color::Yellow),
            _ => consistent,
        };
        let remediation = match (&check.remediation_outcome, check.remediation_attempted) {
            (Some(outcome), _) => outcome.clone(),
            (None, true) => "attempted".to_string(),
            (None, false) => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(&check.check_id),
            Cell::new(check.check_type.as_str()),
            Cell::new(yes_no(check.required)),
            verdict_cell(check.primary_outcome.verdict, enable_colors),
            verdict_cell(check.secondary_outcome.verdict, enable_colors),
            consistent,
            Cell::new(remediation),
        ]);
    }
    table
}

/// Renders the summary as a string; colors only when `enable_colors` is set.
pub fn render_summary(
    run: &ValidationRun,
    artifacts: Option<&ArtifactSet>,
    theme: &ThemeMap,
    enable_colors: bool,
) -> String {
    let mut out = String::new();
    let headline = format!(
        "stagecheck run {} against {} [{}]{}",
        run.correlation_id,
        run.target,
        run.environment,
        if run.dry_run { " (dry run)" } else { "" }
    );
    let _ = writeln!(out, "{}", paint(&headline, ThemeEntry::Header, theme, enable_colors));

    let status = format!(
        "Status: {} (exit code {})",
        run.status.as_str().to_uppercase(),
        run.exit_code()
    );
    let _ = writeln!(out, "{}", paint(&status, status_entry(run), theme, enable_colors));

    if run.checks.is_empty() {
        let _ = writeln!(out, "No checks were executed.");
    } else {
        let _ = writeln!(out, "{}", checks_table(&run.checks, enable_colors));
    }

    for check in run.inconsistent_checks() {
        if let Some(note) = &check.discrepancy_note {
            let line = format!("inconsistent {}: {}", check.check_id, note);
            let _ = writeln!(out, "{}", paint(&line, ThemeEntry::Warn, theme, enable_colors));
        }
    }

    for error in &run.errors {
        let line = format!("[{}] {}: {}", error.stage, error.kind, error.message);
        let _ = writeln!(out, "{}", paint(&line, ThemeEntry::Error, theme, enable_colors));
    }

    if run.cleanup_failed() {
        let names = run
            .revert
            .as_ref()
            .map(|r| r.failed_names().join(", "))
            .unwrap_or_default();
        let line = format!("CLEANUP FAILED: flags not restored: {}", names);
        let _ = writeln!(out, "{}", paint(&line, ThemeEntry::Critical, theme, enable_colors));
    } else {
        let _ = writeln!(out, "Flags restored to safe defaults: yes");
    }

    if run.alerts_suppressed > 0 {
        let _ = writeln!(out, "Alerts suppressed by dedup/rate limit: {}", run.alerts_suppressed);
    }

    if let Some(set) = artifacts {
        let line = format!(
            "Report written to {}{}",
            set.dir.display(),
            if set.signed { " (signed manifest)" } else { "" }
        );
        let _ = writeln!(out, "{}", paint(&line, ThemeEntry::Muted, theme, enable_colors));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::theme::ThemeStyle;
    use stagecheck_core::CorrelationId;

    fn finished_run(status: RunStatus) -> ValidationRun {
        let mut run = ValidationRun::new(
            CorrelationId::generate(),
            "staging",
            "https://app.staging.example.com",
            false,
            serde_json::json!({}),
        );
        run.status = status;
        run.flags_reverted = true;
        run
    }

    #[test]
    fn summary_without_checks_states_status_and_cleanup() {
        let theme = ThemeStyle::default_theme_map();
        let text = render_summary(&finished_run(RunStatus::Aborted), None, &theme, false);
        assert!(text.contains("Status: ABORTED (exit code 2)"), "{text}");
        assert!(text.contains("No checks were executed."));
        assert!(text.contains("Flags restored to safe defaults: yes"));
    }

    #[test]
    fn cleanup_failure_is_called_out() {
        let theme = ThemeStyle::default_theme_map();
        let mut run = finished_run(RunStatus::Failed);
        run.flags_reverted = false;
        let text = render_summary(&run, None, &theme, false);
        assert!(text.contains("CLEANUP FAILED"), "{text}");
        assert!(text.contains("exit code 3"));
    }
}
