// stagecheck-core/src/orchestrator/runner.rs
//! The validation state machine.
//!
//! Stages run strictly in order. The first stage that returns an error stops
//! the sequence; `RevertFlags` and `Report` run regardless, including after
//! cancellation. If the run future itself is dropped or unwinds while flags
//! are touched, a guard schedules the revert on the current runtime.
//!
//! License: MIT OR APACHE 2.0

use crate::alerts::{Alert, AlertDispatcher, AlertFingerprint, AlertGate, Severity};
use crate::cancel::CancelSignal;
use crate::collaborators::{Collaborators, TimeRange};
use crate::config::ValidationConfig;
use crate::correlation::CorrelationId;
use crate::double_check::{CheckResult, CheckType, DoubleCheckEngine, Probe};
use crate::errors::{Result, StagecheckError};
use crate::flags::{FlagController, FlagState};
use crate::orchestrator::checks::{self, ProbeContext, RUN_USER};
use crate::orchestrator::run::{EvidenceItem, RunError, StageRecord, ValidationRun};
use crate::orchestrator::stage::{RunStatus, Stage, StageOutcome};
use crate::redaction::Redactor;
use crate::retry::{timed_out, RetryPolicy};
use crate::traces::{StepStatus, TraceHandle, TraceStore};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use regex::Regex;
use serde_json::json;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::time::Duration;

const EVIDENCE_LOG_LIMIT: usize = 200;

/// Observer and fault-injection point around each stage.
pub trait RunHooks: Send + Sync {
    /// Called before a stage starts. An error is treated as the stage failing.
    fn before_stage(&self, _stage: Stage, _run: &ValidationRun) -> Result<()> {
        Ok(())
    }

    fn after_check(&self, _check: &CheckResult) {}
}

/// Reverts touched flags if a run is abandoned without reaching `RevertFlags`.
struct RevertGuard {
    flags: Arc<FlagController>,
    armed: bool,
}

impl RevertGuard {
    fn new(flags: Arc<FlagController>) -> Self {
        Self { flags, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RevertGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let touched = self.flags.touched();
        if touched.is_empty() {
            return;
        }
        match Handle::try_current() {
            Ok(handle) => {
                warn!(
                    "Run abandoned with {} touched flag(s); scheduling revert",
                    touched.len()
                );
                let flags = Arc::clone(&self.flags);
                handle.spawn(async move {
                    let report = flags.revert_touched().await;
                    if !report.verified {
                        error!(
                            "Background revert could not verify: {}",
                            report.failed_names().join(", ")
                        );
                    }
                });
            }
            Err(_) => error!(
                "Run abandoned outside a runtime; flags left mutated: {}",
                touched.join(", ")
            ),
        }
    }
}

struct InFlight {
    stage: Stage,
    started_at: DateTime<Utc>,
    clock: Instant,
}

struct RunContext {
    run: ValidationRun,
    flags: Arc<FlagController>,
    probes: ProbeContext,
    trace: TraceHandle,
    mutated: Vec<FlagState>,
    test_alert: Option<AlertFingerprint>,
    current: Option<InFlight>,
    halted_at: Option<Stage>,
    cancelled: bool,
}

impl RunContext {
    fn begin(&mut self, stage: Stage) {
        debug!("[{}] entering {}", self.run.correlation_id, stage);
        self.current = Some(InFlight {
            stage,
            started_at: Utc::now(),
            clock: Instant::now(),
        });
    }

    fn finish(&mut self, outcome: StageOutcome) {
        let Some(flight) = self.current.take() else {
            return;
        };
        let status = match outcome {
            StageOutcome::Completed => StepStatus::Ok,
            StageOutcome::Skipped => StepStatus::Skipped,
            StageOutcome::Failed | StageOutcome::Interrupted => StepStatus::Failed,
        };
        self.trace.append_step(flight.stage.as_str(), status);
        self.run.stages.push(StageRecord {
            stage: flight.stage,
            outcome,
            started_at: Some(flight.started_at),
            duration_ms: flight.clock.elapsed().as_millis() as u64,
        });
    }

    fn record_error(&mut self, stage: Stage, err: &StagecheckError) {
        if err.is_fatal() {
            error!("[{}] {} failed: {}", self.run.correlation_id, stage, err);
        } else {
            warn!("[{}] {}: {}", self.run.correlation_id, stage, err);
        }
        self.run.errors.push(RunError::from_error(stage, err));
    }

    fn next_pending(&self) -> Stage {
        Stage::STEPS
            .into_iter()
            .find(|s| !self.run.stages.iter().any(|r| r.stage == *s))
            .unwrap_or(Stage::RevertFlags)
    }

    /// Records a cancellation against the in-flight stage, or the next one.
    fn interrupt(&mut self, reason: String) {
        let stage = self
            .current
            .as_ref()
            .map_or_else(|| self.next_pending(), |f| f.stage);
        if self.current.is_some() {
            self.finish(StageOutcome::Interrupted);
        }
        warn!("[{}] cancelled during {}: {}", self.run.correlation_id, stage, reason);
        self.record_error(stage, &StagecheckError::Cancelled(reason));
        self.cancelled = true;
        self.halted_at.get_or_insert(stage);
    }

    fn push_evidence(&mut self, redactor: &Redactor, name: &str, description: &str, content: serde_json::Value) {
        self.run.push_evidence(EvidenceItem {
            name: name.to_string(),
            description: description.to_string(),
            content: redactor.redact(&content),
        });
    }
}

pub struct Orchestrator {
    config: ValidationConfig,
    collaborators: Collaborators,
    redactor: Arc<Redactor>,
    traces: TraceStore,
    dispatcher: Arc<AlertDispatcher>,
    engine: DoubleCheckEngine,
    retry: RetryPolicy,
    production: Regex,
    hooks: Vec<Arc<dyn RunHooks>>,
    cancel: CancelSignal,
}

impl Orchestrator {
    /// Builds an orchestrator with its own trace store and alert gate.
    pub fn new(config: ValidationConfig, collaborators: Collaborators) -> Result<Self> {
        let redactor = Arc::new(Redactor::default());
        let traces = TraceStore::new(&config.trace, Arc::clone(&redactor));
        let gate = Arc::new(AlertGate::new(config.dedup_window(), &config.alerts));
        Self::with_shared(config, collaborators, traces, gate)
    }

    /// Builds an orchestrator around an existing trace store and alert gate,
    /// so several runs share dedup state and trace history.
    pub fn with_shared(
        config: ValidationConfig,
        collaborators: Collaborators,
        traces: TraceStore,
        gate: Arc<AlertGate>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| StagecheckError::Config(e.to_string()))?;
        let production = Regex::new(&config.production_pattern)
            .map_err(|e| StagecheckError::Config(format!("invalid production pattern: {}", e)))?;
        let redactor = Arc::new(Redactor::default());
        let dispatcher = AlertDispatcher::new(
            gate,
            Arc::clone(&collaborators.channel),
            &config.channel_allow_pattern,
            &config.alerts.message_template,
            Arc::clone(&redactor),
            config.request_timeout(),
        )?
        .with_dry_run(config.options.dry_run);
        let engine = DoubleCheckEngine::from_config(&config, Arc::clone(&redactor));
        Ok(Self {
            retry: RetryPolicy::from(&config.retry),
            config,
            collaborators,
            redactor,
            traces,
            dispatcher: Arc::new(dispatcher),
            engine,
            production,
            hooks: Vec::new(),
            cancel: CancelSignal::new(),
        })
    }

    pub fn with_hook(mut self, hook: Arc<dyn RunHooks>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Replaces the cancellation signal, e.g. with one wired to Ctrl-C.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn traces(&self) -> &TraceStore {
        &self.traces
    }

    pub fn gate(&self) -> &Arc<AlertGate> {
        self.dispatcher.gate()
    }

    /// Executes one validation run. Never returns early: every outcome,
    /// including cancellation, ends with a reverted and reported run.
    pub async fn run(&self) -> ValidationRun {
        let mut ctx = self.start_run();
        let mut guard = RevertGuard::new(Arc::clone(&ctx.flags));
        info!(
            "Starting validation run {} against '{}' ({})",
            ctx.run.correlation_id,
            ctx.run.target,
            if self.config.options.dry_run { "dry run" } else { "live" }
        );

        let cancel = match self.config.timeouts.run_deadline_secs {
            Some(secs) => self.cancel.deadline_from_now(Duration::from_secs(secs)),
            None => self.cancel.clone(),
        };
        let interrupted = tokio::select! {
            biased;
            reason = cancel.cancelled() => Some(reason),
            () = self.execute(&mut ctx, &cancel) => None,
        };
        if let Some(reason) = interrupted {
            ctx.interrupt(reason);
        }

        self.revert_flags(&mut ctx).await;
        guard.disarm();
        self.report(&mut ctx).await;

        info!(
            "Validation run {} finished: {} (exit code {})",
            ctx.run.correlation_id,
            ctx.run.status,
            ctx.run.exit_code()
        );
        ctx.run
    }

    fn start_run(&self) -> RunContext {
        let correlation_id = CorrelationId::generate();
        let target = self.collaborators.target.identifier();
        let snapshot = self.redactor.redact_serializable(&self.config);
        let mut run = ValidationRun::new(
            correlation_id.clone(),
            &self.config.environment,
            &target,
            self.config.options.dry_run,
            snapshot,
        );
        let trace = self
            .traces
            .create_trace(&format!("validation run {}", correlation_id), Some(RUN_USER));
        run.trace_id = Some(trace.trace_id());

        let flags = FlagController::new(
            Arc::clone(&self.collaborators.parameters),
            &self.config.flag_prefix,
            &self.config.flags,
            self.retry.clone(),
        )
        .with_dry_run(self.config.options.dry_run);

        let probes = ProbeContext {
            target: Arc::clone(&self.collaborators.target),
            parameters: Arc::clone(&self.collaborators.parameters),
            logs: Arc::clone(&self.collaborators.logs),
            traces: self.traces.clone(),
            correlation_id: correlation_id.to_string(),
            started_at: run.started_at,
            trace_ids: Arc::new(Mutex::new(Vec::new())),
        };

        RunContext {
            run,
            flags: Arc::new(flags),
            probes,
            trace,
            mutated: Vec::new(),
            test_alert: None,
            current: None,
            halted_at: None,
            cancelled: false,
        }
    }

    fn before_stage(&self, stage: Stage, run: &ValidationRun) -> Result<()> {
        for hook in &self.hooks {
            hook.before_stage(stage, run)?;
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut RunContext, cancel: &CancelSignal) {
        for stage in Stage::STEPS {
            if let Some(reason) = cancel.reason() {
                ctx.interrupt(reason);
                return;
            }
            ctx.begin(stage);
            let result = match self.before_stage(stage, &ctx.run) {
                Ok(()) => self.run_step(stage, ctx).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    // A stage that never yielded cannot have been raced by the select.
                    if let Some(reason) = cancel.reason() {
                        ctx.interrupt(reason);
                        return;
                    }
                    ctx.finish(StageOutcome::Completed);
                }
                Err(e) => {
                    ctx.finish(StageOutcome::Failed);
                    ctx.record_error(stage, &e);
                    ctx.halted_at = Some(stage);
                    return;
                }
            }
        }
    }

    async fn run_step(&self, stage: Stage, ctx: &mut RunContext) -> Result<()> {
        match stage {
            Stage::Preflight => self.preflight(ctx).await,
            Stage::PermissionCheck => self.permission_check(ctx).await,
            Stage::ReadBaseline => self.read_baseline(ctx).await,
            Stage::MutateFlags => self.mutate_flags(ctx).await,
            Stage::FunctionalCheck => self.functional_check(ctx).await,
            Stage::AlertPathCheck => self.alert_path_check(ctx).await,
            Stage::CollectEvidence => self.collect_evidence(ctx).await,
            Stage::RevertFlags | Stage::Report => Ok(()),
        }
    }

    /// Bounds a direct collaborator call by the request timeout.
    async fn bounded<T>(&self, collaborator: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.config.request_timeout();
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(timed_out(collaborator, limit)),
        }
    }

    async fn preflight(&self, ctx: &mut RunContext) -> Result<()> {
        let (Some(ci), Some(git_ref)) = (&self.collaborators.ci, &self.config.ci_ref) else {
            debug!("No CI ref configured; skipping CI status check");
            return Ok(());
        };
        match self.bounded("ci", ci.latest_run(git_ref)).await {
            Ok(run) => {
                ctx.push_evidence(
                    &self.redactor,
                    "ci-status.json",
                    "Latest CI run for the configured ref",
                    json!({ "ref": git_ref, "status": run.status, "url": run.url }),
                );
                match run.status {
                    crate::collaborators::CiState::Failure => Err(StagecheckError::Precondition(
                        format!("latest CI run for '{}' failed: {}", git_ref, run.url),
                    )),
                    crate::collaborators::CiState::Success => Ok(()),
                    other => {
                        warn!("CI status for '{}' is {:?}; continuing", git_ref, other);
                        Ok(())
                    }
                }
            }
            Err(e) => {
                warn!("Could not read CI status for '{}': {}", git_ref, e);
                ctx.record_error(Stage::Preflight, &e);
                Ok(())
            }
        }
    }

    /// Identifiers that must never look like production under the guard.
    fn guarded_identifiers(&self, ctx: &RunContext) -> Vec<(&'static str, String)> {
        let mut ids = vec![
            ("environment", self.config.environment.clone()),
            ("target", ctx.run.target.clone()),
            ("flag prefix", self.config.flag_prefix.clone()),
            ("alert channel", self.config.alert_channel_id.clone()),
        ];
        ids.extend(self.config.flags.iter().map(|f| ("flag", f.name.clone())));
        ids
    }

    async fn permission_check(&self, ctx: &mut RunContext) -> Result<()> {
        if self.config.options.staging_only_guard {
            if let Some((what, id)) = self
                .guarded_identifiers(ctx)
                .into_iter()
                .find(|(_, id)| self.production.is_match(id))
            {
                return Err(StagecheckError::Permission(format!(
                    "{} '{}' looks like production and the staging-only guard is on",
                    what, id
                )));
            }
        }

        if !self.dispatcher.channel_allowed(&self.config.alert_channel_id) {
            return Err(StagecheckError::Permission(format!(
                "alert channel '{}' is not an allowed non-production channel",
                self.config.alert_channel_id
            )));
        }

        if let Some(outside) = self.config.flags.iter().find(|f| !ctx.flags.in_scope(&f.name)) {
            return Err(StagecheckError::Scope(format!(
                "flag '{}' is outside the declared prefix '{}'",
                outside.name, self.config.flag_prefix
            )));
        }

        let access = self
            .bounded(
                "parameter-store",
                self.collaborators.parameters.access(&self.config.flag_prefix),
            )
            .await
            .map_err(|e| StagecheckError::Permission(format!("could not verify access: {}", e)))?;
        let needs_write = !self.config.options.dry_run && !self.config.flags.is_empty();
        if !access.read || (needs_write && !access.write) {
            return Err(StagecheckError::Permission(format!(
                "credentials lack {} access under '{}'",
                if access.read { "write" } else { "read" },
                self.config.flag_prefix
            )));
        }
        info!(
            "[{}] permission check passed (read={}, write={})",
            ctx.run.correlation_id, access.read, access.write
        );
        Ok(())
    }

    async fn read_baseline(&self, ctx: &mut RunContext) -> Result<()> {
        let flags = Arc::clone(&ctx.flags);
        let mut baseline = Vec::with_capacity(self.config.flags.len());
        for spec in &self.config.flags {
            let name = spec.name.as_str();
            let current = self
                .retry
                .run("baseline read", |_| {
                    self.bounded("parameter-store", flags.read(name))
                })
                .await?;
            if current.as_deref() != Some(spec.safe_default.as_str()) {
                warn!(
                    "Flag '{}' is not at its safe default before the run (observed {:?})",
                    name, current
                );
            }
            baseline.push(FlagState {
                name: spec.name.clone(),
                current_value: current,
                expected_safe_default: spec.safe_default.clone(),
                test_value: spec.test_value.clone(),
                last_verified_at: Some(Utc::now()),
            });
        }
        ctx.push_evidence(
            &self.redactor,
            "flags-baseline.json",
            "Flag values read before any mutation",
            serde_json::to_value(&baseline)?,
        );
        ctx.run.flag_baseline = baseline;
        Ok(())
    }

    async fn mutate_flags(&self, ctx: &mut RunContext) -> Result<()> {
        for spec in &self.config.flags {
            if spec.test_value == spec.safe_default {
                debug!("Flag '{}' has no distinct test value; leaving it", spec.name);
                continue;
            }
            let state = ctx.flags.write(&spec.name, &spec.test_value).await?;
            ctx.mutated.push(state);
        }
        Ok(())
    }

    async fn verify(
        &self,
        ctx: &mut RunContext,
        check_id: &str,
        check_type: CheckType,
        pair: (Probe, Probe),
    ) {
        let required = self.config.is_required(check_id, check_type.as_str());
        let result = self
            .engine
            .verify(check_id, check_type, required, pair.0, pair.1)
            .await;
        if let Some(mismatch) = result.mismatch_error() {
            // Recorded now, weighed at report time.
            debug!("{}", mismatch);
        }
        for hook in &self.hooks {
            hook.after_check(&result);
        }
        ctx.run.checks.push(result);
    }

    async fn functional_check(&self, ctx: &mut RunContext) -> Result<()> {
        let target = &self.config.target;
        let pair = checks::health(&ctx.probes, &target.health_path, &target.probe_path);
        self.verify(ctx, "health", CheckType::Health, pair).await;

        for state in ctx.mutated.clone() {
            let expected = state.current_value.clone().unwrap_or(state.test_value.clone());
            let pair = checks::flag(&ctx.probes, &state.name, &self.config.flag_prefix, &expected);
            self.verify(ctx, &format!("flag:{}", state.name), CheckType::Flag, pair)
                .await;
        }

        if !target.command_path.is_empty() {
            let response = self
                .bounded("target", ctx.probes.traced_get(&target.command_path))
                .await
                .map_err(|e| e.to_string());
            let pair = checks::command(&ctx.probes, &target.command_path, response);
            self.verify(ctx, "command", CheckType::Command, pair).await;
        }

        let pair = checks::log(&ctx.probes);
        self.verify(ctx, "log", CheckType::Log, pair).await;
        Ok(())
    }

    async fn alert_path_check(&self, ctx: &mut RunContext) -> Result<()> {
        let mut alert = Alert::new(
            Severity::Warning,
            format!("stagecheck test alert for {}", self.config.environment),
        )
        .with_correlation(ctx.run.correlation_id.to_string());
        if let Some(trace_id) = ctx.run.trace_id {
            alert = alert.with_trace(trace_id.to_string());
        }
        let fingerprint = alert.fingerprint();
        let dispatched = self
            .dispatcher
            .dispatch(&self.config.alert_channel_id, &alert)
            .await
            .map_err(|e| e.to_string());
        ctx.test_alert = Some(fingerprint.clone());

        let pair = checks::alert(dispatched, Arc::clone(self.dispatcher.gate()), fingerprint);
        self.verify(ctx, "alert", CheckType::Alert, pair).await;
        Ok(())
    }

    /// Evidence gathering never fails the run; each miss is recorded instead.
    async fn collect_evidence(&self, ctx: &mut RunContext) -> Result<()> {
        let range = TimeRange::since(ctx.run.started_at);
        match self
            .bounded(
                "log-query",
                self.collaborators
                    .logs
                    .query(ctx.run.correlation_id.as_str(), range, EVIDENCE_LOG_LIMIT),
            )
            .await
        {
            Ok(entries) => ctx.push_evidence(
                &self.redactor,
                "logs.json",
                "Log entries tagged with the run's correlation id",
                serde_json::to_value(&entries)?,
            ),
            Err(e) => ctx.record_error(Stage::CollectEvidence, &e),
        }

        let traces: Vec<_> = ctx
            .probes
            .recorded_traces()
            .into_iter()
            .filter_map(|id| self.traces.get(id))
            .collect();
        ctx.push_evidence(
            &self.redactor,
            "traces.json",
            "Request traces recorded during the run",
            serde_json::to_value(&traces)?,
        );

        if !ctx.mutated.is_empty() {
            let mutated = serde_json::to_value(&ctx.mutated)?;
            ctx.push_evidence(
                &self.redactor,
                "flags-mutated.json",
                "Flag values verified after mutation",
                mutated,
            );
        }

        let gate = self.dispatcher.gate();
        let record = ctx.test_alert.as_ref().and_then(|fp| gate.record(fp));
        ctx.push_evidence(
            &self.redactor,
            "alert-gate.json",
            "Alert gate statistics and the test alert's dedup record",
            json!({ "stats": gate.stats(), "test_alert": record }),
        );
        Ok(())
    }

    async fn revert_flags(&self, ctx: &mut RunContext) {
        ctx.begin(Stage::RevertFlags);
        if let Err(e) = self.before_stage(Stage::RevertFlags, &ctx.run) {
            ctx.record_error(Stage::RevertFlags, &e);
        }

        let report = ctx.flags.revert_touched().await;
        ctx.run.flags_reverted = report.verified;
        if !report.verified {
            let failure = StagecheckError::RevertFailure(report.failed_names());
            ctx.record_error(Stage::RevertFlags, &failure);
        }
        if !report.flags.is_empty() {
            let after = ctx.flags.snapshot().await;
            match serde_json::to_value(&after) {
                Ok(content) => ctx.push_evidence(
                    &self.redactor,
                    "flags-after-revert.json",
                    "Flag values read back after the revert",
                    content,
                ),
                Err(e) => ctx.record_error(Stage::RevertFlags, &StagecheckError::from(e)),
            }
        }
        let outcome = if report.verified {
            StageOutcome::Completed
        } else {
            StageOutcome::Failed
        };
        ctx.run.revert = Some(report);
        ctx.finish(outcome);
    }

    fn decide_status(&self, ctx: &RunContext) -> RunStatus {
        let run = &ctx.run;
        if ctx.cancelled || ctx.halted_at == Some(Stage::PermissionCheck) {
            return RunStatus::Aborted;
        }
        let required_inconsistent = run.checks.iter().any(|c| c.required && !c.consistent);
        if ctx.halted_at.is_some()
            || run.has_fatal_error()
            || run.cleanup_failed()
            || run.failed_checks().next().is_some()
            || required_inconsistent
        {
            RunStatus::Failed
        } else {
            RunStatus::Passed
        }
    }

    async fn report(&self, ctx: &mut RunContext) {
        ctx.begin(Stage::Report);
        if let Err(e) = self.before_stage(Stage::Report, &ctx.run) {
            ctx.record_error(Stage::Report, &e);
        }

        let status = self.decide_status(ctx);
        ctx.run.status = status;

        if status == RunStatus::Failed || ctx.run.cleanup_failed() {
            self.notify_failure(ctx).await;
        }

        let stats = self.dispatcher.gate().stats();
        ctx.run.alerts_suppressed = stats.suppressed + stats.rate_limited;

        for stage in Stage::ALL {
            if stage != Stage::Report && !ctx.run.stages.iter().any(|r| r.stage == stage) {
                ctx.run.stages.push(StageRecord {
                    stage,
                    outcome: StageOutcome::Skipped,
                    started_at: None,
                    duration_ms: 0,
                });
            }
        }
        ctx.finish(StageOutcome::Completed);
        ctx.run.stages.sort_by_key(|r| r.stage);

        let error = match status {
            RunStatus::Passed => None,
            other => Some(format!("run {}", other)),
        };
        ctx.trace.complete(error.as_deref());
        ctx.run.finished_at = Some(Utc::now());
    }

    async fn notify_failure(&self, ctx: &mut RunContext) {
        let run = &ctx.run;
        let (severity, message) = if run.cleanup_failed() {
            (
                Severity::Critical,
                format!(
                    "stagecheck could not restore flags in {}: {}",
                    run.environment,
                    run.revert
                        .as_ref()
                        .map(|r| r.failed_names().join(", "))
                        .unwrap_or_default()
                ),
            )
        } else {
            (
                Severity::Error,
                format!(
                    "stagecheck validation failed in {}: {} failed check(s), {} error(s)",
                    run.environment,
                    run.failed_checks().count(),
                    run.errors.len()
                ),
            )
        };
        let mut alert = Alert::new(severity, message).with_correlation(run.correlation_id.to_string());
        if let Some(trace_id) = run.trace_id {
            alert = alert.with_trace(trace_id.to_string());
        }
        match self
            .dispatcher
            .dispatch(&self.config.alert_channel_id, &alert)
            .await
        {
            Ok(outcome) => debug!("Failure notification: {:?}", outcome),
            Err(e) => ctx.record_error(Stage::Report, &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::memory::{
        InMemoryChannel, InMemoryLogQuery, InMemoryParameterStore, InMemoryTarget,
    };
    use crate::collaborators::AccessLevel;
    use crate::config::FlagSpec;

    struct Fixture {
        store: Arc<InMemoryParameterStore>,
        channel: Arc<InMemoryChannel>,
        collaborators: Collaborators,
    }

    fn fixture(target_id: &str) -> Fixture {
        let store = Arc::new(InMemoryParameterStore::with_values([(
            "/staging/flags/new-checkout",
            "off",
        )]));
        let logs = Arc::new(InMemoryLogQuery::default());
        let channel = Arc::new(InMemoryChannel::default());
        let target = Arc::new(InMemoryTarget::healthy(target_id).with_log_sink(Arc::clone(&logs)));
        let collaborators = Collaborators {
            parameters: store.clone(),
            logs,
            channel: channel.clone(),
            ci: None,
            target,
        };
        Fixture {
            store,
            channel,
            collaborators,
        }
    }

    fn config() -> ValidationConfig {
        ValidationConfig {
            alert_channel_id: "staging-alerts".to_string(),
            flags: vec![FlagSpec {
                name: "/staging/flags/new-checkout".to_string(),
                safe_default: "off".to_string(),
                test_value: "on".to_string(),
            }],
            ..ValidationConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_run_passes_and_restores_flags() {
        let fx = fixture("https://app.staging.example.com");
        let orchestrator = Orchestrator::new(config(), fx.collaborators).unwrap();
        let run = orchestrator.run().await;

        assert_eq!(run.status, RunStatus::Passed, "{:#?}", run.errors);
        assert_eq!(run.exit_code(), 0);
        assert!(run.flags_reverted);
        assert_eq!(fx.store.value("/staging/flags/new-checkout").as_deref(), Some("off"));
        assert_eq!(run.stages.len(), Stage::ALL.len());
        assert!(run.checks.iter().all(|c| c.clean()));
        assert!(run.is_finished());
        assert_eq!(fx.channel.messages().len(), 1, "only the test alert is posted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_deadline_counts_from_run_start() {
        let fx = fixture("https://app.staging.example.com");
        let mut cfg = config();
        cfg.timeouts.run_deadline_secs = Some(600);
        let orchestrator = Orchestrator::new(cfg, fx.collaborators).unwrap();

        // Built long before it runs, e.g. by a scheduler.
        tokio::time::advance(Duration::from_secs(3600)).await;
        let run = orchestrator.run().await;

        assert_eq!(run.status, RunStatus::Passed, "{:#?}", run.errors);
        assert!(!run.errors.iter().any(|e| e.kind == "cancelled"));
        assert!(!orchestrator.cancel_signal().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_write_access_aborts_before_mutation() {
        let fx = fixture("https://app.staging.example.com");
        fx.store.set_access(AccessLevel {
            read: true,
            write: false,
        });
        let run = Orchestrator::new(config(), fx.collaborators).unwrap().run().await;

        assert_eq!(run.status, RunStatus::Aborted);
        assert!(fx.store.writes().is_empty());
        assert_eq!(run.errors[0].kind, "permission");
        assert!(run.checks.is_empty());
    }

    struct FailAt(Stage);

    impl RunHooks for FailAt {
        fn before_stage(&self, stage: Stage, _run: &ValidationRun) -> Result<()> {
            if stage == self.0 {
                return Err(StagecheckError::transport("hook", "injected"));
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_mutation_still_reverts() {
        let fx = fixture("https://app.staging.example.com");
        let run = Orchestrator::new(config(), fx.collaborators)
            .unwrap()
            .with_hook(Arc::new(FailAt(Stage::AlertPathCheck)))
            .run()
            .await;

        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.flags_reverted);
        assert_eq!(fx.store.value("/staging/flags/new-checkout").as_deref(), Some("off"));
        let skipped: Vec<_> = run
            .stages
            .iter()
            .filter(|r| r.outcome == StageOutcome::Skipped)
            .map(|r| r.stage)
            .collect();
        assert_eq!(skipped, vec![Stage::CollectEvidence]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_and_reverts() {
        let fx = fixture("https://app.staging.example.com");
        let orchestrator = Orchestrator::new(config(), fx.collaborators).unwrap();
        let cancel = orchestrator.cancel_signal();

        struct CancelAt(Stage, CancelSignal);
        impl RunHooks for CancelAt {
            fn before_stage(&self, stage: Stage, _run: &ValidationRun) -> Result<()> {
                if stage == self.0 {
                    self.1.cancel("operator abort");
                }
                Ok(())
            }
        }

        let run = orchestrator
            .with_hook(Arc::new(CancelAt(Stage::FunctionalCheck, cancel)))
            .run()
            .await;

        assert_eq!(run.status, RunStatus::Aborted);
        assert_eq!(run.exit_code(), 2);
        assert!(run.flags_reverted);
        assert!(run.errors.iter().any(|e| e.kind == "cancelled"));
        assert_eq!(fx.store.value("/staging/flags/new-checkout").as_deref(), Some("off"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_flag_is_reported_as_cleanup_failure() {
        let fx = fixture("https://app.staging.example.com");
        let orchestrator = Orchestrator::new(config(), fx.collaborators).unwrap();

        struct StickAfterWrite(Arc<InMemoryParameterStore>);
        impl RunHooks for StickAfterWrite {
            fn before_stage(&self, stage: Stage, _run: &ValidationRun) -> Result<()> {
                if stage == Stage::RevertFlags {
                    self.0.stick_key("/staging/flags/new-checkout");
                }
                Ok(())
            }
        }

        let run = orchestrator
            .with_hook(Arc::new(StickAfterWrite(fx.store.clone())))
            .run()
            .await;

        assert!(!run.flags_reverted);
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.exit_code(), 3);
        assert!(run.errors.iter().any(|e| e.kind == "revert_failure"));
        let posted = fx.channel.messages();
        assert!(posted.iter().any(|(_, text)| text.contains("could not restore flags")));
    }
}
