// stagecheck-core/src/double_check/engine.rs
//! Runs two independent verification methods for one assertion and compares
//! their pass/fail outcomes.
//!
//! Safety rails:
//! 1. Probes run as separate tasks, each bounded by the probe timeout.
//! 2. A timeout counts as `fail`, a panic or collaborator error as `error`.
//! 3. On disagreement exactly one remediation is attempted, gated by a
//!    sliding-window governor. It never changes `consistent`.

use crate::config::{RemediationConfig, ValidationConfig};
use crate::double_check::types::{CheckResult, CheckType, Probe, ProbeOutcome, Verdict};
use crate::governor::SlidingWindowGovernor;
use crate::redaction::Redactor;
use log::{info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Duration;

/// Aborts the probe task if the check itself is dropped mid-flight.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

/// The single safe action taken when the two methods disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Remediation {
    /// Both probes are read-only: wait, then run both again.
    RerunBoth,
    /// The primary has a side effect (e.g. posts an alert): wait, then
    /// re-run only the read-only secondary.
    RerunSecondary,
}

impl Remediation {
    fn for_check(check_type: CheckType) -> Self {
        match check_type {
            CheckType::Alert => Remediation::RerunSecondary,
            CheckType::Health | CheckType::Flag | CheckType::Command | CheckType::Log => {
                Remediation::RerunBoth
            }
        }
    }
}

pub struct DoubleCheckEngine {
    probe_timeout: Duration,
    remediation_delay: Duration,
    governor: Mutex<SlidingWindowGovernor>,
    redactor: Arc<Redactor>,
}

impl DoubleCheckEngine {
    pub fn new(
        probe_timeout: Duration,
        remediation: &RemediationConfig,
        redactor: Arc<Redactor>,
    ) -> Self {
        Self {
            probe_timeout,
            remediation_delay: Duration::from_millis(remediation.delay_ms),
            governor: Mutex::new(SlidingWindowGovernor::new(
                remediation.max_per_minute,
                Duration::from_secs(60),
            )),
            redactor,
        }
    }

    pub fn from_config(config: &ValidationConfig, redactor: Arc<Redactor>) -> Self {
        Self::new(config.probe_timeout(), &config.remediation, redactor)
    }

    fn allow_remediation(&self) -> bool {
        self.governor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allow_action()
    }

    pub async fn verify(
        &self,
        check_id: &str,
        check_type: CheckType,
        required: bool,
        primary: Probe,
        secondary: Probe,
    ) -> CheckResult {
        let started = Instant::now();
        let (primary_outcome, secondary_outcome) = self.run_pair(&primary, &secondary).await;
        let consistent = primary_outcome.verdict.is_pass() == secondary_outcome.verdict.is_pass();

        let mut result = CheckResult {
            check_id: check_id.to_string(),
            check_type,
            required,
            primary_outcome,
            secondary_outcome,
            consistent,
            discrepancy_note: None,
            remediation_attempted: false,
            remediation_outcome: None,
            duration_ms: 0,
        };

        if !consistent {
            let note = discrepancy_note(&primary, &secondary, &result);
            warn!("Check '{}' is inconsistent: {}", check_id, note);
            result.discrepancy_note = Some(self.redactor.redact_text(&note));

            if self.allow_remediation() {
                result.remediation_attempted = true;
                let outcome = self
                    .remediate(Remediation::for_check(check_type), &primary, &secondary, &result)
                    .await;
                result.remediation_outcome = Some(self.redactor.redact_text(&outcome));
            } else {
                warn!("Remediation for '{}' throttled by the governor", check_id);
                result.remediation_outcome =
                    Some("throttled: remediation limit reached, no action taken".to_string());
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Check '{}' ({}): primary={} secondary={} consistent={}",
            check_id,
            check_type,
            result.primary_outcome.verdict,
            result.secondary_outcome.verdict,
            result.consistent
        );
        result
    }

    async fn run_pair(&self, primary: &Probe, secondary: &Probe) -> (ProbeOutcome, ProbeOutcome) {
        let p = self.spawn(primary);
        let s = self.spawn(secondary);
        let (p, s) = tokio::join!(p, s);
        (self.settle(p), self.settle(s))
    }

    async fn run_one(&self, probe: &Probe) -> ProbeOutcome {
        let handle = self.spawn(probe);
        self.settle(handle.await)
    }

    fn spawn(&self, probe: &Probe) -> AbortOnDrop<ProbeOutcome> {
        let probe = probe.clone();
        let timeout = self.probe_timeout;
        let redactor = Arc::clone(&self.redactor);
        // Building the future runs caller code too, so it happens inside the
        // task where a panic is caught by the join.
        AbortOnDrop(tokio::spawn(async move {
            let started = Instant::now();
            let (verdict, detail) = match tokio::time::timeout(timeout, probe.start()).await {
                Ok(Ok(report)) if report.passed => (Verdict::Pass, report.detail),
                Ok(Ok(report)) => (Verdict::Fail, report.detail),
                Ok(Err(e)) => (Verdict::Error, e.to_string()),
                Err(_) => (
                    Verdict::Fail,
                    format!("timed out after {} ms", timeout.as_millis()),
                ),
            };
            ProbeOutcome {
                verdict,
                detail: redactor.redact_text(&detail),
                duration_ms: started.elapsed().as_millis() as u64,
            }
        }))
    }

    fn settle(&self, joined: Result<ProbeOutcome, JoinError>) -> ProbeOutcome {
        match joined {
            Ok(outcome) => outcome,
            Err(e) => ProbeOutcome {
                verdict: Verdict::Error,
                detail: if e.is_panic() {
                    "probe panicked".to_string()
                } else {
                    "probe was cancelled".to_string()
                },
                duration_ms: 0,
            },
        }
    }

    async fn remediate(
        &self,
        action: Remediation,
        primary: &Probe,
        secondary: &Probe,
        first: &CheckResult,
    ) -> String {
        tokio::time::sleep(self.remediation_delay).await;
        let delay_ms = self.remediation_delay.as_millis();
        match action {
            Remediation::RerunBoth => {
                let (p, s) = self.run_pair(primary, secondary).await;
                let agree = p.verdict.is_pass() == s.verdict.is_pass();
                format!(
                    "re-ran both probes after {} ms: primary={}, secondary={}; {}",
                    delay_ms,
                    p.verdict,
                    s.verdict,
                    if agree { "outcomes now agree" } else { "outcomes still disagree" }
                )
            }
            Remediation::RerunSecondary => {
                let s = self.run_one(secondary).await;
                let agree = first.primary_outcome.verdict.is_pass() == s.verdict.is_pass();
                format!(
                    "re-ran secondary probe after {} ms: secondary={}; {}",
                    delay_ms,
                    s.verdict,
                    if agree { "outcomes now agree" } else { "outcomes still disagree" }
                )
            }
        }
    }
}

fn discrepancy_note(primary: &Probe, secondary: &Probe, result: &CheckResult) -> String {
    let p = ("primary", primary.label(), &result.primary_outcome);
    let s = ("secondary", secondary.label(), &result.secondary_outcome);
    let (good, bad) = if result.primary_outcome.verdict.is_pass() { (p, s) } else { (s, p) };
    format!(
        "{} ({}) passed but {} ({}) returned {}: {} [passing side reported: {}]",
        good.0, good.1, bad.0, bad.1, bad.2.verdict, bad.2.detail, good.2.detail
    )
}
