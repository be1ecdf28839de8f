// stagecheck-core/src/orchestrator/checks.rs
//! Probe pairs for each check type.
//!
//! Each pair answers one question through two unrelated paths, e.g. the full
//! health endpoint against a liveness path, or a direct key read against a
//! prefix listing. Probes are read-only; side-effecting actions (sending the
//! test alert, invoking the command) happen once before the pair is built.

use crate::alerts::{AlertFingerprint, AlertGate, DispatchOutcome};
use crate::collaborators::{LogQuery, ParameterStore, TargetClient, TargetResponse, TimeRange};
use crate::double_check::{Probe, ProbeReport};
use crate::errors::{Result, StagecheckError};
use crate::traces::{StepStatus, TraceStore};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// User id attached to every trace the engine records.
pub const RUN_USER: &str = "stagecheck";

const LOG_QUERY_LIMIT: usize = 200;

/// Shared handles every probe needs; cheap to clone into `'static` closures.
#[derive(Clone)]
pub(crate) struct ProbeContext {
    pub target: Arc<dyn TargetClient>,
    pub parameters: Arc<dyn ParameterStore>,
    pub logs: Arc<dyn LogQuery>,
    pub traces: TraceStore,
    pub correlation_id: String,
    pub started_at: DateTime<Utc>,
    pub trace_ids: Arc<Mutex<Vec<Uuid>>>,
}

impl ProbeContext {
    pub fn recorded_traces(&self) -> Vec<Uuid> {
        self.trace_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// GET against the target, recorded as a trace. 5xx answers and transport
    /// failures mark the trace as errored.
    pub async fn traced_get(&self, path: &str) -> Result<TargetResponse> {
        let handle = self.traces.create_trace(&format!("GET {}", path), Some(RUN_USER));
        self.trace_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle.trace_id());

        match self.target.get(path, &self.correlation_id).await {
            Ok(resp) => {
                let status = if resp.is_success() {
                    StepStatus::Ok
                } else {
                    StepStatus::Failed
                };
                handle.append_step(&format!("response {}", resp.status), status);
                if resp.status >= 500 {
                    handle.complete(Some(&format!("server error {}", resp.status)));
                } else {
                    handle.complete(None);
                }
                Ok(resp)
            }
            Err(e) => {
                handle.append_step("request", StepStatus::Failed);
                handle.complete(Some(&e.to_string()));
                Err(e)
            }
        }
    }

    fn range(&self) -> TimeRange {
        TimeRange::since(self.started_at)
    }
}

fn health_body_ok(body: &str) -> std::result::Result<(), String> {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(json) => match json.get("status").and_then(|s| s.as_str()) {
            Some(s) if ["ok", "healthy", "pass", "up"].contains(&s.to_ascii_lowercase().as_str()) => Ok(()),
            Some(s) => Err(format!("reported status '{}'", s)),
            None => Ok(()),
        },
        Err(_) => Ok(()),
    }
}

/// Full health request against a lightweight liveness path.
pub(crate) fn health(ctx: &ProbeContext, health_path: &str, probe_path: &str) -> (Probe, Probe) {
    let primary = {
        let ctx = ctx.clone();
        let path = health_path.to_string();
        Probe::new(format!("GET {}", health_path), move || {
            let ctx = ctx.clone();
            let path = path.clone();
            async move {
                let resp = ctx.traced_get(&path).await?;
                if !resp.is_success() {
                    return Ok(ProbeReport::fail(format!("GET {} -> {}", path, resp.status)));
                }
                Ok(match health_body_ok(&resp.body) {
                    Ok(()) => ProbeReport::pass(format!(
                        "GET {} -> {} in {} ms",
                        path, resp.status, resp.latency_ms
                    )),
                    Err(why) => ProbeReport::fail(format!("GET {} -> {} but {}", path, resp.status, why)),
                })
            }
        })
    };
    let secondary = {
        let ctx = ctx.clone();
        let path = probe_path.to_string();
        Probe::new(format!("GET {}", probe_path), move || {
            let ctx = ctx.clone();
            let path = path.clone();
            async move {
                let resp = ctx.traced_get(&path).await?;
                Ok(ProbeReport::from_bool(
                    resp.is_success(),
                    format!("GET {} -> {} in {} ms", path, resp.status, resp.latency_ms),
                ))
            }
        })
    };
    (primary, secondary)
}

/// Direct key read against the prefix listing, both expecting `expected`.
pub(crate) fn flag(ctx: &ProbeContext, name: &str, prefix: &str, expected: &str) -> (Probe, Probe) {
    let primary = {
        let store = Arc::clone(&ctx.parameters);
        let name = name.to_string();
        let expected = expected.to_string();
        Probe::new("direct key read", move || {
            let store = Arc::clone(&store);
            let name = name.clone();
            let expected = expected.clone();
            async move {
                let observed = store.get(&name).await?;
                Ok(ProbeReport::from_bool(
                    observed.as_deref() == Some(expected.as_str()),
                    format!("'{}' = {:?}, expected '{}'", name, observed, expected),
                ))
            }
        })
    };
    let secondary = {
        let store = Arc::clone(&ctx.parameters);
        let name = name.to_string();
        let prefix = prefix.to_string();
        let expected = expected.to_string();
        Probe::new("prefix listing", move || {
            let store = Arc::clone(&store);
            let name = name.clone();
            let prefix = prefix.clone();
            let expected = expected.clone();
            async move {
                let listed = store.list_by_prefix(&prefix).await?;
                let observed = listed.into_iter().find(|(k, _)| *k == name).map(|(_, v)| v);
                Ok(ProbeReport::from_bool(
                    observed.as_deref() == Some(expected.as_str()),
                    format!("listing under '{}' shows {:?}", prefix, observed),
                ))
            }
        })
    };
    (primary, secondary)
}

/// The command's own response against the trail it left in the logs.
pub(crate) fn command(
    ctx: &ProbeContext,
    path: &str,
    response: std::result::Result<TargetResponse, String>,
) -> (Probe, Probe) {
    let primary = {
        let path = path.to_string();
        Probe::new(format!("GET {} response", path), move || {
            let path = path.clone();
            let response = response.clone();
            async move {
                match response {
                    Ok(resp) => Ok(ProbeReport::from_bool(
                        resp.is_success(),
                        format!("GET {} -> {}", path, resp.status),
                    )),
                    Err(e) => Err(StagecheckError::transport("target", e)),
                }
            }
        })
    };
    let secondary = {
        let ctx = ctx.clone();
        let path = path.to_string();
        Probe::new("log query", move || {
            let ctx = ctx.clone();
            let path = path.clone();
            async move {
                let entries = ctx
                    .logs
                    .query(&ctx.correlation_id, ctx.range(), LOG_QUERY_LIMIT)
                    .await?;
                let hits = entries.iter().filter(|e| e.message.contains(&path)).count();
                Ok(ProbeReport::from_bool(
                    hits > 0,
                    format!("{} log entr(ies) for {} tagged with the correlation id", hits, path),
                ))
            }
        })
    };
    (primary, secondary)
}

/// Server-side error logs against client-side traces, both expecting no errors.
pub(crate) fn log(ctx: &ProbeContext) -> (Probe, Probe) {
    let primary = {
        let ctx = ctx.clone();
        Probe::new("error-level log query", move || {
            let ctx = ctx.clone();
            async move {
                let filter = format!("level:ERROR {}", ctx.correlation_id);
                let errors = ctx.logs.query(&filter, ctx.range(), LOG_QUERY_LIMIT).await?;
                Ok(ProbeReport::from_bool(
                    errors.is_empty(),
                    format!("{} error-level entr(ies) during the run", errors.len()),
                ))
            }
        })
    };
    let secondary = {
        let ctx = ctx.clone();
        Probe::new("run traces", move || {
            let ctx = ctx.clone();
            async move {
                let ids = ctx.recorded_traces();
                let errored: Vec<String> = ids
                    .iter()
                    .filter_map(|id| ctx.traces.get(*id))
                    .filter(|t| t.error.is_some())
                    .map(|t| t.command_name)
                    .collect();
                Ok(ProbeReport::from_bool(
                    errored.is_empty(),
                    if errored.is_empty() {
                        format!("{} trace(s) recorded, none errored", ids.len())
                    } else {
                        format!("errored traces: {}", errored.join(", "))
                    },
                ))
            }
        })
    };
    (primary, secondary)
}

/// The channel's answer to the test alert against the gate's dedup record.
pub(crate) fn alert(
    dispatched: std::result::Result<DispatchOutcome, String>,
    gate: Arc<AlertGate>,
    fingerprint: AlertFingerprint,
) -> (Probe, Probe) {
    let primary = Probe::new("channel response", move || {
        let dispatched = dispatched.clone();
        async move {
            match dispatched {
                Ok(outcome) => Ok(ProbeReport::from_bool(
                    outcome.passed_gate(),
                    match &outcome {
                        DispatchOutcome::Delivered { message_id, .. } => {
                            format!("delivered as message {}", message_id)
                        }
                        DispatchOutcome::DryRun { .. } => "accepted (dry run, not posted)".to_string(),
                        DispatchOutcome::Suppressed { .. } => "suppressed as duplicate".to_string(),
                        DispatchOutcome::RateLimited { .. } => "dropped by rate limiter".to_string(),
                    },
                )),
                Err(e) => Err(StagecheckError::transport("notification-channel", e)),
            }
        }
    });
    let secondary = Probe::new("gate dedup record", move || {
        let gate = Arc::clone(&gate);
        let fingerprint = fingerprint.clone();
        async move {
            Ok(match gate.record(&fingerprint) {
                Some(r) if r.delivery_count > 0 && r.suppressed_until > Utc::now() => {
                    ProbeReport::pass(format!(
                        "record {} registered, duplicates suppressed until {}",
                        fingerprint.short(),
                        r.suppressed_until.to_rfc3339()
                    ))
                }
                Some(r) => ProbeReport::fail(format!(
                    "record {} present but window closed at {}",
                    fingerprint.short(),
                    r.suppressed_until.to_rfc3339()
                )),
                None => ProbeReport::fail(format!("no dedup record for {}", fingerprint.short())),
            })
        }
    });
    (primary, secondary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_body_rules() {
        assert!(health_body_ok(r#"{"status":"OK"}"#).is_ok());
        assert!(health_body_ok(r#"{"uptime":12}"#).is_ok());
        assert!(health_body_ok("plain text").is_ok());
        assert_eq!(
            health_body_ok(r#"{"status":"degraded"}"#).unwrap_err(),
            "reported status 'degraded'"
        );
    }
}
