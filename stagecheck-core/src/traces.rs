//! traces.rs - Bounded store of command execution traces.
//!
//! A trace is created when a command starts, receives steps while it runs and
//! is inserted into a global ring and a per-user ring when it completes.
//! Eviction of the oldest entry is the only way a trace leaves the store.
//!
//! Locking: each live trace has its own mutex, the rings share one store
//! mutex. Neither is ever held across an await point. Every read returns a
//! redacted copy.
//!
//! License: MIT OR APACHE 2.0

use crate::config::TraceConfig;
use crate::redaction::Redactor;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use uuid::Uuid;

/// Errors longer than this are cut at a char boundary before storage.
const MAX_ERROR_CHARS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceStep {
    pub label: String,
    pub duration_ms: u64,
    pub status: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: Uuid,
    pub command_name: String,
    pub user_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: Vec<TraceStep>,
    pub error: Option<String>,
    /// Number of steps dropped to respect the payload limit.
    #[serde(default)]
    pub truncated_steps: usize,
}

impl Trace {
    fn new(command_name: &str, user_id: Option<&str>) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            command_name: command_name.to_string(),
            user_id: user_id.map(str::to_string),
            started_at: Utc::now(),
            completed_at: None,
            steps: Vec::new(),
            error: None,
            truncated_steps: 0,
        }
    }

    pub fn is_errored(&self) -> bool {
        self.error.is_some() || self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    fn wire_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }

    /// Drops whole steps, oldest successful ones first, until the serialized
    /// trace fits in `limit` bytes.
    fn fit_to(&mut self, limit: usize) {
        while self.wire_size() > limit && !self.steps.is_empty() {
            let victim = self
                .steps
                .iter()
                .position(|s| s.status == StepStatus::Ok)
                .unwrap_or(0);
            self.steps.remove(victim);
            self.truncated_steps += 1;
        }
        if self.wire_size() > limit {
            warn!(
                "Trace {} still exceeds {} bytes with no steps left",
                self.trace_id, limit
            );
        }
    }

    fn redacted(&self, redactor: &Redactor) -> Trace {
        Trace {
            command_name: redactor.redact_text(&self.command_name),
            user_id: self.user_id.as_deref().map(|u| redactor.redact_text(u)),
            steps: self
                .steps
                .iter()
                .map(|s| TraceStep {
                    label: redactor.redact_text(&s.label),
                    ..s.clone()
                })
                .collect(),
            error: self.error.as_deref().map(|e| redactor.redact_text(e)),
            ..self.clone()
        }
    }
}

#[derive(Debug, Default)]
struct Rings {
    global: VecDeque<Arc<Trace>>,
    per_user: HashMap<String, VecDeque<Arc<Trace>>>,
    /// Users ordered by their latest completed trace, oldest first.
    user_order: VecDeque<String>,
}

#[derive(Debug)]
struct Shared {
    rings: Mutex<Rings>,
    per_user_capacity: usize,
    global_capacity: usize,
    payload_limit: usize,
    redactor: Arc<Redactor>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn insert(&self, trace: Trace) {
        let trace = Arc::new(trace);
        let mut rings = lock(&self.rings);

        rings.global.push_back(Arc::clone(&trace));
        while rings.global.len() > self.global_capacity {
            rings.global.pop_front();
        }

        if let Some(user) = &trace.user_id {
            let ring = rings.per_user.entry(user.clone()).or_default();
            ring.push_back(Arc::clone(&trace));
            while ring.len() > self.per_user_capacity {
                ring.pop_front();
            }

            if let Some(pos) = rings.user_order.iter().position(|u| u == user) {
                rings.user_order.remove(pos);
            }
            rings.user_order.push_back(user.clone());
            // At most `global_capacity` users are tracked; the least recently
            // active user's ring goes first.
            while rings.user_order.len() > self.global_capacity {
                if let Some(stale) = rings.user_order.pop_front() {
                    rings.per_user.remove(&stale);
                    debug!("Evicted per-user trace ring for '{}'", stale);
                }
            }
        }
    }
}

/// Process-wide trace store. Cloning shares the same rings.
#[derive(Debug, Clone)]
pub struct TraceStore {
    shared: Arc<Shared>,
}

impl TraceStore {
    pub fn new(config: &TraceConfig, redactor: Arc<Redactor>) -> Self {
        Self {
            shared: Arc::new(Shared {
                rings: Mutex::new(Rings::default()),
                per_user_capacity: config.per_user_capacity.max(1),
                global_capacity: config.global_capacity.max(1),
                payload_limit: config.payload_limit_bytes,
                redactor,
            }),
        }
    }

    pub fn create_trace(&self, command_name: &str, user_id: Option<&str>) -> TraceHandle {
        let trace = Trace::new(command_name, user_id);
        debug!("Trace {} started for '{}'", trace.trace_id, command_name);
        TraceHandle {
            live: Arc::new(Mutex::new(LiveTrace {
                trace,
                last_mark: Instant::now(),
                completed: false,
            })),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Most recent completed trace, for one user or across all users.
    pub fn get_last(&self, user_id: Option<&str>) -> Option<Trace> {
        let latest = {
            let rings = lock(&self.shared.rings);
            match user_id {
                Some(user) => rings.per_user.get(user).and_then(|r| r.back().cloned()),
                None => rings.global.back().cloned(),
            }
        };
        latest.map(|t| t.redacted(&self.shared.redactor))
    }

    pub fn get(&self, trace_id: Uuid) -> Option<Trace> {
        let found = {
            let rings = lock(&self.shared.rings);
            rings
                .global
                .iter()
                .rev()
                .chain(rings.per_user.values().flat_map(|r| r.iter().rev()))
                .find(|t| t.trace_id == trace_id)
                .cloned()
        };
        found.map(|t| t.redacted(&self.shared.redactor))
    }

    /// Up to `limit` most recent traces, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Trace> {
        let snapshot: Vec<Arc<Trace>> = {
            let rings = lock(&self.shared.rings);
            rings.global.iter().rev().take(limit).cloned().collect()
        };
        snapshot
            .iter()
            .map(|t| t.redacted(&self.shared.redactor))
            .collect()
    }

    /// Number of users that currently have a per-user ring.
    pub fn tracked_users(&self) -> usize {
        lock(&self.shared.rings).per_user.len()
    }

    pub fn user_count(&self, user_id: &str) -> usize {
        lock(&self.shared.rings)
            .per_user
            .get(user_id)
            .map_or(0, VecDeque::len)
    }
}

#[derive(Debug)]
struct LiveTrace {
    trace: Trace,
    last_mark: Instant,
    completed: bool,
}

/// Handle to a trace that is still being recorded. Clones append to the same trace.
#[derive(Debug, Clone)]
pub struct TraceHandle {
    live: Arc<Mutex<LiveTrace>>,
    shared: Arc<Shared>,
}

impl TraceHandle {
    pub fn trace_id(&self) -> Uuid {
        lock(&self.live).trace.trace_id
    }

    /// Appends a step whose duration is the time since the previous step.
    pub fn append_step(&self, label: &str, status: StepStatus) {
        let mut live = lock(&self.live);
        if live.completed {
            warn!(
                "Ignoring step '{}' for completed trace {}",
                label, live.trace.trace_id
            );
            return;
        }
        let now = Instant::now();
        let duration_ms = now.duration_since(live.last_mark).as_millis() as u64;
        live.last_mark = now;
        live.trace.steps.push(TraceStep {
            label: label.to_string(),
            duration_ms,
            status,
        });
    }

    /// Marks the trace finished and publishes it to the store. Later calls are no-ops.
    pub fn complete(&self, error: Option<&str>) {
        let finished = {
            let mut live = lock(&self.live);
            if live.completed {
                return;
            }
            live.completed = true;
            live.trace.completed_at = Some(Utc::now());
            live.trace.error = error.map(|e| {
                let redacted = self.shared.redactor.redact_text(e);
                truncate_chars(&redacted, MAX_ERROR_CHARS)
            });
            let mut trace = live.trace.clone();
            trace.fit_to(self.shared.payload_limit);
            trace
        };
        debug!(
            "Trace {} completed ({} steps, errored: {})",
            finished.trace_id,
            finished.steps.len(),
            finished.is_errored()
        );
        self.shared.insert(finished);
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
