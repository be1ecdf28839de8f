// stagecheck-core/src/alerts/gate.rs
//! Deduplication and rate limiting in front of the notification channel.
//!
//! All decisions happen under one mutex so that concurrent callers with the
//! same fingerprint cannot both be told to deliver. The lock is never held
//! across the actual delivery.

use crate::alerts::fingerprint::AlertFingerprint;
use crate::config::{AlertConfig, DEFAULT_DEDUP_WINDOW_SECS};
use crate::governor::SlidingWindowGovernor;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub fingerprint: AlertFingerprint,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub suppressed_until: DateTime<Utc>,
    pub delivery_count: u64,
    pub suppressed_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Deliver,
    /// Same fingerprint already delivered inside the dedup window.
    Duplicate,
    /// Too many distinct alerts in the rate window.
    RateLimited,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStats {
    pub tracked: usize,
    pub delivered: u64,
    pub suppressed: u64,
    pub rate_limited: u64,
}

#[derive(Debug)]
struct Entry {
    record: AlertRecord,
    opened_at: Instant,
}

#[derive(Debug)]
struct GateState {
    records: HashMap<AlertFingerprint, Entry>,
    limiter: SlidingWindowGovernor,
    stats: GateStats,
    last_sweep: Option<Instant>,
}

#[derive(Debug)]
pub struct AlertGate {
    window: Duration,
    retention: Duration,
    state: Mutex<GateState>,
}

impl Default for AlertGate {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_DEDUP_WINDOW_SECS),
            &AlertConfig::default(),
        )
    }
}

impl AlertGate {
    pub fn new(dedup_window: Duration, config: &AlertConfig) -> Self {
        Self {
            window: dedup_window,
            retention: dedup_window.saturating_mul(config.retention_windows.max(1)),
            state: Mutex::new(GateState {
                records: HashMap::new(),
                limiter: SlidingWindowGovernor::new(
                    config.max_per_window,
                    Duration::from_secs(config.window_seconds),
                ),
                stats: GateStats::default(),
                last_sweep: None,
            }),
        }
    }

    pub fn dedup_window(&self) -> Duration {
        self.window
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True when the caller should deliver; registers or refreshes the record.
    pub fn should_deliver(&self, fingerprint: &AlertFingerprint) -> bool {
        self.evaluate(fingerprint) == GateDecision::Deliver
    }

    pub fn evaluate(&self, fingerprint: &AlertFingerprint) -> GateDecision {
        self.evaluate_at(fingerprint, Instant::now())
    }

    pub fn evaluate_at(&self, fingerprint: &AlertFingerprint, now: Instant) -> GateDecision {
        let wall = Utc::now();
        let mut guard = self.lock();
        let state = &mut *guard;
        self.sweep(state, now);

        if let Some(entry) = state.records.get_mut(fingerprint) {
            if now < entry.opened_at + self.window {
                entry.record.last_seen_at = wall;
                entry.record.suppressed_count += 1;
                state.stats.suppressed += 1;
                debug!("Suppressing duplicate alert {}", fingerprint.short());
                return GateDecision::Duplicate;
            }
        }

        if !state.limiter.allow_action_at(now) {
            state.stats.rate_limited += 1;
            debug!("Rate limit reached; dropping alert {}", fingerprint.short());
            return GateDecision::RateLimited;
        }

        let suppressed_until = chrono::Duration::from_std(self.window)
            .ok()
            .and_then(|d| wall.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let previous = state.records.get(fingerprint).map(|e| &e.record);
        let record = AlertRecord {
            fingerprint: fingerprint.clone(),
            first_seen_at: wall,
            last_seen_at: wall,
            suppressed_until,
            delivery_count: previous.map_or(0, |r| r.delivery_count) + 1,
            suppressed_count: previous.map_or(0, |r| r.suppressed_count),
        };
        state.records.insert(
            fingerprint.clone(),
            Entry {
                record,
                opened_at: now,
            },
        );
        state.stats.delivered += 1;
        GateDecision::Deliver
    }

    /// Forgets a fingerprint whose delivery failed so a retry can go through,
    /// and hands its rate-limit slot back.
    pub fn release(&self, fingerprint: &AlertFingerprint) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(entry) = state.records.remove(fingerprint) {
            state.stats.delivered = state.stats.delivered.saturating_sub(1);
            state.limiter.refund(entry.opened_at);
        }
    }

    pub fn record(&self, fingerprint: &AlertFingerprint) -> Option<AlertRecord> {
        self.lock().records.get(fingerprint).map(|e| e.record.clone())
    }

    pub fn stats(&self) -> GateStats {
        let state = self.lock();
        GateStats {
            tracked: state.records.len(),
            ..state.stats
        }
    }

    /// Drops records older than the retention period, at most once per window.
    fn sweep(&self, state: &mut GateState, now: Instant) {
        if state
            .last_sweep
            .is_some_and(|last| now.duration_since(last) < self.window)
        {
            return;
        }
        state.last_sweep = Some(now);
        let retention = self.retention;
        let before = state.records.len();
        state
            .records
            .retain(|_, e| now.duration_since(e.opened_at) < retention);
        let dropped = before - state.records.len();
        if dropped > 0 {
            debug!("Garbage-collected {} expired alert record(s)", dropped);
        }
    }
}
