//! In-process collaborators.
//!
//! These back dry runs when no endpoint is configured and give tests full
//! control over propagation lag, outages and recorded calls.

use super::{
    AccessLevel, CiRun, CiState, CiStatus, LogEntry, LogQuery, NotificationChannel,
    ParameterStore, TargetClient, TargetResponse, TimeRange,
};
use crate::errors::{Result, StagecheckError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Pending {
    value: String,
    stale_reads_left: u32,
}

/// Key-value store with optional propagation lag and per-key fault injection.
#[derive(Debug)]
pub struct InMemoryParameterStore {
    values: Mutex<BTreeMap<String, String>>,
    pending: Mutex<HashMap<String, Pending>>,
    writes: Mutex<Vec<(String, String)>>,
    access: Mutex<AccessLevel>,
    failing_keys: Mutex<HashSet<String>>,
    stuck_keys: Mutex<HashSet<String>>,
    propagation_lag: AtomicU32,
}

impl Default for InMemoryParameterStore {
    fn default() -> Self {
        Self {
            values: Mutex::new(BTreeMap::new()),
            pending: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            access: Mutex::new(AccessLevel {
                read: true,
                write: true,
            }),
            failing_keys: Mutex::new(HashSet::new()),
            stuck_keys: Mutex::new(HashSet::new()),
            propagation_lag: AtomicU32::new(0),
        }
    }
}

impl InMemoryParameterStore {
    pub fn with_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::default();
        lock(&store.values).extend(values.into_iter().map(|(k, v)| (k.into(), v.into())));
        store
    }

    /// Each write stays invisible for the next `reads` reads of that key.
    pub fn set_propagation_lag(&self, reads: u32) {
        self.propagation_lag.store(reads, Ordering::SeqCst);
    }

    pub fn set_access(&self, access: AccessLevel) {
        *lock(&self.access) = access;
    }

    /// Every call touching `key` fails with a transport error.
    pub fn fail_key(&self, key: &str) {
        lock(&self.failing_keys).insert(key.to_string());
    }

    pub fn heal_key(&self, key: &str) {
        lock(&self.failing_keys).remove(key);
    }

    /// Writes to `key` are acknowledged but never take effect.
    pub fn stick_key(&self, key: &str) {
        lock(&self.stuck_keys).insert(key.to_string());
    }

    /// Every `set` call received, in order, including failed ones.
    pub fn writes(&self) -> Vec<(String, String)> {
        lock(&self.writes).clone()
    }

    /// Current value ignoring propagation lag.
    pub fn value(&self, key: &str) -> Option<String> {
        if let Some(p) = lock(&self.pending).get(key) {
            return Some(p.value.clone());
        }
        lock(&self.values).get(key).cloned()
    }

    fn check_key(&self, key: &str) -> Result<()> {
        if lock(&self.failing_keys).contains(key) {
            return Err(StagecheckError::transport(
                "parameter-store",
                format!("injected failure for '{}'", key),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ParameterStore for InMemoryParameterStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_key(key)?;
        let mut pending = lock(&self.pending);
        if let Some(p) = pending.get_mut(key) {
            if p.stale_reads_left > 0 {
                p.stale_reads_left -= 1;
                return Ok(lock(&self.values).get(key).cloned());
            }
        }
        if let Some(p) = pending.remove(key) {
            lock(&self.values).insert(key.to_string(), p.value);
        }
        Ok(lock(&self.values).get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.writes).push((key.to_string(), value.to_string()));
        self.check_key(key)?;
        if lock(&self.stuck_keys).contains(key) {
            return Ok(());
        }
        let lag = self.propagation_lag.load(Ordering::SeqCst);
        if lag == 0 {
            lock(&self.pending).remove(key);
            lock(&self.values).insert(key.to_string(), value.to_string());
        } else {
            lock(&self.pending).insert(
                key.to_string(),
                Pending {
                    value: value.to_string(),
                    stale_reads_left: lag,
                },
            );
        }
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let keys: Vec<String> = lock(&self.values)
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(&key).await? {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    async fn access(&self, _prefix: &str) -> Result<AccessLevel> {
        Ok(*lock(&self.access))
    }
}

/// Log sink and query service in one.
#[derive(Debug, Default)]
pub struct InMemoryLogQuery {
    entries: Mutex<Vec<LogEntry>>,
    queries: AtomicU64,
}

impl InMemoryLogQuery {
    pub fn push(&self, level: &str, message: impl Into<String>) {
        lock(&self.entries).push(LogEntry {
            timestamp: Utc::now(),
            level: level.to_string(),
            message: message.into(),
        });
    }

    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogQuery for InMemoryLogQuery {
    /// `filter` is a case-insensitive substring; `level:<LEVEL>` prefixes
    /// restrict the level as well.
    async fn query(&self, filter: &str, range: TimeRange, limit: usize) -> Result<Vec<LogEntry>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let (level, needle) = match filter.strip_prefix("level:") {
            Some(rest) => {
                let (lvl, text) = rest.split_once(' ').unwrap_or((rest, ""));
                (Some(lvl.to_ascii_uppercase()), text.to_lowercase())
            }
            None => (None, filter.to_lowercase()),
        };
        Ok(lock(&self.entries)
            .iter()
            .filter(|e| range.contains(e.timestamp))
            .filter(|e| level.as_deref().is_none_or(|l| e.level.eq_ignore_ascii_case(l)))
            .filter(|e| e.message.to_lowercase().contains(&needle))
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Records posted messages; can be told to fail the next N posts.
#[derive(Debug, Default)]
pub struct InMemoryChannel {
    messages: Mutex<Vec<(String, String)>>,
    fail_next: AtomicU32,
    next_id: AtomicU64,
}

impl InMemoryChannel {
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        lock(&self.messages).clone()
    }
}

#[async_trait]
impl NotificationChannel for InMemoryChannel {
    async fn post_message(&self, channel_id: &str, text: &str) -> Result<String> {
        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(StagecheckError::transport("notification-channel", "injected post failure"));
        }
        lock(&self.messages).push((channel_id.to_string(), text.to_string()));
        Ok(format!("msg-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCiStatus {
    runs: Mutex<HashMap<String, CiRun>>,
}

impl InMemoryCiStatus {
    pub fn set_run(&self, git_ref: &str, status: CiState, url: &str) {
        lock(&self.runs).insert(
            git_ref.to_string(),
            CiRun {
                status,
                url: url.to_string(),
            },
        );
    }
}

#[async_trait]
impl CiStatus for InMemoryCiStatus {
    async fn latest_run(&self, git_ref: &str) -> Result<CiRun> {
        Ok(lock(&self.runs).get(git_ref).cloned().unwrap_or(CiRun {
            status: CiState::Unknown,
            url: String::new(),
        }))
    }
}

/// A scripted deployment: fixed responses per path, optionally echoing
/// each request into a log sink the way a real service would.
#[derive(Debug)]
pub struct InMemoryTarget {
    identifier: String,
    routes: Mutex<HashMap<String, TargetResponse>>,
    calls: Mutex<Vec<String>>,
    log_sink: Option<Arc<InMemoryLogQuery>>,
}

impl InMemoryTarget {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            routes: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            log_sink: None,
        }
    }

    /// A target answering the default health, probe and command paths with success.
    pub fn healthy(identifier: impl Into<String>) -> Self {
        let target = Self::new(identifier);
        target.route("/health", 200, r#"{"status":"ok"}"#);
        target.route("/", 200, "ok");
        target.route("/api/diagnostics/ping", 200, r#"{"pong":true}"#);
        target
    }

    pub fn with_log_sink(mut self, sink: Arc<InMemoryLogQuery>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn route(&self, path: &str, status: u16, body: &str) {
        lock(&self.routes).insert(
            path.to_string(),
            TargetResponse {
                status,
                body: body.to_string(),
                latency_ms: 1,
            },
        );
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl TargetClient for InMemoryTarget {
    fn identifier(&self) -> String {
        self.identifier.clone()
    }

    async fn get(&self, path: &str, correlation_id: &str) -> Result<TargetResponse> {
        lock(&self.calls).push(path.to_string());
        let response = lock(&self.routes).get(path).cloned().unwrap_or(TargetResponse {
            status: 404,
            body: String::new(),
            latency_ms: 1,
        });
        if let Some(sink) = &self.log_sink {
            let level = match response.status {
                500.. => "ERROR",
                400..=499 => "WARN",
                _ => "INFO",
            };
            sink.push(
                level,
                format!(
                    "GET {} -> {} correlation_id={}",
                    path, response.status, correlation_id
                ),
            );
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_propagation_lag_serves_stale_reads() {
        let store = InMemoryParameterStore::with_values([("/s/flag", "false")]);
        store.set_propagation_lag(2);
        store.set("/s/flag", "true").await.unwrap();
        assert_eq!(store.get("/s/flag").await.unwrap().as_deref(), Some("false"));
        assert_eq!(store.get("/s/flag").await.unwrap().as_deref(), Some("false"));
        assert_eq!(store.get("/s/flag").await.unwrap().as_deref(), Some("true"));
        assert_eq!(store.value("/s/flag").as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn test_log_query_filters_level_and_text() {
        let logs = InMemoryLogQuery::default();
        let start = Utc::now() - chrono::Duration::seconds(1);
        logs.push("INFO", "GET /health -> 200 correlation_id=abc");
        logs.push("ERROR", "GET /api -> 500 correlation_id=abc");
        let range = TimeRange::since(start);
        assert_eq!(logs.query("correlation_id=abc", range, 10).await.unwrap().len(), 2);
        assert_eq!(logs.query("level:error correlation_id=abc", range, 10).await.unwrap().len(), 1);
        assert_eq!(logs.query("correlation_id=abc", range, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_channel_failure_injection() {
        let channel = InMemoryChannel::default();
        channel.fail_next(1);
        assert!(channel.post_message("c", "x").await.is_err());
        assert_eq!(channel.post_message("c", "y").await.unwrap(), "msg-1");
    }
}
