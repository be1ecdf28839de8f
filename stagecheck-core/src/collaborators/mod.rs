//! Narrow interfaces to the external systems a validation run talks to.
//!
//! The engine never assumes how these are implemented. [`http`] and
//! [`github`] provide reqwest-backed clients; [`memory`] provides in-process
//! fakes used for dry runs and tests.

use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod github;
pub mod http;
pub mod memory;

/// What the caller may do under a key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLevel {
    pub read: bool,
    pub write: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            start,
            end: Utc::now(),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiState {
    Success,
    Failure,
    InProgress,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiRun {
    pub status: CiState,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetResponse {
    pub status: u16,
    pub body: String,
    pub latency_ms: u64,
}

impl TargetResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Remote key-value store holding feature flags.
#[async_trait]
pub trait ParameterStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Effective permissions of the configured credentials under `prefix`.
    async fn access(&self, prefix: &str) -> Result<AccessLevel>;
}

#[async_trait]
pub trait LogQuery: Send + Sync {
    async fn query(&self, filter: &str, range: TimeRange, limit: usize) -> Result<Vec<LogEntry>>;
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Posts already-redacted text and returns the channel's message id.
    async fn post_message(&self, channel_id: &str, text: &str) -> Result<String>;
}

#[async_trait]
pub trait CiStatus: Send + Sync {
    async fn latest_run(&self, git_ref: &str) -> Result<CiRun>;
}

/// The deployment under validation.
#[async_trait]
pub trait TargetClient: Send + Sync {
    /// Identifier checked against the production pattern (usually the base URL).
    fn identifier(&self) -> String;

    async fn get(&self, path: &str, correlation_id: &str) -> Result<TargetResponse>;
}

/// The full set of collaborators handed to the orchestrator.
#[derive(Clone)]
pub struct Collaborators {
    pub parameters: Arc<dyn ParameterStore>,
    pub logs: Arc<dyn LogQuery>,
    pub channel: Arc<dyn NotificationChannel>,
    pub ci: Option<Arc<dyn CiStatus>>,
    pub target: Arc<dyn TargetClient>,
}
