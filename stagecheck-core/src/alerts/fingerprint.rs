// stagecheck-core/src/alerts/fingerprint.rs
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("static regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Error,
    Warning,
}

impl Severity {
    pub fn indicator(self) -> &'static str {
        match self {
            Severity::Critical => "🔴",
            Severity::Error => "🟠",
            Severity::Warning => "🟡",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Error => "error",
            Severity::Warning => "warning",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SHA-256 hex digest identifying logically duplicate alerts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertFingerprint(String);

impl AlertFingerprint {
    pub fn compute(severity: Severity, message: &str, trace_id: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(severity.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize_message(message).as_bytes());
        hasher.update([0u8]);
        hasher.update(trace_id.unwrap_or("").as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for AlertFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strips ANSI sequences, lowercases, folds digit runs and collapses whitespace,
/// so retries that differ only in counters or durations share a fingerprint.
pub fn normalize_message(message: &str) -> String {
    let plain = strip_ansi_escapes::strip_str(message).to_lowercase();
    let folded = DIGITS.replace_all(&plain, "#");
    WHITESPACE.replace_all(folded.trim(), " ").into_owned()
}

/// One alert as raised by a caller, before redaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub message: String,
    pub trace_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl Alert {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            trace_id: None,
            correlation_id: None,
        }
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn fingerprint(&self) -> AlertFingerprint {
        AlertFingerprint::compute(self.severity, &self.message, self.trace_id.as_deref())
    }
}
