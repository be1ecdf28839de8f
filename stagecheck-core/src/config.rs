//! Configuration management for `stagecheck-core`.
//!
//! A validation run is driven entirely by [`ValidationConfig`]: every option the
//! engine recognizes is an explicit, defaulted field. Configs are loaded from YAML,
//! validated, and then adjusted by command-line overrides. Credentials are never
//! part of the file; collaborators read them from the environment.
//!
//! License: MIT OR Apache-2.0

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default window in which identical alerts are delivered once.
pub const DEFAULT_DEDUP_WINDOW_SECS: u64 = 300;

/// The four options every invocation recognizes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RunOptions {
    /// Plan flag writes and alerts without issuing them.
    pub dry_run: bool,
    pub verbose: bool,
    pub dedup_window_seconds: u64,
    /// Abort before any mutation when the target looks like production.
    pub staging_only_guard: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            verbose: false,
            dedup_window_seconds: DEFAULT_DEDUP_WINDOW_SECS,
            staging_only_guard: true,
        }
    }
}

/// The deployment under test.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TargetConfig {
    pub base_url: String,
    /// Full health endpoint, expected to answer JSON with `"status": "ok"`.
    pub health_path: String,
    /// Lightweight liveness path served by a different code path.
    pub probe_path: String,
    /// Endpoint exercising a command whose effect is visible in the logs.
    pub command_path: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            health_path: "/health".to_string(),
            probe_path: "/".to_string(),
            command_path: "/api/diagnostics/ping".to_string(),
        }
    }
}

/// A feature flag the run is allowed to toggle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct FlagSpec {
    /// Full parameter-store key; must live under `flag_prefix`.
    pub name: String,
    pub safe_default: String,
    pub test_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub probe_ms: u64,
    pub request_ms: u64,
    /// Optional deadline for the whole run; cleanup still runs after it fires.
    pub run_deadline_secs: Option<u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe_ms: 10_000,
            request_ms: 5_000,
            run_deadline_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 2_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TraceConfig {
    pub per_user_capacity: usize,
    pub global_capacity: usize,
    pub payload_limit_bytes: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            per_user_capacity: 10,
            global_capacity: 100,
            payload_limit_bytes: 8 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Distinct alerts allowed per `window_seconds` before the limiter trips.
    pub max_per_window: usize,
    pub window_seconds: u64,
    /// Dedup records are dropped after this many dedup windows.
    pub retention_windows: u32,
    /// TinyTemplate body; fields: indicator, severity, message, trace_id, correlation_id.
    pub message_template: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            max_per_window: 20,
            window_seconds: 60,
            retention_windows: 4,
            message_template: "{indicator} [{severity}] {message} (trace {trace_id}, run {correlation_id})"
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RemediationConfig {
    pub delay_ms: u64,
    pub max_per_minute: usize,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            delay_ms: 2_000,
            max_per_minute: 5,
        }
    }
}

/// Where the HTTP collaborators live. Empty values mean "not configured".
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub parameter_store_url: String,
    pub log_query_url: String,
    pub chat_webhook_url: String,
    pub github_api_url: String,
    pub github_repo: String,
}

/// Represents the top-level configuration of a validation run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Name of the environment under test (e.g. "staging").
    pub environment: String,
    pub target: TargetConfig,
    pub flags: Vec<FlagSpec>,
    /// Every flag write must stay under this key prefix.
    pub flag_prefix: String,
    pub alert_channel_id: String,
    /// Channel ids must match this pattern or messages are refused.
    pub channel_allow_pattern: String,
    /// Identifiers matching this pattern are treated as production.
    pub production_pattern: String,
    /// Check ids or check types whose inconsistency fails the run.
    pub required_checks: Vec<String>,
    /// Git ref whose latest CI run is consulted during preflight.
    pub ci_ref: Option<String>,
    pub report_dir: PathBuf,
    pub options: RunOptions,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    pub trace: TraceConfig,
    pub alerts: AlertConfig,
    pub remediation: RemediationConfig,
    pub endpoints: EndpointConfig,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            environment: "staging".to_string(),
            target: TargetConfig::default(),
            flags: Vec::new(),
            flag_prefix: "/staging/flags/".to_string(),
            alert_channel_id: String::new(),
            channel_allow_pattern: r"(?i)(staging|stage|test|sandbox|dev|qa)".to_string(),
            production_pattern: r"(?i)(prod|\blive\b|\bprd\b)".to_string(),
            required_checks: vec!["health".to_string(), "flag".to_string()],
            ci_ref: None,
            report_dir: PathBuf::from("stagecheck-reports"),
            options: RunOptions::default(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            trace: TraceConfig::default(),
            alerts: AlertConfig::default(),
            remediation: RemediationConfig::default(),
            endpoints: EndpointConfig::default(),
        }
    }
}

/// Values supplied on the command line; `None` leaves the file value alone.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub dry_run: Option<bool>,
    pub verbose: Option<bool>,
    pub dedup_window_seconds: Option<u64>,
    pub staging_only_guard: Option<bool>,
    pub report_dir: Option<PathBuf>,
}

impl ValidationConfig {
    /// Loads a configuration from a YAML file and validates it.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading validation config from: {}", path.display());
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_yaml_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!(
            "Loaded config for environment '{}' with {} flag(s).",
            config.environment,
            config.flags.len()
        );
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: ValidationConfig = serde_yml::from_str(text).context("Invalid YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Finds the first existing config among the standard locations.
    pub fn discover() -> Option<PathBuf> {
        config_candidate_paths().into_iter().find(|p| p.is_file())
    }

    /// Applies command-line overrides on top of file values.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(v) = overrides.dry_run {
            debug!("Overriding dry_run with command-line value: {}", v);
            self.options.dry_run = v;
        }
        if let Some(v) = overrides.verbose {
            self.options.verbose = v;
        }
        if let Some(v) = overrides.dedup_window_seconds {
            debug!("Overriding dedup window with command-line value: {}s", v);
            self.options.dedup_window_seconds = v;
        }
        if let Some(v) = overrides.staging_only_guard {
            if !v {
                warn!("Staging-only guard disabled from the command line.");
            }
            self.options.staging_only_guard = v;
        }
        if let Some(dir) = &overrides.report_dir {
            self.report_dir = dir.clone();
        }
    }

    /// Rejects configurations the engine cannot run safely.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.environment.trim().is_empty() {
            errors.push("`environment` must not be empty.".to_string());
        }
        if self.flag_prefix.trim().is_empty() {
            errors.push("`flag_prefix` must not be empty.".to_string());
        }

        let mut names = HashSet::new();
        for flag in &self.flags {
            if flag.name.trim().is_empty() {
                errors.push("A flag has an empty `name` field.".to_string());
                continue;
            }
            if !names.insert(flag.name.as_str()) {
                errors.push(format!("Duplicate flag name found: '{}'.", flag.name));
            }
            if !flag.name.starts_with(&self.flag_prefix) {
                errors.push(format!(
                    "Flag '{}' is outside the declared prefix '{}'.",
                    flag.name, self.flag_prefix
                ));
            }
            if flag.safe_default == flag.test_value {
                warn!("Flag '{}' has identical safe default and test value; the run will not toggle it.", flag.name);
            }
        }

        for (field, pattern) in [
            ("channel_allow_pattern", &self.channel_allow_pattern),
            ("production_pattern", &self.production_pattern),
        ] {
            if let Err(e) = Regex::new(pattern) {
                errors.push(format!("`{}` is not a valid regex: {}", field, e));
            }
        }

        if self.options.dedup_window_seconds == 0 {
            errors.push("`options.dedup_window_seconds` must be greater than 0.".to_string());
        }
        if self.retry.max_attempts == 0 {
            errors.push("`retry.max_attempts` must be at least 1.".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            errors.push("`retry.base_delay_ms` cannot exceed `retry.max_delay_ms`.".to_string());
        }
        if self.trace.per_user_capacity == 0 || self.trace.global_capacity == 0 {
            errors.push("Trace ring capacities must be greater than 0.".to_string());
        }
        if self.alerts.max_per_window == 0 || self.alerts.window_seconds == 0 {
            errors.push("Alert rate limit must allow at least one alert per non-empty window.".to_string());
        }
        if self.timeouts.probe_ms == 0 || self.timeouts.request_ms == 0 {
            errors.push("Timeouts must be greater than 0; unbounded calls are not allowed.".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!("Config validation failed:\n{}", errors.join("\n"))
        }
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.options.dedup_window_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.probe_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.request_ms)
    }

    /// True when a check id or type was declared required.
    pub fn is_required(&self, check_id: &str, check_type: &str) -> bool {
        self.required_checks
            .iter()
            .any(|r| r == check_id || r == check_type)
    }
}

/// Standard config locations, in lookup order.
pub fn config_candidate_paths() -> Vec<PathBuf> {
    [
        Some(PathBuf::from("./stagecheck.yaml")),
        Some(PathBuf::from("./config/stagecheck.yaml")),
        dirs::home_dir().map(|p| p.join(".stagecheck").join("config.yaml")),
        dirs::config_dir().map(|p| p.join("stagecheck").join("config.yaml")),
        Some(PathBuf::from("/etc/stagecheck/config.yaml")),
    ]
    .into_iter()
    .flatten()
    .collect()
}
