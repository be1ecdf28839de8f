//! flags.rs - Read, write and revert feature flags in the parameter store.
//!
//! A write only succeeds once a read-back observes the intended value. Every
//! name a write was attempted for is remembered, so the caller can revert all
//! of them to their declared safe defaults no matter how the run ends.
//!
//! License: MIT OR APACHE 2.0

use crate::collaborators::ParameterStore;
use crate::config::FlagSpec;
use crate::errors::{Result, StagecheckError};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagState {
    pub name: String,
    pub current_value: Option<String>,
    pub expected_safe_default: String,
    pub test_value: String,
    pub last_verified_at: Option<DateTime<Utc>>,
}

impl FlagState {
    pub fn at_safe_default(&self) -> bool {
        self.current_value.as_deref() == Some(self.expected_safe_default.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagRevert {
    pub name: String,
    pub safe_default: String,
    pub observed: Option<String>,
    pub verified: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertReport {
    /// True only when every flag was observed at its safe default.
    pub verified: bool,
    pub flags: Vec<FlagRevert>,
}

impl RevertReport {
    pub fn failed_names(&self) -> Vec<String> {
        self.flags
            .iter()
            .filter(|f| !f.verified)
            .map(|f| f.name.clone())
            .collect()
    }

    pub fn into_result(self) -> Result<Self> {
        if self.verified {
            Ok(self)
        } else {
            Err(StagecheckError::RevertFailure(self.failed_names()))
        }
    }
}

pub struct FlagController {
    store: Arc<dyn ParameterStore>,
    prefix: String,
    specs: BTreeMap<String, FlagSpec>,
    retry: RetryPolicy,
    dry_run: bool,
    touched: Mutex<BTreeSet<String>>,
}

impl FlagController {
    pub fn new(
        store: Arc<dyn ParameterStore>,
        prefix: &str,
        specs: &[FlagSpec],
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
            specs: specs.iter().map(|s| (s.name.clone(), s.clone())).collect(),
            retry,
            dry_run: false,
            touched: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn touched_lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.touched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn in_scope(&self, name: &str) -> bool {
        name.starts_with(&self.prefix) && !name.split('/').any(|seg| seg == "..")
    }

    /// Names a write was attempted for and that have not been reverted since.
    pub fn touched(&self) -> Vec<String> {
        self.touched_lock().iter().cloned().collect()
    }

    pub async fn read(&self, name: &str) -> Result<Option<String>> {
        self.store.get(name).await
    }

    /// Current state of every declared flag.
    pub async fn snapshot(&self) -> Vec<FlagState> {
        let mut states = Vec::with_capacity(self.specs.len());
        for spec in self.specs.values() {
            let current = match self.read(&spec.name).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("Could not read flag '{}' for snapshot: {}", spec.name, e);
                    None
                }
            };
            states.push(FlagState {
                name: spec.name.clone(),
                current_value: current,
                expected_safe_default: spec.safe_default.clone(),
                test_value: spec.test_value.clone(),
                last_verified_at: Some(Utc::now()),
            });
        }
        states
    }

    /// Writes `value` and returns only after a read-back observed it.
    ///
    /// A propagation timeout is retried once by reissuing the write.
    pub async fn write(&self, name: &str, value: &str) -> Result<FlagState> {
        if !self.in_scope(name) {
            error!("Refusing to write '{}': outside prefix '{}'", name, self.prefix);
            return Err(StagecheckError::Scope(format!(
                "flag '{}' is outside the declared prefix '{}'",
                name, self.prefix
            )));
        }
        let spec = self.specs.get(name);

        if self.dry_run {
            info!("[dry-run] Would set flag '{}' to '{}'", name, value);
            return Ok(FlagState {
                name: name.to_string(),
                current_value: self.read(name).await.ok().flatten(),
                expected_safe_default: spec.map(|s| s.safe_default.clone()).unwrap_or_default(),
                test_value: spec.map(|s| s.test_value.clone()).unwrap_or_default(),
                last_verified_at: None,
            });
        }

        self.touched_lock().insert(name.to_string());

        let mut result = self.write_once(name, value).await;
        if let Err(StagecheckError::PropagationTimeout { .. }) = &result {
            warn!("Flag '{}' did not propagate; reissuing the write once", name);
            result = self.write_once(name, value).await;
        }
        let observed = result?;

        debug!("Flag '{}' verified at '{}'", name, value);
        Ok(FlagState {
            name: name.to_string(),
            current_value: Some(observed),
            expected_safe_default: spec.map(|s| s.safe_default.clone()).unwrap_or_default(),
            test_value: spec.map(|s| s.test_value.clone()).unwrap_or_default(),
            last_verified_at: Some(Utc::now()),
        })
    }

    async fn write_once(&self, name: &str, value: &str) -> Result<String> {
        self.retry
            .run("flag write", |_| async move {
                match self.store.set(name, value).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_retryable() => {
                        // Setting the same value again is harmless; read back to
                        // see whether the failed call actually landed.
                        match self.store.get(name).await {
                            Ok(Some(v)) if v == value => Ok(()),
                            _ => Err(e),
                        }
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;
        self.verify_readback(name, value).await
    }

    async fn verify_readback(&self, name: &str, expected: &str) -> Result<String> {
        let mut observed = None;
        for attempt in 1..=self.retry.max_attempts {
            match self.store.get(name).await {
                Ok(Some(v)) if v == expected => return Ok(v),
                Ok(v) => observed = v,
                Err(e) => debug!("Read-back of '{}' failed on attempt {}: {}", name, attempt, e),
            }
            if attempt < self.retry.max_attempts {
                tokio::time::sleep(self.retry.backoff(attempt)).await;
            }
        }
        Err(StagecheckError::PropagationTimeout {
            key: name.to_string(),
            attempts: self.retry.max_attempts,
            observed,
        })
    }

    /// Returns each named flag to its safe default and verifies it by read-back.
    ///
    /// Never stops at the first failure; every flag gets its attempt.
    pub async fn revert_all(&self, names: &[String]) -> RevertReport {
        let mut flags = Vec::with_capacity(names.len());
        for name in names {
            flags.push(self.revert_one(name).await);
        }
        let verified = flags.iter().all(|f| f.verified);
        if verified {
            info!("Reverted {} flag(s) to safe defaults", flags.len());
        } else {
            error!(
                "Revert could not be verified for: {}",
                flags
                    .iter()
                    .filter(|f| !f.verified)
                    .map(|f| f.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        RevertReport { verified, flags }
    }

    /// Reverts every touched flag.
    pub async fn revert_touched(&self) -> RevertReport {
        let names = self.touched();
        self.revert_all(&names).await
    }

    async fn revert_one(&self, name: &str) -> FlagRevert {
        let Some(spec) = self.specs.get(name) else {
            return FlagRevert {
                name: name.to_string(),
                safe_default: String::new(),
                observed: None,
                verified: false,
                error: Some("no declared safe default".to_string()),
            };
        };
        let safe = spec.safe_default.as_str();

        if self.dry_run {
            self.touched_lock().remove(name);
            return FlagRevert {
                name: name.to_string(),
                safe_default: safe.to_string(),
                observed: self.read(name).await.ok().flatten(),
                verified: true,
                error: None,
            };
        }

        // Always rewrite: a read that already shows the safe default may be
        // stale while the test value is still propagating.

        match self.write(name, safe).await {
            Ok(state) => {
                self.touched_lock().remove(name);
                FlagRevert {
                    name: name.to_string(),
                    safe_default: safe.to_string(),
                    observed: state.current_value,
                    verified: true,
                    error: None,
                }
            }
            Err(e) => {
                let observed = match &e {
                    StagecheckError::PropagationTimeout { observed, .. } => observed.clone(),
                    _ => self.read(name).await.ok().flatten(),
                };
                FlagRevert {
                    name: name.to_string(),
                    safe_default: safe.to_string(),
                    observed,
                    verified: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::memory::InMemoryParameterStore;
    use std::time::Duration;

    const FLAG: &str = "/staging/flags/new_feed";

    fn spec() -> FlagSpec {
        FlagSpec {
            name: FLAG.to_string(),
            safe_default: "false".to_string(),
            test_value: "true".to_string(),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            jitter: false,
        }
    }

    fn controller(store: Arc<InMemoryParameterStore>) -> FlagController {
        FlagController::new(store, "/staging/flags/", &[spec()], policy())
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_waits_for_propagation() {
        let store = Arc::new(InMemoryParameterStore::with_values([(FLAG, "false")]));
        store.set_propagation_lag(2);
        let flags = controller(store.clone());

        let state = flags.write(FLAG, "true").await.unwrap();
        assert_eq!(state.current_value.as_deref(), Some("true"));
        assert!(state.last_verified_at.is_some());
        assert_eq!(flags.touched(), vec![FLAG.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_that_never_propagates_is_distinguishable() {
        let store = Arc::new(InMemoryParameterStore::with_values([(FLAG, "false")]));
        store.stick_key(FLAG);
        let flags = controller(store.clone());

        let err = flags.write(FLAG, "true").await.unwrap_err();
        match err {
            StagecheckError::PropagationTimeout { key, attempts, observed } => {
                assert_eq!(key, FLAG);
                assert_eq!(attempts, 3);
                assert_eq!(observed.as_deref(), Some("false"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Original write plus exactly one reissue.
        assert_eq!(store.writes().len(), 2);
        assert_eq!(flags.touched(), vec![FLAG.to_string()]);
    }

    #[tokio::test]
    async fn test_out_of_scope_write_is_never_issued() {
        let store = Arc::new(InMemoryParameterStore::default());
        let flags = controller(store.clone());
        for name in ["/prod/flags/x", "/staging/flags/../../prod/x"] {
            let err = flags.write(name, "true").await.unwrap_err();
            assert!(matches!(err, StagecheckError::Scope(_)));
        }
        assert!(store.writes().is_empty());
        assert!(flags.touched().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_revert_restores_and_verifies() {
        let store = Arc::new(InMemoryParameterStore::with_values([(FLAG, "false")]));
        let flags = controller(store.clone());
        flags.write(FLAG, "true").await.unwrap();

        let report = flags.revert_touched().await;
        assert!(report.verified);
        assert_eq!(store.value(FLAG).as_deref(), Some("false"));
        assert!(flags.touched().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_revert_failure_is_reported_not_hidden() {
        let store = Arc::new(InMemoryParameterStore::with_values([(FLAG, "false")]));
        let flags = controller(store.clone());
        flags.write(FLAG, "true").await.unwrap();
        store.fail_key(FLAG);

        let report = flags.revert_touched().await;
        assert!(!report.verified);
        assert_eq!(report.failed_names(), vec![FLAG.to_string()]);
        assert!(matches!(
            report.clone().into_result(),
            Err(StagecheckError::RevertFailure(_))
        ));
        assert_eq!(flags.touched(), vec![FLAG.to_string()]);

        store.heal_key(FLAG);
        assert!(flags.revert_touched().await.verified);
    }

    #[tokio::test]
    async fn test_dry_run_issues_no_writes() {
        let store = Arc::new(InMemoryParameterStore::with_values([(FLAG, "false")]));
        let flags = controller(store.clone()).with_dry_run(true);
        let state = flags.write(FLAG, "true").await.unwrap();
        assert_eq!(state.current_value.as_deref(), Some("false"));
        assert!(store.writes().is_empty());
        assert!(flags.touched().is_empty());
    }
}
