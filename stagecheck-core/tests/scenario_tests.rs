// stagecheck-core/tests/scenario_tests.rs
//! End-to-end validation runs against in-memory collaborators.
//!
//! Each test builds a small staging world (parameter store, log sink, chat
//! channel, target) and drives a full run through the public API, then checks
//! the run record, the collaborators' side effects and the written report.

use std::sync::Arc;

use stagecheck_core::collaborators::memory::{
    InMemoryChannel, InMemoryCiStatus, InMemoryLogQuery, InMemoryParameterStore, InMemoryTarget,
};
use stagecheck_core::collaborators::CiState;
use stagecheck_core::orchestrator::StageOutcome;
use stagecheck_core::report;
use stagecheck_core::{
    exit_code, CheckType, Collaborators, FlagSpec, Orchestrator, RunStatus, Stage, ValidationConfig,
    Verdict,
};

const CHECKOUT: &str = "/staging/flags/new-checkout";
const SEARCH: &str = "/staging/flags/search-v2";

struct World {
    store: Arc<InMemoryParameterStore>,
    logs: Arc<InMemoryLogQuery>,
    channel: Arc<InMemoryChannel>,
    target: Arc<InMemoryTarget>,
    ci: Arc<InMemoryCiStatus>,
}

impl World {
    fn new(target_id: &str) -> Self {
        let logs = Arc::new(InMemoryLogQuery::default());
        Self {
            store: Arc::new(InMemoryParameterStore::with_values([
                (CHECKOUT, "off"),
                (SEARCH, "false"),
            ])),
            target: Arc::new(InMemoryTarget::healthy(target_id).with_log_sink(Arc::clone(&logs))),
            logs,
            channel: Arc::new(InMemoryChannel::default()),
            ci: Arc::new(InMemoryCiStatus::default()),
        }
    }

    fn staging() -> Self {
        Self::new("https://app.staging.example.com")
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            parameters: self.store.clone(),
            logs: self.logs.clone(),
            channel: self.channel.clone(),
            ci: Some(self.ci.clone()),
            target: self.target.clone(),
        }
    }
}

fn config() -> ValidationConfig {
    ValidationConfig {
        alert_channel_id: "staging-alerts".to_string(),
        flags: vec![
            FlagSpec {
                name: CHECKOUT.to_string(),
                safe_default: "off".to_string(),
                test_value: "on".to_string(),
            },
            FlagSpec {
                name: SEARCH.to_string(),
                safe_default: "false".to_string(),
                test_value: "true".to_string(),
            },
        ],
        ..ValidationConfig::default()
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn full_pass_reports_every_check_and_restores_flags() {
    let world = World::staging();
    let run = Orchestrator::new(config(), world.collaborators())
        .unwrap()
        .run()
        .await;

    assert_eq!(run.status, RunStatus::Passed, "errors: {:#?}", run.errors);
    assert_eq!(run.exit_code(), exit_code::PASSED);
    assert!(run.flags_reverted);
    assert!(run.errors.is_empty());

    let ids: Vec<&str> = run.checks.iter().map(|c| c.check_id.as_str()).collect();
    assert_eq!(
        ids,
        vec!["health", "flag:/staging/flags/new-checkout", "flag:/staging/flags/search-v2", "command", "log", "alert"]
    );
    assert!(run.checks.iter().all(|c| c.clean()));
    assert!(run.checks.iter().all(|c| !c.remediation_attempted));

    // Every mutation was followed by a write back to the safe default.
    assert_eq!(
        world.store.writes(),
        vec![
            (CHECKOUT.to_string(), "on".to_string()),
            (SEARCH.to_string(), "true".to_string()),
            (CHECKOUT.to_string(), "off".to_string()),
            (SEARCH.to_string(), "false".to_string()),
        ]
    );
    assert_eq!(world.store.value(CHECKOUT).as_deref(), Some("off"));
    assert_eq!(world.store.value(SEARCH).as_deref(), Some("false"));

    assert!(run
        .stages
        .iter()
        .all(|s| s.outcome == StageOutcome::Completed));
    assert_eq!(world.channel.messages().len(), 1);
    assert!(world.target.calls().contains(&"/api/diagnostics/ping".to_string()));

    for name in [
        "flags-baseline.json",
        "logs.json",
        "traces.json",
        "flags-mutated.json",
        "alert-gate.json",
        "flags-after-revert.json",
    ] {
        assert!(
            run.evidence_refs.contains(&format!("evidence/{}", name)),
            "missing {name} in {:?}",
            run.evidence_refs
        );
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn production_guard_aborts_before_any_write() {
    let world = World::new("https://api.prod.example.com");
    let run = Orchestrator::new(config(), world.collaborators())
        .unwrap()
        .run()
        .await;

    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(run.exit_code(), exit_code::ABORTED);
    assert!(world.store.writes().is_empty());
    assert!(world.channel.messages().is_empty());
    assert!(run.checks.is_empty());
    assert!(run.flags_reverted, "nothing was touched, so nothing is left mutated");

    let error = &run.errors[0];
    assert_eq!(error.stage, Stage::PermissionCheck);
    assert_eq!(error.kind, "permission");
    assert!(error.fatal);

    let skipped: Vec<Stage> = run
        .stages
        .iter()
        .filter(|s| s.outcome == StageOutcome::Skipped)
        .map(|s| s.stage)
        .collect();
    assert_eq!(
        skipped,
        vec![
            Stage::ReadBaseline,
            Stage::MutateFlags,
            Stage::FunctionalCheck,
            Stage::AlertPathCheck,
            Stage::CollectEvidence,
        ]
    );
}

#[test_log::test(tokio::test(start_paused = true))]
async fn production_guard_can_be_disabled_explicitly() {
    let world = World::new("https://api.prod.example.com");
    let mut cfg = config();
    cfg.options.staging_only_guard = false;
    let run = Orchestrator::new(cfg, world.collaborators()).unwrap().run().await;

    assert_ne!(run.status, RunStatus::Aborted);
    assert!(!world.store.writes().is_empty());
    assert!(run.flags_reverted);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn inconsistent_health_passes_only_when_not_required() {
    // The liveness path is broken while the full health endpoint is fine.
    let lenient = World::staging();
    lenient.target.route("/", 404, "not found");
    let mut cfg = config();
    cfg.required_checks = vec!["flag".to_string()];
    let run = Orchestrator::new(cfg, lenient.collaborators()).unwrap().run().await;

    let health = run.checks.iter().find(|c| c.check_id == "health").unwrap();
    assert!(!health.consistent);
    assert!(health.passed());
    assert!(!health.required);
    assert_eq!(health.secondary_outcome.verdict, Verdict::Fail);
    assert!(health.remediation_attempted);
    assert!(health
        .discrepancy_note
        .as_deref()
        .unwrap()
        .starts_with("primary (GET /health) passed but secondary (GET /) returned fail"));
    assert_eq!(run.status, RunStatus::Passed);
    assert_eq!(run.exit_code(), exit_code::INCONSISTENT);

    let strict = World::staging();
    strict.target.route("/", 404, "not found");
    let run = Orchestrator::new(config(), strict.collaborators()).unwrap().run().await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.exit_code(), exit_code::FAILED);
    assert!(run.flags_reverted);
    let md = report::render_markdown(&run);
    assert!(md.contains("- **health** (required, fails the run)"));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn server_errors_fail_the_log_check() {
    let world = World::staging();
    world.target.route("/api/diagnostics/ping", 503, "unavailable");
    let run = Orchestrator::new(config(), world.collaborators()).unwrap().run().await;

    let command = run.checks.iter().find(|c| c.check_type == CheckType::Command).unwrap();
    assert!(!command.passed());
    let log = run.checks.iter().find(|c| c.check_type == CheckType::Log).unwrap();
    assert!(!log.passed());
    assert!(log.consistent, "logs and traces both saw the 503");
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.flags_reverted);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn dry_run_issues_no_writes_and_posts_nothing() {
    let world = World::staging();
    let mut cfg = config();
    cfg.options.dry_run = true;
    let run = Orchestrator::new(cfg, world.collaborators()).unwrap().run().await;

    assert!(run.dry_run);
    assert!(world.store.writes().is_empty());
    assert!(world.channel.messages().is_empty());
    assert_eq!(run.status, RunStatus::Passed, "errors: {:#?}", run.errors);
    let alert = run.checks.iter().find(|c| c.check_id == "alert").unwrap();
    assert!(alert.clean());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn failed_ci_run_stops_before_mutation() {
    let world = World::staging();
    world.ci.set_run("main", CiState::Failure, "https://ci.example.com/runs/42");
    let mut cfg = config();
    cfg.ci_ref = Some("main".to_string());
    let run = Orchestrator::new(cfg, world.collaborators()).unwrap().run().await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.errors[0].kind, "precondition");
    assert!(world.store.writes().is_empty());
    assert!(run.evidence_refs.contains(&"evidence/ci-status.json".to_string()));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn propagation_lag_is_absorbed_by_read_back() {
    let world = World::staging();
    world.store.set_propagation_lag(1);
    let run = Orchestrator::new(config(), world.collaborators()).unwrap().run().await;

    assert_eq!(run.status, RunStatus::Passed, "errors: {:#?}", run.errors);
    assert!(run.flags_reverted);
    assert_eq!(world.store.value(CHECKOUT).as_deref(), Some("off"));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn unreachable_store_during_baseline_fails_without_writes() {
    let world = World::staging();
    world.store.fail_key(SEARCH);
    let run = Orchestrator::new(config(), world.collaborators()).unwrap().run().await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(world.store.writes().is_empty());
    assert!(run.flags_reverted);
    assert_eq!(run.errors[0].stage, Stage::ReadBaseline);
    assert_eq!(run.errors[0].kind, "transport");
}

#[test_log::test(tokio::test(start_paused = true))]
async fn failed_mutation_reverts_the_flags_already_written() {
    let world = World::staging();
    // SEARCH acknowledges writes but never changes.
    world.store.stick_key(SEARCH);
    let run = Orchestrator::new(config(), world.collaborators()).unwrap().run().await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.errors[0].stage, Stage::MutateFlags);
    assert_eq!(run.errors[0].kind, "propagation_timeout");
    assert!(run.checks.is_empty());
    assert!(run.flags_reverted);
    assert_eq!(world.store.value(CHECKOUT).as_deref(), Some("off"));
    assert!(world
        .store
        .writes()
        .contains(&(CHECKOUT.to_string(), "off".to_string())));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn artifacts_are_written_and_verifiable() {
    let world = World::staging();
    let run = Orchestrator::new(config(), world.collaborators()).unwrap().run().await;
    let dir = tempfile::tempdir().unwrap();

    let set = report::write_artifacts(&run, dir.path(), Some(b"ci-report-key")).unwrap();
    assert_eq!(set.evidence.len(), run.evidence.len());
    let verification = report::verify_artifacts(&set.dir, Some(b"ci-report-key")).unwrap();
    assert!(verification.is_ok());

    let reloaded = report::from_json(&std::fs::read_to_string(&set.report_json).unwrap()).unwrap();
    assert_eq!(reloaded.correlation_id, run.correlation_id);
    assert_eq!(reloaded.checks, run.checks);
    assert_eq!(reloaded.exit_code(), run.exit_code());
}
