// stagecheck-core/tests/http_collaborator_tests.rs
//! The reqwest-backed collaborators against a local mockito server.

use std::time::Duration;

use chrono::Utc;
use mockito::Matcher;
use serde_json::json;
use stagecheck_core::collaborators::github::GitHubCiStatus;
use stagecheck_core::collaborators::http::{
    ChatWebhookChannel, HttpLogQuery, HttpParameterStore, HttpTargetClient,
};
use stagecheck_core::collaborators::{
    CiState, CiStatus, LogQuery, NotificationChannel, ParameterStore, TargetClient, TimeRange,
};
use stagecheck_core::{RetryPolicy, StagecheckError};

const TIMEOUT: Duration = Duration::from_secs(5);

fn quick_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts: attempts,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        jitter: false,
    }
}

#[tokio::test]
async fn parameter_store_reads_writes_and_lists() {
    let mut server = mockito::Server::new_async().await;
    let get = server
        .mock("GET", "/parameters/staging/flags/new-checkout")
        .match_header("authorization", "Bearer store-token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"value":"off"}"#)
        .create_async()
        .await;
    let missing = server
        .mock("GET", "/parameters/staging/flags/unknown")
        .with_status(404)
        .create_async()
        .await;
    let put = server
        .mock("PUT", "/parameters/staging/flags/new-checkout")
        .match_body(Matcher::Json(json!({ "value": "on" })))
        .with_status(204)
        .create_async()
        .await;
    let list = server
        .mock("GET", "/parameters")
        .match_query(Matcher::UrlEncoded("prefix".into(), "/staging/flags/".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"parameters":[{"key":"/staging/flags/new-checkout","value":"off"}]}"#)
        .create_async()
        .await;

    let store = HttpParameterStore::new(
        &server.url(),
        Some("store-token".to_string()),
        TIMEOUT,
        RetryPolicy::none(),
    )
    .unwrap();

    assert_eq!(
        store.get("/staging/flags/new-checkout").await.unwrap().as_deref(),
        Some("off")
    );
    assert_eq!(store.get("/staging/flags/unknown").await.unwrap(), None);
    store.set("/staging/flags/new-checkout", "on").await.unwrap();
    assert_eq!(
        store.list_by_prefix("/staging/flags/").await.unwrap(),
        vec![("/staging/flags/new-checkout".to_string(), "off".to_string())]
    );

    get.assert_async().await;
    missing.assert_async().await;
    put.assert_async().await;
    list.assert_async().await;
}

#[tokio::test]
async fn parameter_reads_retry_transient_errors_but_not_permission_errors() {
    let mut server = mockito::Server::new_async().await;
    let flaky = server
        .mock("GET", "/parameters/staging/flags/a")
        .with_status(503)
        .expect(3)
        .create_async()
        .await;
    let denied = server
        .mock("GET", "/parameters/staging/flags/b")
        .with_status(403)
        .expect(1)
        .create_async()
        .await;

    let store = HttpParameterStore::new(&server.url(), None, TIMEOUT, quick_retry(3)).unwrap();

    let err = store.get("/staging/flags/a").await.unwrap_err();
    assert!(matches!(err, StagecheckError::Transport { .. }), "{err:?}");
    let err = store.get("/staging/flags/b").await.unwrap_err();
    assert!(matches!(err, StagecheckError::Permission(_)), "{err:?}");

    flaky.assert_async().await;
    denied.assert_async().await;
}

#[tokio::test]
async fn forbidden_access_probe_means_no_access() {
    let mut server = mockito::Server::new_async().await;
    let _access = server
        .mock("GET", "/access")
        .match_query(Matcher::Any)
        .with_status(403)
        .create_async()
        .await;

    let store = HttpParameterStore::new(&server.url(), None, TIMEOUT, RetryPolicy::none()).unwrap();
    let access = store.access("/staging/flags/").await.unwrap();
    assert!(!access.read);
    assert!(!access.write);
}

#[tokio::test]
async fn log_query_posts_filter_and_honours_limit() {
    let mut server = mockito::Server::new_async().await;
    let query = server
        .mock("POST", "/query")
        .match_header("authorization", "Bearer logs-token")
        .match_body(Matcher::PartialJson(json!({ "filter": "level:ERROR", "limit": 1 })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "entries": [
                    { "timestamp": "2026-01-01T00:00:00Z", "level": "ERROR", "message": "boom" },
                    { "timestamp": "2026-01-01T00:00:01Z", "level": "ERROR", "message": "again" }
                ]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let logs = HttpLogQuery::new(
        &server.url(),
        Some("logs-token".to_string()),
        TIMEOUT,
        RetryPolicy::none(),
    )
    .unwrap();
    let entries = logs
        .query("level:ERROR", TimeRange::since(Utc::now()), 1)
        .await
        .unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message, "boom");
    query.assert_async().await;
}

#[tokio::test]
async fn chat_webhook_returns_message_id_or_rejection() {
    let mut server = mockito::Server::new_async().await;
    let accepted = server
        .mock("POST", "/hooks/accept")
        .match_body(Matcher::Json(json!({ "channel": "staging-alerts", "text": "hello" })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"ok":true,"ts":"1700000000.000100"}"#)
        .create_async()
        .await;
    let _rejected = server
        .mock("POST", "/hooks/reject")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"ok":false,"error":"channel_not_found"}"#)
        .create_async()
        .await;

    let channel =
        ChatWebhookChannel::new(&format!("{}/hooks/accept", server.url()), None, TIMEOUT).unwrap();
    assert_eq!(
        channel.post_message("staging-alerts", "hello").await.unwrap(),
        "1700000000.000100"
    );
    accepted.assert_async().await;

    let channel =
        ChatWebhookChannel::new(&format!("{}/hooks/reject", server.url()), None, TIMEOUT).unwrap();
    let err = channel.post_message("staging-alerts", "hello").await.unwrap_err();
    assert!(err.to_string().contains("channel_not_found"), "{err}");
}

#[tokio::test]
async fn target_client_propagates_correlation_id_and_keeps_error_statuses() {
    let mut server = mockito::Server::new_async().await;
    let health = server
        .mock("GET", "/health")
        .match_header("x-correlation-id", "sc-20260101T000000Z-1a2b3c4d")
        .with_status(503)
        .with_body("unavailable")
        .create_async()
        .await;

    let target = HttpTargetClient::new(&server.url(), TIMEOUT).unwrap();
    let response = target
        .get("/health", "sc-20260101T000000Z-1a2b3c4d")
        .await
        .unwrap();

    assert_eq!(response.status, 503);
    assert_eq!(response.body, "unavailable");
    assert!(!response.is_success());
    health.assert_async().await;
}

#[tokio::test]
async fn github_status_reads_the_latest_workflow_run() {
    let mut server = mockito::Server::new_async().await;
    let runs = server
        .mock("GET", "/repos/acme/shop/actions/runs")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("branch".into(), "main".into()),
            Matcher::UrlEncoded("per_page".into(), "1".into()),
        ]))
        .match_header("authorization", "Bearer gh-token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "workflow_runs": [{
                    "status": "completed",
                    "conclusion": "failure",
                    "html_url": "https://github.com/acme/shop/actions/runs/1"
                }]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let ci = GitHubCiStatus::new(
        Some(&server.url()),
        "acme/shop",
        Some("gh-token".to_string()),
        TIMEOUT,
    )
    .unwrap();
    let run = ci.latest_run("main").await.unwrap();

    assert_eq!(run.status, CiState::Failure);
    assert_eq!(run.url, "https://github.com/acme/shop/actions/runs/1");
    runs.assert_async().await;
}
