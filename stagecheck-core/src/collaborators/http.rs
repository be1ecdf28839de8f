//! reqwest-backed collaborators.
//!
//! Every client is built with an explicit request timeout. Idempotent reads
//! go through the shared [`RetryPolicy`]; writes are issued once and left to
//! the caller's read-back verification.

use super::{
    AccessLevel, LogEntry, LogQuery, NotificationChannel, ParameterStore, TargetClient,
    TargetResponse, TimeRange,
};
use crate::errors::{Result, StagecheckError};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

pub const USER_AGENT: &str = concat!("stagecheck/", env!("CARGO_PKG_VERSION"));

/// Bodies larger than this are cut before they are stored as evidence.
const MAX_BODY_BYTES: usize = 64 * 1024;

pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| StagecheckError::Config(format!("failed to build HTTP client: {}", e)))
}

fn parse_base(collaborator: &str, base: &str) -> Result<Url> {
    Url::parse(base).map_err(|e| {
        StagecheckError::Config(format!("invalid {} URL '{}': {}", collaborator, base, e))
    })
}

fn with_segments(collaborator: &str, base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| StagecheckError::Config(format!("{} URL cannot be a base", collaborator)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn authorize(req: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(t) => req.bearer_auth(t),
        None => req,
    }
}

async fn send(collaborator: &str, req: RequestBuilder) -> Result<Response> {
    let resp = req
        .send()
        .await
        .map_err(|e| StagecheckError::transport(collaborator, e))?;
    match resp.status() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(StagecheckError::Permission(
            format!("{} answered {}", collaborator, resp.status()),
        )),
        _ => Ok(resp),
    }
}

async fn expect_success(collaborator: &str, resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(StagecheckError::transport(
        collaborator,
        format!("unexpected status {}: {}", status, truncate(&body, 512)),
    ))
}

async fn json<T: for<'de> Deserialize<'de>>(collaborator: &str, resp: Response) -> Result<T> {
    resp.json::<T>()
        .await
        .map_err(|e| StagecheckError::transport(collaborator, format!("invalid response body: {}", e)))
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[derive(Debug, Deserialize)]
struct ParameterBody {
    value: String,
}

#[derive(Debug, Serialize)]
struct SetParameterBody<'a> {
    value: &'a str,
}

#[derive(Debug, Deserialize)]
struct ParameterListBody {
    parameters: Vec<ParameterItem>,
}

#[derive(Debug, Deserialize)]
struct ParameterItem {
    key: String,
    value: String,
}

/// Parameter store speaking a small JSON REST dialect:
/// `GET/PUT {base}/parameters/{key}`, `GET {base}/parameters?prefix=`,
/// `GET {base}/access?prefix=`.
pub struct HttpParameterStore {
    client: Client,
    base: Url,
    token: Option<String>,
    retry: RetryPolicy,
}

impl HttpParameterStore {
    const NAME: &'static str = "parameter-store";

    pub fn new(base_url: &str, token: Option<String>, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base: parse_base(Self::NAME, base_url)?,
            token,
            retry,
        })
    }

    fn key_url(&self, key: &str) -> Result<Url> {
        let mut segments = vec!["parameters"];
        segments.extend(key.split('/').filter(|s| !s.is_empty()));
        with_segments(Self::NAME, &self.base, &segments)
    }
}

#[async_trait]
impl ParameterStore for HttpParameterStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let url = self.key_url(key)?;
        self.retry
            .run("parameter get", |_| {
                let req = authorize(self.client.get(url.clone()), self.token.as_deref());
                async move {
                    let resp = send(Self::NAME, req).await?;
                    if resp.status() == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    let resp = expect_success(Self::NAME, resp).await?;
                    let body: ParameterBody = json(Self::NAME, resp).await?;
                    Ok(Some(body.value))
                }
            })
            .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let url = self.key_url(key)?;
        let req = authorize(self.client.put(url), self.token.as_deref())
            .json(&SetParameterBody { value });
        let resp = send(Self::NAME, req).await?;
        expect_success(Self::NAME, resp).await?;
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let url = with_segments(Self::NAME, &self.base, &["parameters"])?;
        self.retry
            .run("parameter list", |_| {
                let req = authorize(self.client.get(url.clone()), self.token.as_deref())
                    .query(&[("prefix", prefix)]);
                async move {
                    let resp = expect_success(Self::NAME, send(Self::NAME, req).await?).await?;
                    let body: ParameterListBody = json(Self::NAME, resp).await?;
                    Ok(body
                        .parameters
                        .into_iter()
                        .map(|p| (p.key, p.value))
                        .collect())
                }
            })
            .await
    }

    async fn access(&self, prefix: &str) -> Result<AccessLevel> {
        let url = with_segments(Self::NAME, &self.base, &["access"])?;
        let req = authorize(self.client.get(url), self.token.as_deref()).query(&[("prefix", prefix)]);
        match send(Self::NAME, req).await {
            Ok(resp) => json(Self::NAME, expect_success(Self::NAME, resp).await?).await,
            Err(StagecheckError::Permission(_)) => Ok(AccessLevel {
                read: false,
                write: false,
            }),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Serialize)]
struct LogQueryBody<'a> {
    filter: &'a str,
    start: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
    limit: usize,
}

#[derive(Debug, Deserialize)]
struct LogQueryResponse {
    entries: Vec<LogEntry>,
}

/// Log-query service: `POST {base}/query` with filter, time range and limit.
pub struct HttpLogQuery {
    client: Client,
    base: Url,
    token: Option<String>,
    retry: RetryPolicy,
}

impl HttpLogQuery {
    const NAME: &'static str = "log-query";

    pub fn new(base_url: &str, token: Option<String>, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base: parse_base(Self::NAME, base_url)?,
            token,
            retry,
        })
    }
}

#[async_trait]
impl LogQuery for HttpLogQuery {
    async fn query(&self, filter: &str, range: TimeRange, limit: usize) -> Result<Vec<LogEntry>> {
        let url = with_segments(Self::NAME, &self.base, &["query"])?;
        let body = LogQueryBody {
            filter,
            start: range.start,
            end: range.end,
            limit,
        };
        self.retry
            .run("log query", |_| {
                let req = authorize(self.client.post(url.clone()), self.token.as_deref()).json(&body);
                async move {
                    let resp = expect_success(Self::NAME, send(Self::NAME, req).await?).await?;
                    let parsed: LogQueryResponse = json(Self::NAME, resp).await?;
                    Ok(parsed.entries.into_iter().take(limit).collect())
                }
            })
            .await
    }
}

#[derive(Debug, Serialize)]
struct PostMessageBody<'a> {
    channel: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    #[serde(default = "default_ok")]
    ok: bool,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn default_ok() -> bool {
    true
}

/// Chat webhook accepting `{channel, text}` and answering with a message id
/// (`message_id`, or `ts` for Slack-style APIs).
pub struct ChatWebhookChannel {
    client: Client,
    url: Url,
    token: Option<String>,
}

impl ChatWebhookChannel {
    const NAME: &'static str = "notification-channel";

    pub fn new(webhook_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: parse_base(Self::NAME, webhook_url)?,
            token,
        })
    }
}

#[async_trait]
impl NotificationChannel for ChatWebhookChannel {
    async fn post_message(&self, channel_id: &str, text: &str) -> Result<String> {
        let req = authorize(self.client.post(self.url.clone()), self.token.as_deref()).json(
            &PostMessageBody {
                channel: channel_id,
                text,
            },
        );
        let resp = expect_success(Self::NAME, send(Self::NAME, req).await?).await?;
        let parsed: PostMessageResponse = json(Self::NAME, resp).await?;
        if !parsed.ok {
            return Err(StagecheckError::transport(
                Self::NAME,
                parsed.error.unwrap_or_else(|| "channel rejected the message".to_string()),
            ));
        }
        Ok(parsed
            .message_id
            .or(parsed.ts)
            .unwrap_or_else(|| "unknown".to_string()))
    }
}

/// The deployment under test, reached over plain HTTP(S) GETs.
pub struct HttpTargetClient {
    client: Client,
    base: Url,
}

impl HttpTargetClient {
    const NAME: &'static str = "target";

    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base: parse_base(Self::NAME, base_url)?,
        })
    }
}

#[async_trait]
impl TargetClient for HttpTargetClient {
    fn identifier(&self) -> String {
        self.base.to_string()
    }

    async fn get(&self, path: &str, correlation_id: &str) -> Result<TargetResponse> {
        let url = self.base.join(path).map_err(|e| {
            StagecheckError::Config(format!("invalid target path '{}': {}", path, e))
        })?;
        let started = Instant::now();
        let resp = self
            .client
            .get(url)
            .header("X-Correlation-Id", correlation_id)
            .send()
            .await
            .map_err(|e| StagecheckError::transport(Self::NAME, e))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| StagecheckError::transport(Self::NAME, e))?;
        Ok(TargetResponse {
            status,
            body: truncate(&body, MAX_BODY_BYTES).to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_url_encodes_segments() {
        let store = HttpParameterStore::new(
            "https://params.example.test/v1/",
            None,
            Duration::from_secs(1),
            RetryPolicy::none(),
        )
        .unwrap();
        let url = store.key_url("/staging/flags/new feed").unwrap();
        assert_eq!(
            url.as_str(),
            "https://params.example.test/v1/parameters/staging/flags/new%20feed"
        );
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
