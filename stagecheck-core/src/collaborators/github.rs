// stagecheck-core/src/collaborators/github.rs
use super::http::{build_client, USER_AGENT};
use super::{CiRun, CiState, CiStatus};
use crate::errors::{Result, StagecheckError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.github.com";

#[derive(Debug, Deserialize)]
struct WorkflowRuns {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Debug, Deserialize)]
struct WorkflowRun {
    status: Option<String>,
    conclusion: Option<String>,
    html_url: String,
}

/// Reads the latest GitHub Actions run for a branch. Read-only.
pub struct GitHubCiStatus {
    client: Client,
    api_url: String,
    repo: String,
    token: Option<String>,
}

impl GitHubCiStatus {
    const NAME: &'static str = "github";

    pub fn new(api_url: Option<&str>, repo: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        if repo.split('/').filter(|s| !s.is_empty()).count() != 2 {
            return Err(StagecheckError::Config(format!(
                "GitHub repository must look like 'owner/name', got '{}'",
                repo
            )));
        }
        Ok(Self {
            client: build_client(timeout)?,
            api_url: api_url
                .filter(|u| !u.is_empty())
                .unwrap_or(DEFAULT_API_URL)
                .trim_end_matches('/')
                .to_string(),
            repo: repo.to_string(),
            token,
        })
    }
}

fn classify(run: &WorkflowRun) -> CiState {
    if run.status.as_deref() != Some("completed") {
        return CiState::InProgress;
    }
    match run.conclusion.as_deref() {
        Some("success") => CiState::Success,
        Some("failure") | Some("timed_out") | Some("cancelled") | Some("startup_failure") => {
            CiState::Failure
        }
        _ => CiState::Unknown,
    }
}

#[async_trait]
impl CiStatus for GitHubCiStatus {
    async fn latest_run(&self, git_ref: &str) -> Result<CiRun> {
        let url = format!("{}/repos/{}/actions/runs", self.api_url, self.repo);
        let mut req = self
            .client
            .get(&url)
            .query(&[("branch", git_ref), ("per_page", "1")])
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| StagecheckError::transport(Self::NAME, e))?;
        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(StagecheckError::Permission(format!(
                    "GitHub answered {} for {}",
                    resp.status(),
                    self.repo
                )));
            }
            s if !s.is_success() => {
                return Err(StagecheckError::transport(Self::NAME, format!("unexpected status {}", s)));
            }
            _ => {}
        }

        let runs: WorkflowRuns = resp
            .json()
            .await
            .map_err(|e| StagecheckError::transport(Self::NAME, format!("invalid response body: {}", e)))?;
        Ok(match runs.workflow_runs.first() {
            Some(run) => CiRun {
                status: classify(run),
                url: run.html_url.clone(),
            },
            None => CiRun {
                status: CiState::Unknown,
                url: String::new(),
            },
        })
    }
}
