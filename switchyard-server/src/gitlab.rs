//! GitLab v4 API client implementing the VCS host capability.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::host::{CiStatus, VcsHost};
use crate::store::Repo;

/// Request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub struct GitLabClient {
    client: Client,
}

#[derive(Debug, Deserialize)]
struct Pipeline {
    id: i64,
    status: String,
}

#[derive(Debug, Deserialize)]
struct MergeRequestResponse {
    head_pipeline: Option<Pipeline>,
}

#[derive(Debug, Serialize)]
struct CreateNoteRequest<'a> {
    body: &'a str,
}

/// Map a GitLab pipeline status string onto the queue's three-way status.
///
/// Cancelled pipelines count as failed; skipped pipelines count as passed.
fn map_pipeline_status(status: &str) -> CiStatus {
    match status {
        "success" | "skipped" => CiStatus::Passed,
        "failed" | "canceled" => CiStatus::Failed,
        _ => CiStatus::NotFinished,
    }
}

/// API base for a repository, derived from its clone URL:
/// `https://gitlab.example.com/group/proj.git` becomes
/// `https://gitlab.example.com/api/v4/projects/group%2Fproj`.
fn project_endpoint(repo: &Repo) -> Result<String> {
    let url = reqwest::Url::parse(&repo.url)
        .with_context(|| format!("repo url is not a valid URL: {}", repo.url))?;
    let host = url
        .host_str()
        .with_context(|| format!("repo url has no host: {}", repo.url))?;
    let port = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
    let path = url
        .path()
        .trim_start_matches('/')
        .trim_end_matches(".git");
    if path.is_empty() {
        bail!("repo url has no project path: {}", repo.url);
    }
    Ok(format!(
        "{}://{}{}/api/v4/projects/{}",
        url.scheme(),
        host,
        port,
        path.replace('/', "%2F")
    ))
}

impl GitLabClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self { client })
    }

    fn request(
        &self,
        method: reqwest::Method,
        repo: &Repo,
        url: &str,
    ) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(token) = &repo.access_token {
            builder = builder.header("PRIVATE-TOKEN", token);
        }
        builder
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, repo: &Repo, url: &str) -> Result<T> {
        let response = self
            .request(reqwest::Method::GET, repo, url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("GitLab returned {} for GET {}", status, url);
        }
        response
            .json()
            .await
            .with_context(|| format!("invalid JSON from GET {}", url))
    }
}

#[async_trait]
impl VcsHost for GitLabClient {
    fn format_pr_number(&self, number: i64) -> String {
        format!("!{}", number)
    }

    async fn pr_ci_status(&self, repo: &Repo, pr_number: i64) -> Result<CiStatus> {
        let url = format!("{}/merge_requests/{}", project_endpoint(repo)?, pr_number);
        let mr: MergeRequestResponse = self.get_json(repo, &url).await?;
        let status = match mr.head_pipeline {
            Some(pipeline) => {
                debug!(pr = pr_number, pipeline = pipeline.id, status = %pipeline.status, "head pipeline");
                map_pipeline_status(&pipeline.status)
            }
            // No pipeline on the head commit yet: it has not run, let alone finished.
            None => CiStatus::NotFinished,
        };
        Ok(status)
    }

    async fn ci_status(&self, repo: &Repo, ci_number: i64) -> Result<CiStatus> {
        let url = format!("{}/pipelines/{}", project_endpoint(repo)?, ci_number);
        let pipeline: Pipeline = self.get_json(repo, &url).await?;
        Ok(map_pipeline_status(&pipeline.status))
    }

    async fn abort_ci(&self, repo: &Repo, ci_number: i64) -> Result<()> {
        let url = format!("{}/pipelines/{}/cancel", project_endpoint(repo)?, ci_number);
        let response = self
            .request(reqwest::Method::POST, repo, &url)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("GitLab returned {} for POST {}", status, url);
        }
        Ok(())
    }

    async fn pr_send_comment(&self, repo: &Repo, pr_number: i64, text: &str) -> Result<()> {
        let url = format!(
            "{}/merge_requests/{}/notes",
            project_endpoint(repo)?,
            pr_number
        );
        let response = self
            .request(reqwest::Method::POST, repo, &url)
            .json(&CreateNoteRequest { body: text })
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("GitLab returned {} for POST {}", status, url);
        }
        Ok(())
    }
}
