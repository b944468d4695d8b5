//! VCS host capability surface.
//!
//! The coordinator only ever needs five things from the hosting service:
//! render a PR reference, read CI status (for a PR or a pipeline), cancel a
//! pipeline, and post a comment. Implementations live per provider
//! ([`crate::gitlab::GitLabClient`]); tests substitute a mock.

use async_trait::async_trait;

use crate::store::Repo;

/// External pipeline states collapsed to what the queue cares about.
///
/// Cancelled runs count as `Failed`; skipped runs count as `Passed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiStatus {
    Passed,
    Failed,
    NotFinished,
}

#[async_trait]
pub trait VcsHost: Send + Sync {
    /// Provider-specific PR reference, e.g. `!17` on GitLab.
    fn format_pr_number(&self, number: i64) -> String;

    /// CI status of the PR's own head pipeline.
    async fn pr_ci_status(&self, repo: &Repo, pr_number: i64) -> anyhow::Result<CiStatus>;

    /// CI status of a pipeline by id.
    async fn ci_status(&self, repo: &Repo, ci_number: i64) -> anyhow::Result<CiStatus>;

    /// Cancel a pipeline. Callers treat this as best-effort.
    async fn abort_ci(&self, repo: &Repo, ci_number: i64) -> anyhow::Result<()>;

    /// Post a comment on a PR.
    async fn pr_send_comment(&self, repo: &Repo, pr_number: i64, text: &str)
        -> anyhow::Result<()>;
}
