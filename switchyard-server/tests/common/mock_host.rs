//! Mock VCS host for driving the coordinator without a GitLab instance.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use switchyard_server::host::{CiStatus, VcsHost};
use switchyard_server::store::Repo;

/// Programmable host: tests set per-PR CI statuses up front and inspect the
/// comments and pipeline cancellations the coordinator issued.
#[derive(Default)]
pub struct MockHost {
    pr_statuses: Mutex<HashMap<i64, CiStatus>>,
    comments: Mutex<Vec<(i64, String)>>,
    aborted: Mutex<Vec<i64>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pr_ci_status(&self, pr_number: i64, status: CiStatus) {
        self.pr_statuses
            .lock()
            .unwrap()
            .insert(pr_number, status);
    }

    pub fn comments(&self) -> Vec<(i64, String)> {
        self.comments.lock().unwrap().clone()
    }

    pub fn aborted(&self) -> Vec<i64> {
        self.aborted.lock().unwrap().clone()
    }
}

#[async_trait]
impl VcsHost for MockHost {
    fn format_pr_number(&self, number: i64) -> String {
        format!("!{}", number)
    }

    async fn pr_ci_status(&self, _repo: &Repo, pr_number: i64) -> anyhow::Result<CiStatus> {
        Ok(self
            .pr_statuses
            .lock()
            .unwrap()
            .get(&pr_number)
            .copied()
            .unwrap_or(CiStatus::NotFinished))
    }

    async fn ci_status(&self, _repo: &Repo, _ci_number: i64) -> anyhow::Result<CiStatus> {
        Ok(CiStatus::NotFinished)
    }

    async fn abort_ci(&self, _repo: &Repo, ci_number: i64) -> anyhow::Result<()> {
        self.aborted.lock().unwrap().push(ci_number);
        Ok(())
    }

    async fn pr_send_comment(
        &self,
        _repo: &Repo,
        pr_number: i64,
        text: &str,
    ) -> anyhow::Result<()> {
        self.comments
            .lock()
            .unwrap()
            .push((pr_number, text.to_string()));
        Ok(())
    }
}
