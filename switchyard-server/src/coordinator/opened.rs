//! Handling of newly opened pull requests.

use anyhow::Result;
use tracing::{debug, info};

use switchyard_core::GitOperator;

use crate::host::VcsHost;
use crate::store::{Store, StoreTx};

use super::Coordinator;

impl<S, G, H> Coordinator<S, G, H>
where
    S: Store,
    G: GitOperator,
    H: VcsHost,
{
    /// Register an opened PR so a later enqueue request can find it.
    ///
    /// Events for unknown repositories, or for target branches without a
    /// merge queue, are dropped without error. Re-delivery of the same open
    /// event is a no-op: insertion is idempotent by (repo, number).
    pub async fn on_pr_opened(
        &self,
        repo_url: &str,
        pr_number: i64,
        priority: i64,
        source_branch: &str,
        target_branch: &str,
    ) -> Result<()> {
        let tx = self.store.begin()?;

        let Some(repo) = tx.repo_by_url(repo_url)? else {
            debug!(repo_url, "PR opened for unknown repository, dropping");
            return Ok(());
        };
        let Some(queue) = tx.merge_queue_by_repo_and_branch(repo.id, target_branch)? else {
            debug!(
                repo_url,
                target_branch, "no merge queue for target branch, dropping"
            );
            return Ok(());
        };
        if tx.pull_request(repo.id, pr_number)?.is_some() {
            debug!(repo_url, pr_number, "PR already known");
            return Ok(());
        }

        tx.add_pull_request(
            repo.id,
            queue.id,
            pr_number,
            source_branch,
            target_branch,
            priority,
        )?;
        tx.commit()?;

        info!(repo_url, pr_number, priority, source_branch, "registered PR");
        Ok(())
    }
}
