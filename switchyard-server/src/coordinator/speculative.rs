//! The speculative-merge primitive and working-branch positioning.

use anyhow::{Context, Result};
use tracing::debug;

use switchyard_core::{Committer, GitOperator};

use crate::host::VcsHost;
use crate::store::{MergeQueue, PullRequest, Store};

use super::Coordinator;

impl<S, G, H> Coordinator<S, G, H>
where
    S: Store,
    G: GitOperator,
    H: VcsHost,
{
    /// Commit message for a PR entering the queue for the first time.
    /// Rebuilt entries reuse the message recovered from their prior commit.
    pub(super) fn merge_message(&self, pr: &PullRequest, queue: &MergeQueue) -> String {
        format!(
            "Merge {} into {} ({})",
            pr.source_branch,
            queue.working_branch,
            self.host.format_pr_number(pr.number)
        )
    }

    /// Speculatively integrate a PR's source branch into the working branch.
    ///
    /// Produces the merge (or rebase) commit dictated by the repo's merge
    /// style on a scratch branch `merge-<number>`, then advances the working
    /// branch to it. Returns `None` on conflict; the working branch is left
    /// untouched in that case. Missing source or working branches are fatal.
    pub(super) fn speculative_merge(
        &self,
        git_repo: &G::Repo,
        merge_style: switchyard_core::MergeStyle,
        queue: &MergeQueue,
        pr: &PullRequest,
        message: &str,
        committer: &Committer,
    ) -> Result<Option<G::CommitId>> {
        let source = self
            .git
            .branch(git_repo, &pr.source_branch)?
            .with_context(|| format!("source branch missing from mirror: {}", pr.source_branch))?;
        let working = self
            .git
            .branch(git_repo, &queue.working_branch)?
            .with_context(|| {
                format!("working branch missing from mirror: {}", queue.working_branch)
            })?;

        if !self
            .git
            .can_merge_without_conflict(git_repo, &working, &source)?
        {
            debug!(
                pr = pr.number,
                source = %pr.source_branch,
                working = %queue.working_branch,
                "speculative merge would conflict"
            );
            return Ok(None);
        }

        let source_tip = self.git.branch_tip(git_repo, &source)?;
        // Overwrite: a scratch branch left behind by an interrupted handler
        // is stale by definition.
        let temp = self
            .git
            .create_branch_at(git_repo, &format!("merge-{}", pr.number), source_tip, true)?;

        let result =
            self.git
                .perform_merge(merge_style, git_repo, &working, &temp, message, committer)?;
        if let Some(commit) = result {
            self.git.reset_branch_to(git_repo, &working, commit)?;
        }
        self.git.remove_branch(git_repo, temp)?;
        Ok(result)
    }

    /// Point the working branch at the target branch tip. Used when the
    /// speculative chain restarts from scratch: an append into an empty
    /// queue, or a rebuild without an anchor.
    pub(super) fn reset_working_to_target(
        &self,
        git_repo: &G::Repo,
        queue: &MergeQueue,
    ) -> Result<()> {
        let target = self
            .git
            .branch(git_repo, &queue.target_branch)?
            .with_context(|| {
                format!("target branch missing from mirror: {}", queue.target_branch)
            })?;
        let tip = self.git.branch_tip(git_repo, &target)?;
        self.git
            .create_branch_at(git_repo, &queue.working_branch, tip, true)?;
        Ok(())
    }

    /// Force-push the working branch so origin's copy matches the mirror.
    pub(super) fn publish_working_branch(
        &self,
        git_repo: &G::Repo,
        queue: &MergeQueue,
    ) -> Result<()> {
        let working = self
            .git
            .branch(git_repo, &queue.working_branch)?
            .with_context(|| {
                format!("working branch missing from mirror: {}", queue.working_branch)
            })?;
        self.git.force_push(git_repo, &working)?;
        Ok(())
    }
}
