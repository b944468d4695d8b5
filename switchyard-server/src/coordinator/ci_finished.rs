//! Handling of finished CI runs: head-dequeue on success, rebuild on failure.

use anyhow::{Context, Result};
use tracing::{debug, info};

use switchyard_core::{GitOperator, MergeStyle};

use crate::host::VcsHost;
use crate::store::{EnqueueRecord, MergeQueue, PullRequest, Store, StoreTx};

use super::ordering::passing_prefix;
use super::rebuild::{RebuildEntry, RebuildOutcome};
use super::Coordinator;

impl<S, G, H> Coordinator<S, G, H>
where
    S: Store,
    G: GitOperator,
    H: VcsHost,
{
    /// React to a CI run reaching a terminal state.
    ///
    /// Runs that no enqueue record claims are dropped silently: they are
    /// ordinary branch pipelines, or builds of a speculative commit a
    /// rebuild has since replaced.
    pub async fn on_ci_finished(
        &self,
        repo_url: &str,
        ci_number: i64,
        success: bool,
    ) -> Result<()> {
        // Locate the queue first; the lock must be held before the real read.
        let located = {
            let tx = self.store.begin()?;
            match tx.repo_by_url(repo_url)? {
                None => {
                    debug!(repo_url, "CI finished for unknown repository, dropping");
                    None
                }
                Some(repo) => tx
                    .enqueue_record_by_ci_number(repo.id, ci_number)?
                    .map(|record| (repo, record.merge_queue_id)),
            }
        };
        let Some((repo, merge_queue_id)) = located else {
            debug!(repo_url, ci_number, "CI finished for unknown run, dropping");
            return Ok(());
        };

        let _guard = self.locks.acquire(merge_queue_id).await;
        let git_repo = self
            .git
            .open_and_update(&repo.url, repo.access_token.as_deref())?;

        // The transaction holds the store connection, so all store and Git
        // work happens in this synchronous block; only the best-effort host
        // notifications happen afterwards.
        let dropped = {
            let tx = self.store.begin()?;
            // Re-find under the lock: a rebuild may have replaced the record.
            let Some(mut record) = tx.enqueue_record_by_ci_number(repo.id, ci_number)? else {
                debug!(repo_url, ci_number, "CI run no longer tracked, dropping");
                return Ok(());
            };
            let mut queue = tx
                .merge_queue_for_pr(record.pr_id)?
                .context("enqueued PR has no merge queue")?;

            record.finished = true;
            record.passed = success;
            tx.save_enqueue_record(&record)?;

            if success {
                self.dequeue_passing_prefix(tx, &git_repo, &mut queue)?;
                None
            } else {
                Some(self.drop_failed_and_rebuild(
                    tx,
                    &git_repo,
                    repo.merge_style,
                    &mut queue,
                    record,
                )?)
            }
        };

        if let Some((failed_pr, outcome)) = dropped {
            self.abort_stale_pipelines(&repo, &outcome.stale_cis).await;
            self.notify_dropped(
                &repo,
                &[failed_pr],
                "CI failed for its speculative merge commit",
            )
            .await;
            self.notify_dropped(
                &repo,
                &outcome.failed,
                "re-merging it after an earlier failure produced a conflict; \
                 rebase it and enqueue again",
            )
            .await;
        }
        Ok(())
    }

    /// Fast-forward the target branch over the maximal passing prefix.
    ///
    /// A later PR that passes before its predecessors only latches its flag;
    /// nothing is merged until the prefix condition holds from the head.
    fn dequeue_passing_prefix(
        &self,
        tx: S::Tx<'_>,
        git_repo: &G::Repo,
        queue: &mut MergeQueue,
    ) -> Result<()> {
        let enqueued = tx.enqueued_pull_requests(queue.id)?;
        let records: Vec<&EnqueueRecord> = enqueued.iter().map(|(_, record)| record).collect();
        let prefix = passing_prefix(&records);
        if prefix == 0 {
            tx.commit()?;
            info!(
                queue = queue.id,
                "pass latched; waiting for earlier PRs to finish"
            );
            return Ok(());
        }

        let (_, last_record) = &enqueued[prefix - 1];
        let commit = self.git.parse_commit_id(git_repo, &last_record.mq_commit)?;
        let target = self
            .git
            .branch(git_repo, &queue.target_branch)?
            .with_context(|| {
                format!("target branch missing from mirror: {}", queue.target_branch)
            })?;
        self.git.reset_branch_to(git_repo, &target, commit)?;
        // Publish before committing: if the store commit fails afterwards,
        // the next CI event recomputes the same prefix and repeats this
        // fast-forward, which is idempotent.
        self.git.push(git_repo, &target)?;

        for (pr, _) in &enqueued[..prefix] {
            tx.remove_enqueue_record(pr.id)?;
        }
        queue.head_seq = last_record.seq + 1;
        tx.save_merge_queue(queue)?;
        tx.commit()?;

        info!(
            queue = queue.id,
            merged = prefix,
            target = %queue.target_branch,
            commit = %last_record.mq_commit,
            "fast-forwarded target branch"
        );
        Ok(())
    }

    /// Remove a PR whose speculative build failed and replay its successors
    /// from its former position. Returns the dropped PR and the rebuild
    /// outcome so the caller can notify and cancel stale pipelines.
    fn drop_failed_and_rebuild(
        &self,
        tx: S::Tx<'_>,
        git_repo: &G::Repo,
        merge_style: MergeStyle,
        queue: &mut MergeQueue,
        failed_record: EnqueueRecord,
    ) -> Result<(PullRequest, RebuildOutcome)> {
        let failed_pr = tx
            .pull_request_by_id(failed_record.pr_id)?
            .context("enqueue record without a PR")?;
        tx.remove_enqueue_record(failed_record.pr_id)?;

        let remaining = tx.enqueued_pull_requests(queue.id)?;
        let anchor = remaining
            .iter()
            .rev()
            .find(|(_, record)| record.seq < failed_record.seq)
            .map(|(_, record)| record.clone());
        let entries: Vec<RebuildEntry> = remaining
            .into_iter()
            .filter(|(_, record)| record.seq > failed_record.seq)
            .map(|(pr, record)| RebuildEntry {
                pr,
                prior: Some(record),
            })
            .collect();

        let outcome = self.rebuild(&tx, git_repo, merge_style, queue, anchor, entries, None)?;
        tx.commit()?;
        self.publish_working_branch(git_repo, queue)?;

        info!(
            queue = queue.id,
            pr = failed_pr.number,
            "PR dropped after failed CI; queue rebuilt"
        );
        Ok((failed_pr, outcome))
    }
}
