//! Handling of enqueue requests.

use anyhow::anyhow;
use chrono::Utc;
use tracing::info;

use switchyard_core::{Committer, GitOperator};

use crate::host::{CiStatus, VcsHost};
use crate::store::{EnqueueRecord, Store, StoreTx};

use super::ordering::insertion_point;
use super::rebuild::{RebuildEntry, RebuildOutcome};
use super::{Coordinator, EnqueueError};

/// What happened to the queue under the lock, handed back up to the async
/// caller so the store transaction (non-`Send` across `.await`) never needs
/// to live past this point.
enum EnqueueOutcome {
    Appended { seq: i64 },
    Inserted { outcome: RebuildOutcome },
}

impl<S, G, H> Coordinator<S, G, H>
where
    S: Store,
    G: GitOperator,
    H: VcsHost,
{
    /// Put a PR into its merge queue.
    ///
    /// Preconditions are checked in order and the first failure wins: the PR
    /// must be known and not already enqueued, then its own CI must have
    /// passed. Insertion appends when the tail's priority is at least the
    /// newcomer's (FIFO among equal priorities); otherwise the queue suffix
    /// from the first lower-priority position is rebuilt with the newcomer
    /// in front of it.
    pub async fn on_enqueue_request(
        &self,
        repo_url: &str,
        pr_number: i64,
        committer: &Committer,
    ) -> Result<(), EnqueueError> {
        // Precondition reads and the CI check don't touch the queue, so they
        // run before the queue lock.
        let (repo, pr) = {
            let tx = self.store.begin()?;
            let repo = tx.repo_by_url(repo_url)?.ok_or_else(|| {
                EnqueueError::Internal(anyhow!("unknown repository: {}", repo_url))
            })?;
            let pr = tx.pull_request(repo.id, pr_number)?.ok_or_else(|| {
                EnqueueError::Internal(anyhow!("unknown PR {} in {}", pr_number, repo_url))
            })?;
            if tx.enqueue_record_for_pr(pr.id)?.is_some() {
                return Err(EnqueueError::AlreadyEnqueued);
            }
            (repo, pr)
        };

        match self.host.pr_ci_status(&repo, pr_number).await? {
            CiStatus::Passed => {}
            CiStatus::Failed => return Err(EnqueueError::CiFailed),
            CiStatus::NotFinished => return Err(EnqueueError::CiStillRunning),
        }

        let _guard = self.locks.acquire(pr.merge_queue_id).await;
        let git_repo = self
            .git
            .open_and_update(&repo.url, repo.access_token.as_deref())?;

        // The store transaction below holds a non-`Send` connection guard, so
        // it's confined to this synchronous call and never crosses an
        // `.await` in this function.
        match self.enqueue_under_lock(&repo, &pr, &git_repo, committer)? {
            EnqueueOutcome::Appended { seq } => {
                info!(repo_url, pr = pr.number, seq, "appended PR to merge queue");
                Ok(())
            }
            EnqueueOutcome::Inserted { outcome } => {
                self.abort_stale_pipelines(&repo, &outcome.stale_cis).await;
                let displaced: Vec<_> = outcome
                    .failed
                    .iter()
                    .filter(|dropped| dropped.id != pr.id)
                    .cloned()
                    .collect();
                self.notify_dropped(
                    &repo,
                    &displaced,
                    "re-merging it onto the new queue order produced a conflict; \
                     rebase it and enqueue again",
                )
                .await;

                if outcome.failed.iter().any(|dropped| dropped.id == pr.id) {
                    return Err(EnqueueError::MergeConflict);
                }
                info!(
                    repo_url,
                    pr = pr.number,
                    priority = pr.priority,
                    "inserted PR by priority; queue rebuilt"
                );
                Ok(())
            }
        }
    }

    /// Synchronous half of [`Self::on_enqueue_request`]: everything that
    /// touches the store transaction, run entirely under the queue lock.
    /// Kept out of the `async fn` above so the transaction (not `Send`)
    /// never has to survive across an `.await`.
    fn enqueue_under_lock(
        &self,
        repo: &crate::store::Repo,
        pr: &crate::store::PullRequest,
        git_repo: &G::Repo,
        committer: &Committer,
    ) -> Result<EnqueueOutcome, EnqueueError> {
        let tx = self.store.begin()?;
        // Re-check under the lock: a concurrent request may have won the race.
        if tx.enqueue_record_for_pr(pr.id)?.is_some() {
            return Err(EnqueueError::AlreadyEnqueued);
        }
        let mut queue = tx.merge_queue_for_pr(pr.id)?.ok_or_else(|| {
            EnqueueError::Internal(anyhow!("PR {} has no merge queue", pr.number))
        })?;
        let tail = tx.tail_pull_request(&queue)?;

        let append = tail
            .as_ref()
            .map_or(true, |(tail_pr, _)| tail_pr.priority >= pr.priority);

        if append {
            if queue.is_empty() {
                // The speculative chain restarts at the target tip.
                self.reset_working_to_target(git_repo, &queue)?;
            }
            let message = self.merge_message(pr, &queue);
            let commit = self
                .speculative_merge(git_repo, repo.merge_style, &queue, pr, &message, committer)?
                .ok_or(EnqueueError::MergeConflict)?;

            tx.add_enqueue_record(&EnqueueRecord {
                pr_id: pr.id,
                merge_queue_id: queue.id,
                seq: queue.tail_seq,
                associated_branch: queue.working_branch.clone(),
                mq_commit: self.git.format_commit_id(&commit),
                ci_number: None,
                finished: false,
                passed: false,
                enqueued_at: Utc::now().to_rfc3339(),
            })?;
            let seq = queue.tail_seq;
            queue.tail_seq += 1;
            tx.save_merge_queue(&queue)?;
            tx.commit()?;
            self.publish_working_branch(git_repo, &queue)?;

            Ok(EnqueueOutcome::Appended { seq })
        } else {
            // Priority insert: rebuild from the first position the newcomer
            // outranks, keeping everything ahead of it untouched.
            let enqueued = tx.enqueued_pull_requests(queue.id)?;
            let priorities: Vec<i64> = enqueued.iter().map(|(p, _)| p.priority).collect();
            let at = insertion_point(&priorities, pr.priority);
            let anchor = if at > 0 {
                Some(enqueued[at - 1].1.clone())
            } else {
                None
            };
            let mut entries = vec![RebuildEntry {
                pr: pr.clone(),
                prior: None,
            }];
            entries.extend(
                enqueued
                    .into_iter()
                    .skip(at)
                    .map(|(pr, record)| RebuildEntry {
                        pr,
                        prior: Some(record),
                    }),
            );

            let outcome = self.rebuild(
                &tx,
                git_repo,
                repo.merge_style,
                &mut queue,
                anchor,
                entries,
                Some(committer),
            )?;
            tx.commit()?;
            self.publish_working_branch(git_repo, &queue)?;

            Ok(EnqueueOutcome::Inserted { outcome })
        }
    }
}
