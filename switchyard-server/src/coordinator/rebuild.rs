//! Queue rebuilds: tear down and replay a suffix of the queue.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use switchyard_core::{Committer, GitOperator, MergeStyle};

use crate::host::VcsHost;
use crate::store::{EnqueueRecord, MergeQueue, PullRequest, Repo, Store, StoreTx};

use super::Coordinator;

/// One PR to (re-)enqueue during a rebuild, in queue order.
pub(super) struct RebuildEntry {
    pub pr: PullRequest,
    /// The record being replaced; `None` for a PR entering the queue fresh.
    pub prior: Option<EnqueueRecord>,
}

pub(super) struct RebuildOutcome {
    /// PRs whose speculative merge conflicted; they are out of the queue.
    pub failed: Vec<PullRequest>,
    /// CI runs of replaced records, to be cancelled best-effort after the
    /// transaction commits.
    pub stale_cis: Vec<i64>,
}

impl<S, G, H> Coordinator<S, G, H>
where
    S: Store,
    G: GitOperator,
    H: VcsHost,
{
    /// Replay `entries` on the working branch, starting just after `anchor`
    /// (or from the target branch tip when there is none).
    ///
    /// Each replayed PR gets a fresh speculative commit and enqueue record;
    /// its prior record, if any, is removed first, so a conflicting PR drops
    /// out of the queue entirely. Conflicts never abort the rebuild: the
    /// remaining PRs continue at the next sequence number. Prior pipelines
    /// need no explicit invalidation here: a CI event bearing a replaced
    /// `mq_commit` simply finds no record and is dropped.
    pub(super) fn rebuild(
        &self,
        tx: &S::Tx<'_>,
        git_repo: &G::Repo,
        merge_style: MergeStyle,
        queue: &mut MergeQueue,
        anchor: Option<EnqueueRecord>,
        entries: Vec<RebuildEntry>,
        fresh_committer: Option<&Committer>,
    ) -> Result<RebuildOutcome> {
        let mut seq = match &anchor {
            Some(anchor_record) => {
                let base = self.git.parse_commit_id(git_repo, &anchor_record.mq_commit)?;
                self.git
                    .create_branch_at(git_repo, &queue.working_branch, base, true)?;
                anchor_record.seq + 1
            }
            None => {
                self.reset_working_to_target(git_repo, queue)?;
                queue.head_seq
            }
        };

        let mut failed = Vec::new();
        let mut stale_cis = Vec::new();

        // Clear every replaced record up front: replayed entries may land on
        // sequence numbers still held by records later in the list, and the
        // (queue, seq) key is unique.
        for entry in &entries {
            if let Some(prior) = &entry.prior {
                tx.remove_enqueue_record(entry.pr.id)?;
                if let Some(ci_number) = prior.ci_number {
                    stale_cis.push(ci_number);
                }
            }
        }

        for entry in entries {
            let (message, committer) = match &entry.prior {
                Some(prior) => {
                    let prior_commit = self.git.parse_commit_id(git_repo, &prior.mq_commit)?;
                    self.git.commit_info(git_repo, prior_commit)?
                }
                None => {
                    let committer = fresh_committer
                        .context("rebuild entry without a prior record needs a committer")?;
                    (self.merge_message(&entry.pr, queue), committer.clone())
                }
            };

            match self.speculative_merge(
                git_repo,
                merge_style,
                queue,
                &entry.pr,
                &message,
                &committer,
            )? {
                Some(commit) => {
                    tx.add_enqueue_record(&EnqueueRecord {
                        pr_id: entry.pr.id,
                        merge_queue_id: queue.id,
                        seq,
                        associated_branch: queue.working_branch.clone(),
                        mq_commit: self.git.format_commit_id(&commit),
                        ci_number: None,
                        finished: false,
                        passed: false,
                        enqueued_at: Utc::now().to_rfc3339(),
                    })?;
                    seq += 1;
                }
                None => {
                    warn!(pr = entry.pr.number, "PR dropped from queue during rebuild");
                    failed.push(entry.pr);
                }
            }
        }

        queue.tail_seq = seq;
        tx.save_merge_queue(queue)?;

        info!(
            queue = queue.id,
            head_seq = queue.head_seq,
            tail_seq = queue.tail_seq,
            dropped = failed.len(),
            "rebuilt queue"
        );
        Ok(RebuildOutcome { failed, stale_cis })
    }

    /// Cancel CI runs of records a rebuild displaced. Best-effort and
    /// non-blocking for the event outcome: failures are logged and ignored.
    pub(super) async fn abort_stale_pipelines(&self, repo: &Repo, stale_cis: &[i64]) {
        for &ci_number in stale_cis {
            if let Err(e) = self.host.abort_ci(repo, ci_number).await {
                warn!(ci_number, error = %format!("{:#}", e), "failed to abort stale CI run");
            }
        }
    }

    /// Tell authors their PR fell out of the queue. Best-effort.
    pub(super) async fn notify_dropped(&self, repo: &Repo, dropped: &[PullRequest], reason: &str) {
        for pr in dropped {
            let text = format!(
                "{} was removed from the merge queue: {}",
                self.host.format_pr_number(pr.number),
                reason
            );
            if let Err(e) = self.host.pr_send_comment(repo, pr.number, &text).await {
                warn!(pr = pr.number, error = %format!("{:#}", e), "failed to notify author");
            }
        }
    }
}
