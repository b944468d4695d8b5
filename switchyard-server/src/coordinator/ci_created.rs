//! Association of newly created CI runs with enqueue records.

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
    /// Attach a CI run to the enqueue record for the commit it builds.
    ///
    /// CI events for commits that are not a speculative merge commit of any
    /// enqueued PR (the common case: ordinary branch pipelines, or builds of
    /// an `mq_commit` a rebuild has since invalidated) are dropped silently.
    /// Repeat creations for the same commit overwrite: last wins.
    ///
    /// This handler mutates a single record and takes no Git side effects,
    /// so it relies on store transaction serialisation rather than the
    /// per-queue lock.
    pub async fn on_ci_created(
        &self,
        repo_url: &str,
        ci_number: i64,
        commit: &str,
    ) -> Result<()> {
        let tx = self.store.begin()?;

        let Some(repo) = tx.repo_by_url(repo_url)? else {
            debug!(repo_url, "CI created for unknown repository, dropping");
            return Ok(());
        };
        let Some(mut record) = tx.enqueue_record_by_mq_commit(repo.id, commit)? else {
            debug!(repo_url, ci_number, commit, "CI for unrelated commit, dropping");
            return Ok(());
        };

        record.ci_number = Some(ci_number);
        record.finished = false;
        record.passed = false;
        tx.save_enqueue_record(&record)?;
        tx.commit()?;

        info!(
            repo_url,
            ci_number,
            commit,
            seq = record.seq,
            "associated CI run with enqueued PR"
        );
        Ok(())
    }
}
