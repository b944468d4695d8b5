//! The merge queue state machine.
//!
//! The coordinator holds no mutable state of its own: it consumes events
//! (PR opened, enqueue request, CI created, CI finished) and reconciles the
//! store, the Git operator and the VCS host under one store transaction per
//! event. Handlers for the same merge queue serialise on a per-queue lock;
//! handlers for different queues run in parallel.
//!
//! Local Git mutations are idempotent and re-derivable from the persisted
//! queue state, so a handler that fails after touching the mirror leaves
//! nothing that the next event cannot rebuild.

mod ci_created;
mod ci_finished;
mod enqueue;
mod locks;
mod opened;
mod ordering;
mod rebuild;
mod speculative;

pub use locks::QueueLocks;

use std::fmt;
use std::sync::Arc;

use switchyard_core::GitOperator;

use crate::host::VcsHost;
use crate::store::Store;

/// Why an enqueue request was refused.
///
/// These surface to the requester (the front-end echoes them as a PR
/// comment). Everything that is not one of the four refusals is an internal
/// fault: the transaction is rolled back and the queue re-converges on the
/// next event.
#[derive(Debug)]
pub enum EnqueueError {
    /// The PR already has an enqueue record.
    AlreadyEnqueued,
    /// The PR's own CI has not finished yet.
    CiStillRunning,
    /// The PR's own CI failed.
    CiFailed,
    /// The speculative merge could not be produced.
    MergeConflict,
    /// Store, Git or host failure; not the requester's fault.
    Internal(anyhow::Error),
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::AlreadyEnqueued => write!(f, "already enqueued"),
            EnqueueError::CiStillRunning => write!(f, "CI for this PR is still running"),
            EnqueueError::CiFailed => write!(f, "CI for this PR failed"),
            EnqueueError::MergeConflict => write!(f, "merging would conflict"),
            EnqueueError::Internal(e) => write!(f, "internal error: {:#}", e),
        }
    }
}

impl std::error::Error for EnqueueError {}

impl From<anyhow::Error> for EnqueueError {
    fn from(e: anyhow::Error) -> Self {
        EnqueueError::Internal(e)
    }
}

impl From<crate::store::StoreError> for EnqueueError {
    fn from(e: crate::store::StoreError) -> Self {
        EnqueueError::Internal(anyhow::Error::new(e))
    }
}

impl From<switchyard_core::GitError> for EnqueueError {
    fn from(e: switchyard_core::GitError) -> Self {
        EnqueueError::Internal(anyhow::Error::new(e))
    }
}

/// Stateless event processor over the three injected collaborators.
pub struct Coordinator<S, G, H> {
    store: Arc<S>,
    git: Arc<G>,
    host: Arc<H>,
    locks: QueueLocks,
}

impl<S, G, H> Coordinator<S, G, H>
where
    S: Store,
    G: GitOperator,
    H: VcsHost,
{
    pub fn new(store: Arc<S>, git: Arc<G>, host: Arc<H>) -> Self {
        Self {
            store,
            git,
            host,
            locks: QueueLocks::new(),
        }
    }
}
