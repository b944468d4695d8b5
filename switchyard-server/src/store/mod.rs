//! Persistence for repositories, merge queues, pull requests and enqueue
//! records.
//!
//! The [`Store`] trait abstracts the storage backend behind explicit
//! transactions: every coordinator event runs all of its reads and writes
//! inside one [`StoreTx`] so it observes a consistent queue snapshot, and the
//! transaction rolls back on drop unless committed. One backend ships,
//! [`SqliteStore`].

mod sqlite;

pub use sqlite::SqliteStore;

use std::fmt;

use serde::{Deserialize, Serialize};

use switchyard_core::MergeStyle;

/// Error type for store operations.
///
/// Callers can distinguish "not found" (`Ok(None)`) from "storage failed"
/// (`Err`), which matters for the silent-drop paths: an unknown CI number is
/// dropped, a broken database is not.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Storage backend is unavailable or failed.
    Storage { operation: String, detail: String },
    /// Persisted data is invalid (unparseable enum text, broken invariant).
    Corruption(String),
}

impl StoreError {
    pub fn storage(operation: impl Into<String>, detail: impl fmt::Display) -> Self {
        StoreError::Storage {
            operation: operation.into(),
            detail: detail.to_string(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Storage { operation, detail } => {
                write!(f, "storage error during {}: {}", operation, detail)
            }
            StoreError::Corruption(msg) => write!(f, "data corruption: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Which VCS host a repository lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoKind {
    GitLab,
}

impl RepoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoKind::GitLab => "gitlab",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gitlab" => Some(RepoKind::GitLab),
            _ => None,
        }
    }
}

/// A managed repository. Immutable after creation apart from config reloads.
#[derive(Debug, Clone)]
pub struct Repo {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub kind: RepoKind,
    pub access_token: Option<String>,
    pub merge_style: MergeStyle,
}

/// Input for seeding a repository from configuration.
#[derive(Debug, Clone)]
pub struct RepoSpec {
    pub name: String,
    pub url: String,
    pub kind: RepoKind,
    pub access_token: Option<String>,
    pub merge_style: MergeStyle,
}

/// One merge queue per (repository, target branch).
///
/// Live sequence numbers are the half-open range `[head_seq, tail_seq)`;
/// `tail_seq` is the next slot to be allocated, so the queue is empty iff
/// `head_seq == tail_seq`.
#[derive(Debug, Clone)]
pub struct MergeQueue {
    pub id: i64,
    pub repo_id: i64,
    pub target_branch: String,
    pub working_branch: String,
    pub head_seq: i64,
    pub tail_seq: i64,
}

impl MergeQueue {
    pub fn is_empty(&self) -> bool {
        self.head_seq == self.tail_seq
    }
}

/// A pull request known to the coordinator. Enqueued iff an
/// [`EnqueueRecord`] exists for it.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub id: i64,
    pub repo_id: i64,
    pub merge_queue_id: i64,
    pub number: i64,
    pub source_branch: String,
    pub target_branch: String,
    pub priority: i64,
}

/// Per-enqueue metadata, one-to-one with an enqueued pull request.
///
/// `mq_commit` is the speculative merge commit for this PR, in string form;
/// it is reachable from the working branch at creation time. `finished` and
/// `passed` latch the outcome of the CI run identified by `ci_number`.
#[derive(Debug, Clone)]
pub struct EnqueueRecord {
    pub pr_id: i64,
    pub merge_queue_id: i64,
    pub seq: i64,
    pub associated_branch: String,
    pub mq_commit: String,
    pub ci_number: Option<i64>,
    pub finished: bool,
    pub passed: bool,
    pub enqueued_at: String,
}

/// Storage backend seam.
///
/// The transaction type is generic so backends can hand out a scoped session
/// (for SQLite, a connection guard with an open `BEGIN IMMEDIATE`).
pub trait Store: Send + Sync {
    type Tx<'a>: StoreTx
    where
        Self: 'a;

    fn begin(&self) -> Result<Self::Tx<'_>, StoreError>;
}

/// One transaction. Rolls back on drop unless [`commit`](StoreTx::commit) is
/// called.
pub trait StoreTx {
    fn commit(self) -> Result<(), StoreError>;

    fn repo_by_url(&self, url: &str) -> Result<Option<Repo>, StoreError>;

    fn merge_queue_by_repo_and_branch(
        &self,
        repo_id: i64,
        target_branch: &str,
    ) -> Result<Option<MergeQueue>, StoreError>;

    fn merge_queue_for_pr(&self, pr_id: i64) -> Result<Option<MergeQueue>, StoreError>;

    fn pull_request(&self, repo_id: i64, number: i64) -> Result<Option<PullRequest>, StoreError>;

    fn pull_request_by_id(&self, id: i64) -> Result<Option<PullRequest>, StoreError>;

    /// The queue's tail entry: the PR at `seq = tail_seq - 1`, or `None` when
    /// the queue is empty.
    fn tail_pull_request(
        &self,
        queue: &MergeQueue,
    ) -> Result<Option<(PullRequest, EnqueueRecord)>, StoreError>;

    /// All enqueued PRs of a queue, ordered by `seq` ascending.
    fn enqueued_pull_requests(
        &self,
        merge_queue_id: i64,
    ) -> Result<Vec<(PullRequest, EnqueueRecord)>, StoreError>;

    fn enqueue_record_for_pr(&self, pr_id: i64) -> Result<Option<EnqueueRecord>, StoreError>;

    fn enqueue_record_by_mq_commit(
        &self,
        repo_id: i64,
        commit: &str,
    ) -> Result<Option<EnqueueRecord>, StoreError>;

    fn enqueue_record_by_ci_number(
        &self,
        repo_id: i64,
        ci_number: i64,
    ) -> Result<Option<EnqueueRecord>, StoreError>;

    fn add_pull_request(
        &self,
        repo_id: i64,
        merge_queue_id: i64,
        number: i64,
        source_branch: &str,
        target_branch: &str,
        priority: i64,
    ) -> Result<PullRequest, StoreError>;

    fn add_enqueue_record(&self, record: &EnqueueRecord) -> Result<(), StoreError>;

    /// Persist changed fields of an existing record (keyed by `pr_id`).
    fn save_enqueue_record(&self, record: &EnqueueRecord) -> Result<(), StoreError>;

    fn remove_enqueue_record(&self, pr_id: i64) -> Result<(), StoreError>;

    /// Persist changed sequence bounds of a queue.
    fn save_merge_queue(&self, queue: &MergeQueue) -> Result<(), StoreError>;

    /// Insert or refresh a repository from configuration, keyed by URL.
    fn upsert_repo(&self, spec: &RepoSpec) -> Result<Repo, StoreError>;

    /// Insert a queue for (repo, target branch) if absent; an existing
    /// queue keeps its sequence bounds and only the working branch is
    /// refreshed.
    fn upsert_merge_queue(
        &self,
        repo_id: i64,
        target_branch: &str,
        working_branch: &str,
    ) -> Result<MergeQueue, StoreError>;
}
