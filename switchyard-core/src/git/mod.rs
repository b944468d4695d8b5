//! Capability surface over a local mirror of a remote repository.
//!
//! Every queue operation that touches Git goes through the [`GitOperator`]
//! trait: callers hold opaque handles for the repository, its branches and
//! its commit ids, and never see the backing library. All mutations act on
//! the local mirror; publishing to origin is a separate, explicit push.
//!
//! The one shipped implementation is [`libgit::LibGitOperator`], backed by
//! `git2`. No module outside `git::libgit` may import `git2`.

pub mod libgit;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name and email used to author commits created by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committer {
    pub name: String,
    pub email: String,
}

impl Committer {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

impl fmt::Display for Committer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

/// How a repository integrates a source branch into the working branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStyle {
    /// Two-parent merge commit on top of the working branch.
    Merge,
    /// Rebase the source commits onto the working branch; no merge commit.
    Linear,
    /// Rebase, then record a two-parent merge commit of the rebased chain.
    SemiLinear,
}

impl MergeStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStyle::Merge => "merge",
            MergeStyle::Linear => "linear",
            MergeStyle::SemiLinear => "semilinear",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "merge" => Some(MergeStyle::Merge),
            "linear" => Some(MergeStyle::Linear),
            "semilinear" => Some(MergeStyle::SemiLinear),
            _ => None,
        }
    }
}

impl fmt::Display for MergeStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for Git operator calls.
#[derive(Debug)]
pub enum GitError {
    /// A named branch does not exist on the local mirror.
    BranchNotFound(String),
    /// Branch creation was refused because the name is taken.
    BranchExists(String),
    /// A commit id string did not parse or does not denote a commit.
    InvalidCommitId(String),
    /// The backing Git library reported a failure.
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for GitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitError::BranchNotFound(name) => write!(f, "branch not found: {}", name),
            GitError::BranchExists(name) => write!(f, "branch already exists: {}", name),
            GitError::InvalidCommitId(s) => write!(f, "invalid commit id: {}", s),
            GitError::Backend(e) => write!(f, "git backend error: {}", e),
        }
    }
}

impl std::error::Error for GitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GitError::Backend(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Capability set over a local mirror.
///
/// The handle types are opaque to callers: a `Repo` is an open mirror, a
/// `Branch` names a local branch that existed when the handle was produced,
/// and a `CommitId` is a resolved commit. Commit ids cross persistence
/// boundaries only through [`format_commit_id`](GitOperator::format_commit_id)
/// and [`parse_commit_id`](GitOperator::parse_commit_id).
pub trait GitOperator: Send + Sync {
    type Repo: Send;
    type Branch: Clone + Send + fmt::Debug;
    type CommitId: Copy + Eq + Send + fmt::Debug;

    /// Clone the repository into the local mirror if absent, otherwise fetch
    /// all branch refs from origin.
    fn open_and_update(&self, url: &str, token: Option<&str>) -> Result<Self::Repo, GitError>;

    /// Look up a local branch by name.
    fn branch(&self, repo: &Self::Repo, name: &str) -> Result<Option<Self::Branch>, GitError>;

    /// The commit a branch currently points at.
    fn branch_tip(&self, repo: &Self::Repo, branch: &Self::Branch)
        -> Result<Self::CommitId, GitError>;

    /// Create a branch at a commit. Fails with [`GitError::BranchExists`] if
    /// the name is taken and `overwrite` is false.
    fn create_branch_at(
        &self,
        repo: &Self::Repo,
        name: &str,
        commit: Self::CommitId,
        overwrite: bool,
    ) -> Result<Self::Branch, GitError>;

    /// Message and committer identity of a commit.
    fn commit_info(
        &self,
        repo: &Self::Repo,
        commit: Self::CommitId,
    ) -> Result<(String, Committer), GitError>;

    /// Move a branch ref to a commit. Ref update only; nothing is checked out.
    fn reset_branch_to(
        &self,
        repo: &Self::Repo,
        branch: &Self::Branch,
        commit: Self::CommitId,
    ) -> Result<(), GitError>;

    /// Delete a local branch.
    fn remove_branch(&self, repo: &Self::Repo, branch: Self::Branch) -> Result<(), GitError>;

    /// Whether merging `source` into `target` would succeed, evaluated
    /// against the current tips.
    fn can_merge_without_conflict(
        &self,
        repo: &Self::Repo,
        target: &Self::Branch,
        source: &Self::Branch,
    ) -> Result<bool, GitError>;

    /// Produce a two-parent merge commit of `target` and `source`. Returns
    /// `None` on conflict. No ref is updated.
    fn merge(
        &self,
        repo: &Self::Repo,
        target: &Self::Branch,
        source: &Self::Branch,
        message: &str,
        committer: &Committer,
    ) -> Result<Option<Self::CommitId>, GitError>;

    /// Replay the commits of `source` that are not on `onto`, on top of
    /// `onto`'s tip. Returns the new tip, or `None` on conflict. No ref is
    /// updated.
    fn rebase(
        &self,
        repo: &Self::Repo,
        onto: &Self::Branch,
        source: &Self::Branch,
        committer: &Committer,
    ) -> Result<Option<Self::CommitId>, GitError>;

    /// Force-push a branch to origin.
    fn force_push(&self, repo: &Self::Repo, branch: &Self::Branch) -> Result<(), GitError>;

    /// Push a branch to origin without force; origin must fast-forward.
    fn push(&self, repo: &Self::Repo, branch: &Self::Branch) -> Result<(), GitError>;

    /// Resolve a commit id from its string form, verifying it denotes a
    /// commit present in the mirror.
    fn parse_commit_id(&self, repo: &Self::Repo, s: &str) -> Result<Self::CommitId, GitError>;

    /// String form of a commit id, suitable for persistence.
    fn format_commit_id(&self, commit: &Self::CommitId) -> String;

    /// Integrate `temp` (a scratch branch at the source tip) into `working`
    /// according to the merge style. Returns the resulting commit, or `None`
    /// on conflict. `working` itself is not moved; the caller resets it.
    fn perform_merge(
        &self,
        style: MergeStyle,
        repo: &Self::Repo,
        working: &Self::Branch,
        temp: &Self::Branch,
        message: &str,
        committer: &Committer,
    ) -> Result<Option<Self::CommitId>, GitError> {
        match style {
            MergeStyle::Merge => self.merge(repo, working, temp, message, committer),
            MergeStyle::Linear => self.rebase(repo, working, temp, committer),
            MergeStyle::SemiLinear => {
                let rebased = match self.rebase(repo, working, temp, committer)? {
                    Some(commit) => commit,
                    None => return Ok(None),
                };
                // Merge the rebased chain back so the history records both
                // parents; the rebased tip already descends from working, so
                // this merge cannot conflict.
                self.reset_branch_to(repo, temp, rebased)?;
                self.merge(repo, working, temp, message, committer)
            }
        }
    }
}
