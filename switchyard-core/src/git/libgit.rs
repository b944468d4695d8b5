//! `git2`-backed implementation of the Git operator.
//!
//! Mirrors are bare repositories kept under a configured root directory, one
//! per remote URL. Every ref mutation happens on the mirror; pushes publish
//! the mirror's refs back to origin. This module is the only place allowed to
//! import `git2`.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use git2::build::RepoBuilder;
use git2::{
    BranchType, Cred, ErrorCode, FetchOptions, FetchPrune, Oid, PushOptions, RemoteCallbacks,
    Repository, Signature,
};
use tracing::{debug, info};

use super::{Committer, GitError, GitOperator};

/// Refspec used for both clone and fetch so the mirror's `refs/heads/*`
/// tracks origin's exactly, including deletions on prune.
const MIRROR_REFSPEC: &str = "+refs/heads/*:refs/heads/*";

/// Handle to an open local mirror.
pub struct MirrorRepo {
    inner: Repository,
    token: Option<String>,
}

/// Handle to a local branch that existed when the handle was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalBranch {
    name: String,
}

impl LocalBranch {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl From<git2::Error> for GitError {
    fn from(e: git2::Error) -> Self {
        GitError::Backend(Box::new(e))
    }
}

/// Git operator over bare mirrors rooted at a single directory.
pub struct LibGitOperator {
    mirror_root: PathBuf,
}

impl LibGitOperator {
    pub fn new(mirror_root: impl Into<PathBuf>) -> Self {
        Self {
            mirror_root: mirror_root.into(),
        }
    }

    /// Directory for the mirror of `url`: a sanitised prefix for operator
    /// legibility plus a hash suffix so distinct URLs never collide.
    fn mirror_path(&self, url: &str) -> PathBuf {
        let mut name: String = url
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        name.truncate(80);
        let mut hasher = DefaultHasher::new();
        url.hash(&mut hasher);
        self.mirror_root
            .join(format!("{}-{:016x}.git", name, hasher.finish()))
    }

    fn remote_callbacks(token: Option<&str>) -> RemoteCallbacks<'static> {
        let mut callbacks = RemoteCallbacks::new();
        if let Some(token) = token {
            let token = token.to_string();
            callbacks.credentials(move |_url, _username, _allowed| {
                Cred::userpass_plaintext("oauth2", &token)
            });
        }
        callbacks
    }

    fn fetch_options(token: Option<&str>) -> FetchOptions<'static> {
        let mut options = FetchOptions::new();
        options.remote_callbacks(Self::remote_callbacks(token));
        options.prune(FetchPrune::On);
        options
    }

    fn find_commit<'r>(repo: &'r MirrorRepo, id: Oid) -> Result<git2::Commit<'r>, GitError> {
        repo.inner
            .find_commit(id)
            .map_err(|_| GitError::InvalidCommitId(id.to_string()))
    }

    fn signature(committer: &Committer) -> Result<Signature<'static>, GitError> {
        Ok(Signature::now(&committer.name, &committer.email)?)
    }

    fn push_refspec(&self, repo: &MirrorRepo, refspec: &str) -> Result<(), GitError> {
        let mut remote = repo.inner.find_remote("origin")?;
        let mut options = PushOptions::new();
        options.remote_callbacks(Self::remote_callbacks(repo.token.as_deref()));
        remote.push(&[refspec], Some(&mut options))?;
        Ok(())
    }
}

impl GitOperator for LibGitOperator {
    type Repo = MirrorRepo;
    type Branch = LocalBranch;
    type CommitId = Oid;

    fn open_and_update(&self, url: &str, token: Option<&str>) -> Result<MirrorRepo, GitError> {
        let path = self.mirror_path(url);
        let inner = if path.exists() {
            let repo = Repository::open_bare(&path)?;
            {
                let mut remote = repo.find_remote("origin")?;
                let mut options = Self::fetch_options(token);
                remote.fetch(&[MIRROR_REFSPEC], Some(&mut options), None)?;
            }
            debug!(url, mirror = %path.display(), "fetched mirror");
            repo
        } else {
            info!(url, mirror = %path.display(), "cloning mirror");
            std::fs::create_dir_all(&self.mirror_root)
                .map_err(|e| GitError::Backend(Box::new(e)))?;
            RepoBuilder::new()
                .bare(true)
                .remote_create(|repo, name, url| repo.remote_with_fetch(name, url, MIRROR_REFSPEC))
                .fetch_options(Self::fetch_options(token))
                .clone(url, &path)?
        };
        Ok(MirrorRepo {
            inner,
            token: token.map(str::to_string),
        })
    }

    fn branch(&self, repo: &MirrorRepo, name: &str) -> Result<Option<LocalBranch>, GitError> {
        match repo.inner.find_branch(name, BranchType::Local) {
            Ok(_) => Ok(Some(LocalBranch {
                name: name.to_string(),
            })),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn branch_tip(&self, repo: &MirrorRepo, branch: &LocalBranch) -> Result<Oid, GitError> {
        let found = repo
            .inner
            .find_branch(&branch.name, BranchType::Local)
            .map_err(|_| GitError::BranchNotFound(branch.name.clone()))?;
        Ok(found.get().peel_to_commit()?.id())
    }

    fn create_branch_at(
        &self,
        repo: &MirrorRepo,
        name: &str,
        commit: Oid,
        overwrite: bool,
    ) -> Result<LocalBranch, GitError> {
        let target = Self::find_commit(repo, commit)?;
        match repo.inner.branch(name, &target, overwrite) {
            Ok(_) => Ok(LocalBranch {
                name: name.to_string(),
            }),
            Err(e) if e.code() == ErrorCode::Exists => Err(GitError::BranchExists(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn commit_info(&self, repo: &MirrorRepo, commit: Oid) -> Result<(String, Committer), GitError> {
        let commit = Self::find_commit(repo, commit)?;
        let message = commit.message().unwrap_or_default().to_string();
        let signature = commit.committer();
        let committer = Committer::new(
            signature.name().unwrap_or_default(),
            signature.email().unwrap_or_default(),
        );
        Ok((message, committer))
    }

    fn reset_branch_to(
        &self,
        repo: &MirrorRepo,
        branch: &LocalBranch,
        commit: Oid,
    ) -> Result<(), GitError> {
        Self::find_commit(repo, commit)?;
        repo.inner.reference(
            &format!("refs/heads/{}", branch.name),
            commit,
            true,
            "switchyard: reset",
        )?;
        Ok(())
    }

    fn remove_branch(&self, repo: &MirrorRepo, branch: LocalBranch) -> Result<(), GitError> {
        let mut found = repo
            .inner
            .find_branch(&branch.name, BranchType::Local)
            .map_err(|_| GitError::BranchNotFound(branch.name.clone()))?;
        found.delete()?;
        Ok(())
    }

    fn can_merge_without_conflict(
        &self,
        repo: &MirrorRepo,
        target: &LocalBranch,
        source: &LocalBranch,
    ) -> Result<bool, GitError> {
        let ours = Self::find_commit(repo, self.branch_tip(repo, target)?)?;
        let theirs = Self::find_commit(repo, self.branch_tip(repo, source)?)?;
        let index = repo.inner.merge_commits(&ours, &theirs, None)?;
        Ok(!index.has_conflicts())
    }

    fn merge(
        &self,
        repo: &MirrorRepo,
        target: &LocalBranch,
        source: &LocalBranch,
        message: &str,
        committer: &Committer,
    ) -> Result<Option<Oid>, GitError> {
        let ours = Self::find_commit(repo, self.branch_tip(repo, target)?)?;
        let theirs = Self::find_commit(repo, self.branch_tip(repo, source)?)?;
        let mut index = repo.inner.merge_commits(&ours, &theirs, None)?;
        if index.has_conflicts() {
            debug!(target = %target.name, source = %source.name, "merge conflict");
            return Ok(None);
        }
        let tree_id = index.write_tree_to(&repo.inner)?;
        let tree = repo.inner.find_tree(tree_id)?;
        let signature = Self::signature(committer)?;
        let commit = repo.inner.commit(
            None,
            &signature,
            &signature,
            message,
            &tree,
            &[&ours, &theirs],
        )?;
        Ok(Some(commit))
    }

    fn rebase(
        &self,
        repo: &MirrorRepo,
        onto: &LocalBranch,
        source: &LocalBranch,
        committer: &Committer,
    ) -> Result<Option<Oid>, GitError> {
        let onto_tip = self.branch_tip(repo, onto)?;
        let source_tip = self.branch_tip(repo, source)?;
        let branch = repo.inner.find_annotated_commit(source_tip)?;
        let upstream = repo.inner.find_annotated_commit(onto_tip)?;

        let mut options = git2::RebaseOptions::new();
        options.inmemory(true);
        let mut rebase = repo.inner.rebase(
            Some(&branch),
            Some(&upstream),
            Some(&upstream),
            Some(&mut options),
        )?;

        let signature = Self::signature(committer)?;
        let mut tip = onto_tip;
        while let Some(operation) = rebase.next() {
            operation?;
            if rebase.inmemory_index()?.has_conflicts() {
                debug!(onto = %onto.name, source = %source.name, "rebase conflict");
                return Ok(None);
            }
            tip = rebase.commit(None, &signature, None)?;
        }
        rebase.finish(None)?;
        Ok(Some(tip))
    }

    fn force_push(&self, repo: &MirrorRepo, branch: &LocalBranch) -> Result<(), GitError> {
        self.push_refspec(
            repo,
            &format!("+refs/heads/{0}:refs/heads/{0}", branch.name),
        )
    }

    fn push(&self, repo: &MirrorRepo, branch: &LocalBranch) -> Result<(), GitError> {
        self.push_refspec(repo, &format!("refs/heads/{0}:refs/heads/{0}", branch.name))
    }

    fn parse_commit_id(&self, repo: &MirrorRepo, s: &str) -> Result<Oid, GitError> {
        let id = Oid::from_str(s).map_err(|_| GitError::InvalidCommitId(s.to_string()))?;
        Self::find_commit(repo, id)?;
        Ok(id)
    }

    fn format_commit_id(&self, commit: &Oid) -> String {
        commit.to_string()
    }
}
