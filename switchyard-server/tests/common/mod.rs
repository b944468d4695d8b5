//! Shared harness for queue scenario tests: a real bare origin repository,
//! real mirrors via the git2 operator, an in-memory store, and a mock host.

pub mod mock_host;

use std::sync::Arc;

use git2::{Oid, Repository, Signature};
use tempfile::TempDir;

use switchyard_core::{Committer, LibGitOperator, MergeStyle};
use switchyard_server::coordinator::Coordinator;
use switchyard_server::store::{
    EnqueueRecord, MergeQueue, PullRequest, RepoKind, RepoSpec, SqliteStore, Store, StoreTx,
};

use mock_host::MockHost;

pub const TARGET_BRANCH: &str = "master";
pub const WORKING_BRANCH: &str = "merge-queue";

pub fn mock_committer() -> Committer {
    Committer::new("Mock Committer", "i@example.com")
}

/// Write a commit directly into the bare origin: `files` layer onto the
/// parent's tree and `branch` is moved to the new commit.
pub fn commit_files(
    repo: &Repository,
    branch: &str,
    parent: Option<Oid>,
    files: &[(&str, &str)],
    message: &str,
) -> Oid {
    let parent_commits: Vec<git2::Commit<'_>> = parent
        .into_iter()
        .map(|id| repo.find_commit(id).unwrap())
        .collect();
    let parent_refs: Vec<&git2::Commit<'_>> = parent_commits.iter().collect();

    let base_tree = parent_commits.first().map(|c| c.tree().unwrap());
    let mut builder = repo.treebuilder(base_tree.as_ref()).unwrap();
    for (name, content) in files {
        let blob = repo.blob(content.as_bytes()).unwrap();
        builder.insert(name, blob, 0o100644).unwrap();
    }
    let tree = repo.find_tree(builder.write().unwrap()).unwrap();

    let signature = Signature::now("Origin Author", "author@example.com").unwrap();
    repo.commit(
        Some(&format!("refs/heads/{}", branch)),
        &signature,
        &signature,
        message,
        &tree,
        &parent_refs,
    )
    .unwrap()
}

pub struct Harness {
    _dir: TempDir,
    pub origin: Repository,
    pub repo_url: String,
    pub store: Arc<SqliteStore>,
    pub host: Arc<MockHost>,
    pub coordinator: Coordinator<SqliteStore, LibGitOperator, MockHost>,
    pub master_tip: Oid,
}

impl Harness {
    /// One repo, one queue (`master` / `merge-queue`), an initial commit
    /// containing `file1.txt = "Hello, world!"`.
    pub fn new(merge_style: MergeStyle) -> Self {
        let dir = TempDir::new().unwrap();
        let origin_path = dir.path().join("origin.git");
        let origin = Repository::init_bare(&origin_path).unwrap();
        let master_tip = commit_files(
            &origin,
            TARGET_BRANCH,
            None,
            &[("file1.txt", "Hello, world!")],
            "initial commit",
        );
        origin.set_head("refs/heads/master").unwrap();

        let repo_url = origin_path.to_string_lossy().into_owned();

        let store = Arc::new(SqliteStore::in_memory().unwrap());
        {
            let tx = store.begin().unwrap();
            let repo = tx
                .upsert_repo(&RepoSpec {
                    name: "Test Repo".to_string(),
                    url: repo_url.clone(),
                    kind: RepoKind::GitLab,
                    access_token: None,
                    merge_style,
                })
                .unwrap();
            tx.upsert_merge_queue(repo.id, TARGET_BRANCH, WORKING_BRANCH)
                .unwrap();
            tx.commit().unwrap();
        }

        let operator = Arc::new(LibGitOperator::new(dir.path().join("mirrors")));
        let host = Arc::new(MockHost::new());
        let coordinator = Coordinator::new(Arc::clone(&store), operator, Arc::clone(&host));

        Self {
            _dir: dir,
            origin,
            repo_url,
            store,
            host,
            coordinator,
            master_tip,
        }
    }

    /// Create a branch in origin with one commit on top of master's initial
    /// commit, and return that commit.
    pub fn origin_branch(&self, name: &str, files: &[(&str, &str)]) -> Oid {
        commit_files(
            &self.origin,
            name,
            Some(self.master_tip),
            files,
            &format!("commit on {}", name),
        )
    }

    /// Origin's current tip of a branch.
    pub fn origin_tip(&self, branch: &str) -> Oid {
        self.origin
            .find_reference(&format!("refs/heads/{}", branch))
            .unwrap()
            .target()
            .unwrap()
    }

    pub fn origin_has_branch(&self, branch: &str) -> bool {
        self.origin
            .find_reference(&format!("refs/heads/{}", branch))
            .is_ok()
    }

    /// The queue row and its enqueued (PR, record) pairs, in seq order.
    pub fn queue_state(&self) -> (MergeQueue, Vec<(PullRequest, EnqueueRecord)>) {
        let tx = self.store.begin().unwrap();
        let repo = tx.repo_by_url(&self.repo_url).unwrap().unwrap();
        let queue = tx
            .merge_queue_by_repo_and_branch(repo.id, TARGET_BRANCH)
            .unwrap()
            .unwrap();
        let enqueued = tx.enqueued_pull_requests(queue.id).unwrap();
        (queue, enqueued)
    }

    /// The store-side invariants that must hold after every handler:
    /// `head_seq <= tail_seq`, records exactly fill `[head_seq, tail_seq)`
    /// in strictly increasing order, priorities never increase along the
    /// queue, and every record names the queue's working branch.
    pub fn assert_queue_invariants(&self) {
        let (queue, enqueued) = self.queue_state();
        assert!(queue.head_seq <= queue.tail_seq, "head_seq must not pass tail_seq");
        assert_eq!(
            enqueued.len() as i64,
            queue.tail_seq - queue.head_seq,
            "records must exactly fill [head_seq, tail_seq)"
        );
        let mut expected_seq = queue.head_seq;
        let mut last_priority = i64::MAX;
        for (pr, record) in &enqueued {
            assert_eq!(record.seq, expected_seq, "sequence numbers must be dense");
            expected_seq += 1;
            assert!(
                pr.priority <= last_priority,
                "priorities must be non-increasing in seq order"
            );
            last_priority = pr.priority;
            assert_eq!(
                record.associated_branch, WORKING_BRANCH,
                "record must name the queue's working branch"
            );
            assert!(!record.passed || record.finished, "passed implies finished");
        }
    }

    /// Walk origin's working branch first-parent chain and check it carries
    /// exactly the enqueued records' commits on top of the given base.
    pub fn assert_working_chain(&self, base: Oid) {
        let (_, enqueued) = self.queue_state();
        let mut commit = self
            .origin
            .find_commit(self.origin_tip(WORKING_BRANCH))
            .unwrap();
        let mut commits = Vec::new();
        while commit.id() != base {
            commits.push(commit.id().to_string());
            commit = commit.parent(0).unwrap();
        }
        commits.reverse();
        let expected: Vec<String> = enqueued
            .iter()
            .map(|(_, record)| record.mq_commit.clone())
            .collect();
        assert_eq!(
            commits, expected,
            "working branch first-parent chain must match records in seq order"
        );
    }
}
