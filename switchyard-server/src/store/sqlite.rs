//! SQLite implementation of the store.
//!
//! # Schema versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema versions.
//! When the schema changes, increment `SCHEMA_VERSION` and add a migration
//! function in `run_migrations`.
//!
//! # Concurrency
//!
//! `rusqlite::Connection` is not `Sync`, so the connection lives behind a
//! `Mutex`. A [`SqliteTx`] holds the mutex guard for its whole lifetime with
//! an open `BEGIN IMMEDIATE`, which both serialises writers and gives each
//! coordinator event the consistent snapshot the queue invariants assume.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

use switchyard_core::MergeStyle;

use super::{
    EnqueueRecord, MergeQueue, PullRequest, Repo, RepoKind, RepoSpec, Store, StoreError, StoreTx,
};

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database file at `path`.
    ///
    /// The database is configured with WAL journaling (verified), full
    /// synchronous durability and a busy timeout.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::storage("open database", e))?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::storage("set journal_mode", e))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            return Err(StoreError::storage(
                "configure journal_mode",
                format!(
                    "expected WAL, got '{}'; the filesystem may not support shared memory",
                    journal_mode
                ),
            ));
        }

        Self::from_connection(conn)
    }

    /// In-memory database, for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::storage("open in-memory database", e))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            "#,
        )
        .map_err(|e| StoreError::storage("configure pragmas", e))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current_version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .map_err(|e| StoreError::storage("read user_version", e))?;

        if current_version > SCHEMA_VERSION {
            return Err(StoreError::storage(
                "check schema version",
                format!(
                    "database schema version {} is newer than supported version {}",
                    current_version, SCHEMA_VERSION
                ),
            ));
        }

        if current_version < SCHEMA_VERSION {
            info!(
                from = current_version,
                to = SCHEMA_VERSION,
                "migrating database schema"
            );
            Self::run_migrations(&conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(|e| StoreError::storage("set user_version", e))?;
        }

        Ok(())
    }

    fn run_migrations(conn: &Connection, from_version: i32) -> Result<(), StoreError> {
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }
        Ok(())
    }

    fn migrate_v0_to_v1(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS repos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL CHECK (kind IN ('gitlab')),
                access_token TEXT,
                merge_style TEXT NOT NULL CHECK (merge_style IN ('merge', 'linear', 'semilinear'))
            );

            CREATE TABLE IF NOT EXISTS merge_queues (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                repo_id INTEGER NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
                target_branch TEXT NOT NULL,
                working_branch TEXT NOT NULL,
                head_seq INTEGER NOT NULL DEFAULT 0,
                tail_seq INTEGER NOT NULL DEFAULT 0,
                UNIQUE (repo_id, target_branch),
                CHECK (working_branch <> target_branch),
                CHECK (head_seq <= tail_seq)
            );

            CREATE TABLE IF NOT EXISTS pull_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                repo_id INTEGER NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
                merge_queue_id INTEGER NOT NULL REFERENCES merge_queues(id) ON DELETE CASCADE,
                number INTEGER NOT NULL,
                source_branch TEXT NOT NULL,
                target_branch TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                UNIQUE (repo_id, number)
            );

            -- Presence of a row here is the definition of "PR is enqueued".
            CREATE TABLE IF NOT EXISTS enqueue_records (
                pr_id INTEGER PRIMARY KEY REFERENCES pull_requests(id) ON DELETE CASCADE,
                merge_queue_id INTEGER NOT NULL REFERENCES merge_queues(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                associated_branch TEXT NOT NULL,
                mq_commit TEXT NOT NULL,
                ci_number INTEGER,
                finished INTEGER NOT NULL DEFAULT 0,
                passed INTEGER NOT NULL DEFAULT 0,
                enqueued_at TEXT NOT NULL,
                UNIQUE (merge_queue_id, seq)
            );

            CREATE INDEX IF NOT EXISTS idx_enqueue_records_mq_commit
                ON enqueue_records(mq_commit);
            CREATE INDEX IF NOT EXISTS idx_enqueue_records_ci_number
                ON enqueue_records(ci_number);
            "#,
        )
        .map_err(|e| StoreError::storage("create schema", e))
    }
}

impl Store for SqliteStore {
    type Tx<'a>
        = SqliteTx<'a>
    where
        Self: 'a;

    fn begin(&self) -> Result<SqliteTx<'_>, StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| StoreError::storage("begin transaction", e))?;
        Ok(SqliteTx {
            conn,
            finished: false,
        })
    }
}

/// An open transaction holding the connection for its lifetime.
pub struct SqliteTx<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl Drop for SqliteTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

/// Raw repo columns; the enum texts parse in [`decode_repo`], where a
/// failure is data corruption rather than a SQL error.
type RawRepo = (i64, String, String, String, Option<String>, String);

fn repo_from_row(row: &Row<'_>) -> rusqlite::Result<RawRepo> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_repo(raw: RawRepo) -> Result<Repo, StoreError> {
    let (id, name, url, kind, access_token, merge_style) = raw;
    Ok(Repo {
        id,
        name,
        url,
        kind: RepoKind::parse(&kind)
            .ok_or_else(|| StoreError::Corruption(format!("unknown repo kind: {}", kind)))?,
        access_token,
        merge_style: MergeStyle::parse(&merge_style).ok_or_else(|| {
            StoreError::Corruption(format!("unknown merge style: {}", merge_style))
        })?,
    })
}

fn merge_queue_from_row(row: &Row<'_>) -> rusqlite::Result<MergeQueue> {
    Ok(MergeQueue {
        id: row.get(0)?,
        repo_id: row.get(1)?,
        target_branch: row.get(2)?,
        working_branch: row.get(3)?,
        head_seq: row.get(4)?,
        tail_seq: row.get(5)?,
    })
}

fn pull_request_from_row(row: &Row<'_>) -> rusqlite::Result<PullRequest> {
    Ok(PullRequest {
        id: row.get(0)?,
        repo_id: row.get(1)?,
        merge_queue_id: row.get(2)?,
        number: row.get(3)?,
        source_branch: row.get(4)?,
        target_branch: row.get(5)?,
        priority: row.get(6)?,
    })
}

fn enqueue_record_from_row(row: &Row<'_>) -> rusqlite::Result<EnqueueRecord> {
    Ok(EnqueueRecord {
        pr_id: row.get(0)?,
        merge_queue_id: row.get(1)?,
        seq: row.get(2)?,
        associated_branch: row.get(3)?,
        mq_commit: row.get(4)?,
        ci_number: row.get(5)?,
        finished: row.get(6)?,
        passed: row.get(7)?,
        enqueued_at: row.get(8)?,
    })
}

/// Columns for the (pull request, enqueue record) join, in the order the
/// two row decoders above expect.
const PAIR_COLUMNS: &str = "pr.id, pr.repo_id, pr.merge_queue_id, pr.number, pr.source_branch, \
     pr.target_branch, pr.priority, \
     rec.pr_id, rec.merge_queue_id, rec.seq, rec.associated_branch, rec.mq_commit, \
     rec.ci_number, rec.finished, rec.passed, rec.enqueued_at";

fn pair_from_row(row: &Row<'_>) -> rusqlite::Result<(PullRequest, EnqueueRecord)> {
    let pr = pull_request_from_row(row)?;
    let record = EnqueueRecord {
        pr_id: row.get(7)?,
        merge_queue_id: row.get(8)?,
        seq: row.get(9)?,
        associated_branch: row.get(10)?,
        mq_commit: row.get(11)?,
        ci_number: row.get(12)?,
        finished: row.get(13)?,
        passed: row.get(14)?,
        enqueued_at: row.get(15)?,
    };
    Ok((pr, record))
}

impl StoreTx for SqliteTx<'_> {
    fn commit(mut self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| StoreError::storage("commit transaction", e))?;
        self.finished = true;
        Ok(())
    }

    fn repo_by_url(&self, url: &str) -> Result<Option<Repo>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, name, url, kind, access_token, merge_style FROM repos WHERE url = ?1",
                params![url],
                repo_from_row,
            )
            .optional()
            .map_err(|e| StoreError::storage("get repo by url", e))?
            .map(decode_repo)
            .transpose()
    }

    fn merge_queue_by_repo_and_branch(
        &self,
        repo_id: i64,
        target_branch: &str,
    ) -> Result<Option<MergeQueue>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, repo_id, target_branch, working_branch, head_seq, tail_seq \
                 FROM merge_queues WHERE repo_id = ?1 AND target_branch = ?2",
                params![repo_id, target_branch],
                merge_queue_from_row,
            )
            .optional()
            .map_err(|e| StoreError::storage("get merge queue", e))
    }

    fn merge_queue_for_pr(&self, pr_id: i64) -> Result<Option<MergeQueue>, StoreError> {
        self.conn
            .query_row(
                "SELECT mq.id, mq.repo_id, mq.target_branch, mq.working_branch, mq.head_seq, \
                 mq.tail_seq \
                 FROM merge_queues mq JOIN pull_requests pr ON pr.merge_queue_id = mq.id \
                 WHERE pr.id = ?1",
                params![pr_id],
                merge_queue_from_row,
            )
            .optional()
            .map_err(|e| StoreError::storage("get merge queue for pr", e))
    }

    fn pull_request(&self, repo_id: i64, number: i64) -> Result<Option<PullRequest>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, repo_id, merge_queue_id, number, source_branch, target_branch, \
                 priority FROM pull_requests WHERE repo_id = ?1 AND number = ?2",
                params![repo_id, number],
                pull_request_from_row,
            )
            .optional()
            .map_err(|e| StoreError::storage("get pull request", e))
    }

    fn pull_request_by_id(&self, id: i64) -> Result<Option<PullRequest>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, repo_id, merge_queue_id, number, source_branch, target_branch, \
                 priority FROM pull_requests WHERE id = ?1",
                params![id],
                pull_request_from_row,
            )
            .optional()
            .map_err(|e| StoreError::storage("get pull request by id", e))
    }

    fn tail_pull_request(
        &self,
        queue: &MergeQueue,
    ) -> Result<Option<(PullRequest, EnqueueRecord)>, StoreError> {
        if queue.is_empty() {
            return Ok(None);
        }
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM enqueue_records rec \
                     JOIN pull_requests pr ON pr.id = rec.pr_id \
                     WHERE rec.merge_queue_id = ?1 AND rec.seq = ?2",
                    PAIR_COLUMNS
                ),
                params![queue.id, queue.tail_seq - 1],
                pair_from_row,
            )
            .optional()
            .map_err(|e| StoreError::storage("get tail pull request", e))
    }

    fn enqueued_pull_requests(
        &self,
        merge_queue_id: i64,
    ) -> Result<Vec<(PullRequest, EnqueueRecord)>, StoreError> {
        let mut statement = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM enqueue_records rec \
                 JOIN pull_requests pr ON pr.id = rec.pr_id \
                 WHERE rec.merge_queue_id = ?1 ORDER BY rec.seq ASC",
                PAIR_COLUMNS
            ))
            .map_err(|e| StoreError::storage("get enqueued pull requests", e))?;
        let rows = statement
            .query_map(params![merge_queue_id], pair_from_row)
            .map_err(|e| StoreError::storage("get enqueued pull requests", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::storage("get enqueued pull requests", e))
    }

    fn enqueue_record_for_pr(&self, pr_id: i64) -> Result<Option<EnqueueRecord>, StoreError> {
        self.conn
            .query_row(
                "SELECT pr_id, merge_queue_id, seq, associated_branch, mq_commit, ci_number, \
                 finished, passed, enqueued_at FROM enqueue_records WHERE pr_id = ?1",
                params![pr_id],
                enqueue_record_from_row,
            )
            .optional()
            .map_err(|e| StoreError::storage("get enqueue record", e))
    }

    fn enqueue_record_by_mq_commit(
        &self,
        repo_id: i64,
        commit: &str,
    ) -> Result<Option<EnqueueRecord>, StoreError> {
        self.conn
            .query_row(
                "SELECT rec.pr_id, rec.merge_queue_id, rec.seq, rec.associated_branch, \
                 rec.mq_commit, rec.ci_number, rec.finished, rec.passed, rec.enqueued_at \
                 FROM enqueue_records rec JOIN pull_requests pr ON pr.id = rec.pr_id \
                 WHERE pr.repo_id = ?1 AND rec.mq_commit = ?2",
                params![repo_id, commit],
                enqueue_record_from_row,
            )
            .optional()
            .map_err(|e| StoreError::storage("find enqueue record by commit", e))
    }

    fn enqueue_record_by_ci_number(
        &self,
        repo_id: i64,
        ci_number: i64,
    ) -> Result<Option<EnqueueRecord>, StoreError> {
        self.conn
            .query_row(
                "SELECT rec.pr_id, rec.merge_queue_id, rec.seq, rec.associated_branch, \
                 rec.mq_commit, rec.ci_number, rec.finished, rec.passed, rec.enqueued_at \
                 FROM enqueue_records rec JOIN pull_requests pr ON pr.id = rec.pr_id \
                 WHERE pr.repo_id = ?1 AND rec.ci_number = ?2",
                params![repo_id, ci_number],
                enqueue_record_from_row,
            )
            .optional()
            .map_err(|e| StoreError::storage("find enqueue record by ci number", e))
    }

    fn add_pull_request(
        &self,
        repo_id: i64,
        merge_queue_id: i64,
        number: i64,
        source_branch: &str,
        target_branch: &str,
        priority: i64,
    ) -> Result<PullRequest, StoreError> {
        self.conn
            .execute(
                "INSERT INTO pull_requests (repo_id, merge_queue_id, number, source_branch, \
                 target_branch, priority) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    repo_id,
                    merge_queue_id,
                    number,
                    source_branch,
                    target_branch,
                    priority
                ],
            )
            .map_err(|e| StoreError::storage("add pull request", e))?;
        Ok(PullRequest {
            id: self.conn.last_insert_rowid(),
            repo_id,
            merge_queue_id,
            number,
            source_branch: source_branch.to_string(),
            target_branch: target_branch.to_string(),
            priority,
        })
    }

    fn add_enqueue_record(&self, record: &EnqueueRecord) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO enqueue_records (pr_id, merge_queue_id, seq, associated_branch, \
                 mq_commit, ci_number, finished, passed, enqueued_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.pr_id,
                    record.merge_queue_id,
                    record.seq,
                    record.associated_branch,
                    record.mq_commit,
                    record.ci_number,
                    record.finished,
                    record.passed,
                    record.enqueued_at
                ],
            )
            .map_err(|e| StoreError::storage("add enqueue record", e))?;
        Ok(())
    }

    fn save_enqueue_record(&self, record: &EnqueueRecord) -> Result<(), StoreError> {
        let updated = self
            .conn
            .execute(
                "UPDATE enqueue_records SET ci_number = ?1, finished = ?2, passed = ?3 \
                 WHERE pr_id = ?4",
                params![record.ci_number, record.finished, record.passed, record.pr_id],
            )
            .map_err(|e| StoreError::storage("save enqueue record", e))?;
        if updated == 0 {
            return Err(StoreError::storage(
                "save enqueue record",
                format!("no enqueue record for pr {}", record.pr_id),
            ));
        }
        Ok(())
    }

    fn remove_enqueue_record(&self, pr_id: i64) -> Result<(), StoreError> {
        self.conn
            .execute(
                "DELETE FROM enqueue_records WHERE pr_id = ?1",
                params![pr_id],
            )
            .map_err(|e| StoreError::storage("remove enqueue record", e))?;
        Ok(())
    }

    fn save_merge_queue(&self, queue: &MergeQueue) -> Result<(), StoreError> {
        let updated = self
            .conn
            .execute(
                "UPDATE merge_queues SET head_seq = ?1, tail_seq = ?2 WHERE id = ?3",
                params![queue.head_seq, queue.tail_seq, queue.id],
            )
            .map_err(|e| StoreError::storage("save merge queue", e))?;
        if updated == 0 {
            return Err(StoreError::storage(
                "save merge queue",
                format!("no merge queue with id {}", queue.id),
            ));
        }
        Ok(())
    }

    fn upsert_repo(&self, spec: &RepoSpec) -> Result<Repo, StoreError> {
        self.conn
            .execute(
                "INSERT INTO repos (name, url, kind, access_token, merge_style) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (url) DO UPDATE SET name = excluded.name, kind = excluded.kind, \
                 access_token = excluded.access_token, merge_style = excluded.merge_style",
                params![
                    spec.name,
                    spec.url,
                    spec.kind.as_str(),
                    spec.access_token,
                    spec.merge_style.as_str()
                ],
            )
            .map_err(|e| StoreError::storage("upsert repo", e))?;
        self.repo_by_url(&spec.url)?.ok_or_else(|| {
            StoreError::Corruption(format!("repo vanished after upsert: {}", spec.url))
        })
    }

    fn upsert_merge_queue(
        &self,
        repo_id: i64,
        target_branch: &str,
        working_branch: &str,
    ) -> Result<MergeQueue, StoreError> {
        self.conn
            .execute(
                "INSERT INTO merge_queues (repo_id, target_branch, working_branch) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT (repo_id, target_branch) DO UPDATE \
                 SET working_branch = excluded.working_branch",
                params![repo_id, target_branch, working_branch],
            )
            .map_err(|e| StoreError::storage("upsert merge queue", e))?;
        self.merge_queue_by_repo_and_branch(repo_id, target_branch)?
            .ok_or_else(|| {
                StoreError::Corruption(format!(
                    "merge queue vanished after upsert: repo {} target {}",
                    repo_id, target_branch
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gitlab_spec(url: &str) -> RepoSpec {
        RepoSpec {
            name: "Test Repo".to_string(),
            url: url.to_string(),
            kind: RepoKind::GitLab,
            access_token: Some("glpat-token".to_string()),
            merge_style: MergeStyle::Merge,
        }
    }

    fn record(pr_id: i64, merge_queue_id: i64, seq: i64, commit: &str) -> EnqueueRecord {
        EnqueueRecord {
            pr_id,
            merge_queue_id,
            seq,
            associated_branch: "merge-queue".to_string(),
            mq_commit: commit.to_string(),
            ci_number: None,
            finished: false,
            passed: false,
            enqueued_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    /// Seed a repo with a queue and `n` pull requests, all enqueued.
    fn seeded(n: i64) -> (SqliteStore, Repo, MergeQueue, Vec<PullRequest>) {
        let store = SqliteStore::in_memory().unwrap();
        let tx = store.begin().unwrap();
        let repo = tx.upsert_repo(&gitlab_spec("https://gitlab.example.com/a/b.git")).unwrap();
        let mut queue = tx
            .upsert_merge_queue(repo.id, "master", "merge-queue")
            .unwrap();
        let mut prs = Vec::new();
        for i in 0..n {
            let pr = tx
                .add_pull_request(repo.id, queue.id, i + 1, &format!("feature{}", i + 1), "master", 0)
                .unwrap();
            tx.add_enqueue_record(&record(pr.id, queue.id, i, &format!("commit{}", i)))
                .unwrap();
            prs.push(pr);
        }
        queue.tail_seq = n;
        tx.save_merge_queue(&queue).unwrap();
        tx.commit().unwrap();
        (store, repo, queue, prs)
    }

    #[test]
    fn upsert_repo_is_keyed_by_url() {
        let store = SqliteStore::in_memory().unwrap();
        let tx = store.begin().unwrap();
        let first = tx.upsert_repo(&gitlab_spec("https://gitlab.example.com/a/b.git")).unwrap();

        let mut changed = gitlab_spec("https://gitlab.example.com/a/b.git");
        changed.name = "Renamed".to_string();
        changed.merge_style = MergeStyle::SemiLinear;
        let second = tx.upsert_repo(&changed).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "Renamed");
        assert_eq!(second.merge_style, MergeStyle::SemiLinear);
    }

    #[test]
    fn upsert_merge_queue_preserves_sequence_bounds() {
        let (store, repo, queue, _) = seeded(2);
        let tx = store.begin().unwrap();
        let again = tx
            .upsert_merge_queue(repo.id, "master", "merge-queue-2")
            .unwrap();
        assert_eq!(again.id, queue.id);
        assert_eq!(again.working_branch, "merge-queue-2");
        assert_eq!(again.head_seq, 0);
        assert_eq!(again.tail_seq, 2);
    }

    #[test]
    fn duplicate_pull_request_number_is_rejected() {
        let (store, repo, queue, _) = seeded(1);
        let tx = store.begin().unwrap();
        let result = tx.add_pull_request(repo.id, queue.id, 1, "other", "master", 0);
        assert!(result.is_err());
    }

    #[test]
    fn tail_is_none_on_empty_queue() {
        let (store, repo, _, _) = seeded(0);
        let tx = store.begin().unwrap();
        let queue = tx
            .merge_queue_by_repo_and_branch(repo.id, "master")
            .unwrap()
            .unwrap();
        assert!(tx.tail_pull_request(&queue).unwrap().is_none());
    }

    #[test]
    fn tail_is_highest_sequence_number() {
        let (store, repo, _, prs) = seeded(3);
        let tx = store.begin().unwrap();
        let queue = tx
            .merge_queue_by_repo_and_branch(repo.id, "master")
            .unwrap()
            .unwrap();
        let (pr, record) = tx.tail_pull_request(&queue).unwrap().unwrap();
        assert_eq!(pr.id, prs[2].id);
        assert_eq!(record.seq, 2);
    }

    #[test]
    fn enqueued_pull_requests_are_ordered_by_seq() {
        let (store, _, queue, prs) = seeded(3);
        let tx = store.begin().unwrap();
        let enqueued = tx.enqueued_pull_requests(queue.id).unwrap();
        assert_eq!(enqueued.len(), 3);
        let ids: Vec<i64> = enqueued.iter().map(|(pr, _)| pr.id).collect();
        assert_eq!(ids, prs.iter().map(|pr| pr.id).collect::<Vec<_>>());
        let seqs: Vec<i64> = enqueued.iter().map(|(_, rec)| rec.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn record_lookup_by_commit_is_scoped_to_repo() {
        let (store, repo, _, prs) = seeded(2);
        let tx = store.begin().unwrap();
        let found = tx
            .enqueue_record_by_mq_commit(repo.id, "commit1")
            .unwrap()
            .unwrap();
        assert_eq!(found.pr_id, prs[1].id);
        assert!(tx
            .enqueue_record_by_mq_commit(repo.id, "no-such-commit")
            .unwrap()
            .is_none());
        assert!(tx
            .enqueue_record_by_mq_commit(repo.id + 1, "commit1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn record_lookup_by_ci_number() {
        let (store, repo, _, prs) = seeded(2);
        let tx = store.begin().unwrap();
        let mut record = tx.enqueue_record_for_pr(prs[0].id).unwrap().unwrap();
        record.ci_number = Some(100);
        tx.save_enqueue_record(&record).unwrap();

        let found = tx
            .enqueue_record_by_ci_number(repo.id, 100)
            .unwrap()
            .unwrap();
        assert_eq!(found.pr_id, prs[0].id);
        assert!(tx.enqueue_record_by_ci_number(repo.id, 999).unwrap().is_none());
    }

    #[test]
    fn save_enqueue_record_persists_ci_outcome() {
        let (store, _, _, prs) = seeded(1);
        let tx = store.begin().unwrap();
        let mut record = tx.enqueue_record_for_pr(prs[0].id).unwrap().unwrap();
        record.ci_number = Some(7);
        record.finished = true;
        record.passed = true;
        tx.save_enqueue_record(&record).unwrap();
        tx.commit().unwrap();

        let tx = store.begin().unwrap();
        let reread = tx.enqueue_record_for_pr(prs[0].id).unwrap().unwrap();
        assert_eq!(reread.ci_number, Some(7));
        assert!(reread.finished);
        assert!(reread.passed);
    }

    #[test]
    fn remove_enqueue_record_dequeues_pr() {
        let (store, _, queue, prs) = seeded(2);
        let tx = store.begin().unwrap();
        tx.remove_enqueue_record(prs[0].id).unwrap();
        assert!(tx.enqueue_record_for_pr(prs[0].id).unwrap().is_none());
        assert_eq!(tx.enqueued_pull_requests(queue.id).unwrap().len(), 1);
        // The pull request row itself survives.
        assert!(tx.pull_request_by_id(prs[0].id).unwrap().is_some());
    }

    #[test]
    fn dropping_transaction_rolls_back() {
        let (store, repo, queue, _) = seeded(0);
        {
            let tx = store.begin().unwrap();
            tx.add_pull_request(repo.id, queue.id, 42, "feature", "master", 0)
                .unwrap();
            // No commit.
        }
        let tx = store.begin().unwrap();
        assert!(tx.pull_request(repo.id, 42).unwrap().is_none());
    }

    #[test]
    fn head_seq_above_tail_seq_is_rejected() {
        let (store, _, mut queue, _) = seeded(1);
        let tx = store.begin().unwrap();
        queue.head_seq = 5;
        assert!(tx.save_merge_queue(&queue).is_err());
    }

    #[test]
    fn merge_queue_for_pr_follows_foreign_key() {
        let (store, _, queue, prs) = seeded(1);
        let tx = store.begin().unwrap();
        let found = tx.merge_queue_for_pr(prs[0].id).unwrap().unwrap();
        assert_eq!(found.id, queue.id);
        assert!(tx.merge_queue_for_pr(9999).unwrap().is_none());
    }
}
