pub mod command;
pub mod config;
pub mod coordinator;
pub mod gitlab;
pub mod host;
pub mod store;
pub mod webhook;

use std::sync::Arc;

use switchyard_core::{Committer, LibGitOperator};

use coordinator::Coordinator;
use gitlab::GitLabClient;
use store::SqliteStore;

/// The coordinator as wired in production: SQLite store, git2 mirrors,
/// GitLab host.
pub type AppCoordinator = Coordinator<SqliteStore, LibGitOperator, GitLabClient>;

pub struct AppState {
    pub coordinator: AppCoordinator,
    pub store: Arc<SqliteStore>,
    pub host: Arc<GitLabClient>,
    pub bot_name: String,
    pub bot_committer: Committer,
}
