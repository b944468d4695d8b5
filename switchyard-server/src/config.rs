//! Configuration: environment variables for the process, a JSON file for
//! the managed repositories.
//!
//! The repos file is the only carrier of secrets (per-repo access tokens),
//! so it should be deployed with restrictive permissions; everything else is
//! plain environment.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use switchyard_core::MergeStyle;

use crate::store::{RepoKind, RepoSpec, Store, StoreTx};

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    pub state_dir: PathBuf,
    /// Directory holding the local Git mirrors.
    pub mirror_dir: PathBuf,
    /// Mention name the bot answers to in MR comments.
    pub bot_name: String,
    /// Email used when the bot commits under its own identity.
    pub bot_email: String,
    /// Path to the JSON repositories file.
    pub repos_config: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let mirror_dir = env::var("MIRROR_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("mirrors"));

        let bot_name = env::var("BOT_NAME").unwrap_or_else(|_| "switchyard".to_string());
        let bot_email =
            env::var("BOT_EMAIL").unwrap_or_else(|_| "switchyard@localhost".to_string());

        let repos_config = env::var("REPOS_CONFIG")
            .map(PathBuf::from)
            .context("REPOS_CONFIG environment variable is required")?;

        Ok(Config {
            port,
            state_dir,
            mirror_dir,
            bot_name,
            bot_email,
            repos_config,
        })
    }
}

/// One managed repository in the repos file.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
    pub name: String,
    pub url: String,
    pub kind: RepoKind,
    #[serde(default)]
    pub access_token: Option<String>,
    pub merge_style: MergeStyle,
    pub queues: Vec<QueueConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub target_branch: String,
    pub working_branch: String,
}

/// Load the repos file: a JSON array of [`RepoConfig`].
pub fn load_repos(path: &Path) -> Result<Vec<RepoConfig>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read repos config: {}", path.display()))?;
    let repos: Vec<RepoConfig> = serde_json::from_str(&contents)
        .with_context(|| format!("invalid repos config: {}", path.display()))?;
    Ok(repos)
}

/// Upsert the configured repositories and their queues into the store.
/// Runs before the server accepts traffic; existing queues keep their
/// sequence bounds.
pub fn seed_store<S: Store>(store: &S, repos: &[RepoConfig]) -> Result<()> {
    let tx = store.begin()?;
    for repo_config in repos {
        let repo = tx.upsert_repo(&RepoSpec {
            name: repo_config.name.clone(),
            url: repo_config.url.clone(),
            kind: repo_config.kind,
            access_token: repo_config.access_token.clone(),
            merge_style: repo_config.merge_style,
        })?;
        for queue in &repo_config.queues {
            tx.upsert_merge_queue(repo.id, &queue.target_branch, &queue.working_branch)?;
        }
    }
    tx.commit()?;
    Ok(())
}
