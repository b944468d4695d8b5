use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{response::Json, routing::get, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

use switchyard_core::{Committer, LibGitOperator};
use switchyard_server::config::{self, Config};
use switchyard_server::coordinator::Coordinator;
use switchyard_server::gitlab::GitLabClient;
use switchyard_server::store::SqliteStore;
use switchyard_server::webhook::webhook_router;
use switchyard_server::AppState;

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "switchyard"
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting switchyard merge queue coordinator");

    let config = Config::from_env().context("failed to load configuration")?;

    let db_path = config.state_dir.join("switchyard.db");
    info!("Using state database: {}", db_path.display());
    let store = Arc::new(SqliteStore::open(&db_path).context("failed to open state database")?);

    // Seed repositories and queues before accepting any traffic, so webhook
    // events for configured repos never race the configuration.
    let repos = config::load_repos(&config.repos_config)?;
    config::seed_store(store.as_ref(), &repos)?;
    info!(repos = repos.len(), "seeded repositories from config");

    let git = Arc::new(LibGitOperator::new(config.mirror_dir.clone()));
    let host = Arc::new(GitLabClient::new()?);
    let coordinator = Coordinator::new(Arc::clone(&store), git, Arc::clone(&host));

    let state = Arc::new(AppState {
        coordinator,
        store,
        host,
        bot_name: config.bot_name.clone(),
        bot_committer: Committer::new(config.bot_name.clone(), config.bot_email.clone()),
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(webhook_router(state))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
