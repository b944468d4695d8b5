//! Webhook front-end: translates GitLab payloads into coordinator events.
//!
//! Three hooks matter: merge request events feed `on_pr_opened`, note events
//! carrying a bot command feed `on_enqueue_request`, and pipeline events feed
//! `on_ci_created` / `on_ci_finished`. Everything else is acknowledged and
//! ignored. Events for unknown repositories are filtered by the
//! coordinator's own lookups.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::Json, routing::post, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use switchyard_core::Committer;

use crate::command::{parse_command, usage, BotCommand};
use crate::coordinator::EnqueueError;
use crate::host::VcsHost;
use crate::store::{Store, StoreTx};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct GitLabWebhookPayload {
    pub object_kind: String,
    pub project: Option<Project>,
    pub user: Option<User>,
    pub merge_request: Option<NoteMergeRequest>,
    pub object_attributes: Option<ObjectAttributes>,
    #[serde(default)]
    pub labels: Vec<Label>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Project {
    pub name: String,
    pub git_http_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct User {
    pub name: String,
    pub username: String,
    pub email: Option<String>,
}

/// The merge request a note was posted on.
#[derive(Debug, Deserialize, Clone)]
pub struct NoteMergeRequest {
    pub iid: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Label {
    pub title: String,
}

/// Shared attribute bag; GitLab reuses `object_attributes` across hook
/// kinds, so every field is optional and each handler picks what it needs.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ObjectAttributes {
    pub iid: Option<i64>,
    pub action: Option<String>,
    pub source_branch: Option<String>,
    pub target_branch: Option<String>,
    pub note: Option<String>,
    pub noteable_type: Option<String>,
    pub id: Option<i64>,
    pub sha: Option<String>,
    pub status: Option<String>,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub message: String,
}

/// Queue priority carried on an MR as a `priority:<n>` label.
fn priority_from_labels(labels: &[Label]) -> i64 {
    labels
        .iter()
        .find_map(|label| label.title.strip_prefix("priority:"))
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

/// What a pipeline status means for the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineTransition {
    Created,
    Finished { success: bool },
    Ignored,
}

fn classify_pipeline(status: &str) -> PipelineTransition {
    match status {
        "created" | "pending" | "running" => PipelineTransition::Created,
        "success" | "skipped" => PipelineTransition::Finished { success: true },
        "failed" | "canceled" => PipelineTransition::Finished { success: false },
        _ => PipelineTransition::Ignored,
    }
}

pub fn webhook_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .with_state(state)
}

async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<GitLabWebhookPayload>,
) -> Result<Json<WebhookResponse>, StatusCode> {
    let outcome = match payload.object_kind.as_str() {
        "merge_request" => handle_merge_request(&state, &payload).await,
        "note" => handle_note(&state, &payload).await,
        "pipeline" => handle_pipeline(&state, &payload).await,
        other => {
            debug!(kind = other, "ignoring webhook kind");
            Ok("ignored".to_string())
        }
    };

    match outcome {
        Ok(message) => Ok(Json(WebhookResponse { message })),
        Err(e) => {
            error!(kind = %payload.object_kind, "webhook handling failed: {:#}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn handle_merge_request(
    state: &AppState,
    payload: &GitLabWebhookPayload,
) -> Result<String> {
    let project = payload.project.as_ref().context("missing project")?;
    let attributes = payload
        .object_attributes
        .as_ref()
        .context("missing object_attributes")?;

    let action = attributes.action.as_deref().unwrap_or_default();
    if !matches!(action, "open" | "reopen") {
        return Ok(format!("ignoring merge request action '{}'", action));
    }

    let iid = attributes.iid.context("merge request without iid")?;
    let source_branch = attributes
        .source_branch
        .as_deref()
        .context("merge request without source branch")?;
    let target_branch = attributes
        .target_branch
        .as_deref()
        .context("merge request without target branch")?;
    let priority = priority_from_labels(&payload.labels);

    state
        .coordinator
        .on_pr_opened(
            &project.git_http_url,
            iid,
            priority,
            source_branch,
            target_branch,
        )
        .await?;
    Ok(format!("registered merge request !{}", iid))
}

async fn handle_note(state: &AppState, payload: &GitLabWebhookPayload) -> Result<String> {
    let project = payload.project.as_ref().context("missing project")?;
    let attributes = payload
        .object_attributes
        .as_ref()
        .context("missing object_attributes")?;

    if attributes.noteable_type.as_deref() != Some("MergeRequest") {
        return Ok("ignoring note on non-merge-request".to_string());
    }
    let Some(merge_request) = payload.merge_request.as_ref() else {
        return Ok("ignoring note without merge request".to_string());
    };
    let Some(body) = attributes.note.as_deref() else {
        return Ok("ignoring empty note".to_string());
    };
    let Some(command) = parse_command(body, &state.bot_name) else {
        return Ok("no bot command".to_string());
    };

    match command {
        BotCommand::Help => {
            reply(state, &project.git_http_url, merge_request.iid, &usage(&state.bot_name)).await;
            Ok("replied with usage".to_string())
        }
        BotCommand::Merge => {
            let committer = requester_committer(state, payload.user.as_ref());
            info!(
                repo = %project.git_http_url,
                mr = merge_request.iid,
                committer = %committer,
                "enqueue requested"
            );
            match state
                .coordinator
                .on_enqueue_request(&project.git_http_url, merge_request.iid, &committer)
                .await
            {
                Ok(()) => {
                    reply(
                        state,
                        &project.git_http_url,
                        merge_request.iid,
                        "Added to the merge queue.",
                    )
                    .await;
                    Ok(format!("enqueued merge request !{}", merge_request.iid))
                }
                Err(EnqueueError::Internal(e)) => Err(e),
                Err(refusal) => {
                    reply(
                        state,
                        &project.git_http_url,
                        merge_request.iid,
                        &format!("Cannot enqueue: {}.", refusal),
                    )
                    .await;
                    Ok(format!("refused: {}", refusal))
                }
            }
        }
    }
}

async fn handle_pipeline(state: &AppState, payload: &GitLabWebhookPayload) -> Result<String> {
    let project = payload.project.as_ref().context("missing project")?;
    let attributes = payload
        .object_attributes
        .as_ref()
        .context("missing object_attributes")?;

    let ci_number = attributes.id.context("pipeline without id")?;
    let status = attributes.status.as_deref().unwrap_or_default();

    match classify_pipeline(status) {
        PipelineTransition::Created => {
            let sha = attributes.sha.as_deref().context("pipeline without sha")?;
            state
                .coordinator
                .on_ci_created(&project.git_http_url, ci_number, sha)
                .await?;
            Ok(format!("pipeline {} created", ci_number))
        }
        PipelineTransition::Finished { success } => {
            state
                .coordinator
                .on_ci_finished(&project.git_http_url, ci_number, success)
                .await?;
            Ok(format!("pipeline {} finished", ci_number))
        }
        PipelineTransition::Ignored => Ok(format!("ignoring pipeline status '{}'", status)),
    }
}

/// Identity used for merge commits created on behalf of the requester. The
/// note payload rarely carries an email; fall back to the bot's own.
fn requester_committer(state: &AppState, user: Option<&User>) -> Committer {
    match user {
        Some(user) => Committer::new(
            user.name.clone(),
            user.email
                .clone()
                .filter(|email| !email.is_empty())
                .unwrap_or_else(|| state.bot_committer.email.clone()),
        ),
        None => state.bot_committer.clone(),
    }
}

/// Post a comment back on the merge request. Best-effort: a failed reply
/// never fails the webhook.
async fn reply(state: &AppState, repo_url: &str, mr_number: i64, text: &str) {
    let repo = match state.store.begin().map(|tx| tx.repo_by_url(repo_url)) {
        Ok(Ok(Some(repo))) => repo,
        _ => {
            debug!(repo_url, "cannot reply on unknown repository");
            return;
        }
    };
    if let Err(e) = state.host.pr_send_comment(&repo, mr_number, text).await {
        error!(repo_url, mr_number, "failed to post reply: {:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_request_payload_deserialises() {
        let payload: GitLabWebhookPayload = serde_json::from_value(json!({
            "object_kind": "merge_request",
            "project": {
                "name": "Test",
                "git_http_url": "https://gitlab.example.com/a/b.git"
            },
            "labels": [{"title": "bug"}, {"title": "priority:3"}],
            "object_attributes": {
                "iid": 7,
                "action": "open",
                "source_branch": "feature",
                "target_branch": "master"
            }
        }))
        .unwrap();

        assert_eq!(payload.object_kind, "merge_request");
        let attributes = payload.object_attributes.as_ref().unwrap();
        assert_eq!(attributes.iid, Some(7));
        assert_eq!(attributes.action.as_deref(), Some("open"));
        assert_eq!(priority_from_labels(&payload.labels), 3);
    }

    #[test]
    fn note_payload_deserialises() {
        let payload: GitLabWebhookPayload = serde_json::from_value(json!({
            "object_kind": "note",
            "project": {
                "name": "Test",
                "git_http_url": "https://gitlab.example.com/a/b.git"
            },
            "user": {"name": "Dev", "username": "dev"},
            "merge_request": {"iid": 9},
            "object_attributes": {
                "note": "@queue-bot merge",
                "noteable_type": "MergeRequest"
            }
        }))
        .unwrap();

        assert_eq!(payload.merge_request.unwrap().iid, 9);
        assert_eq!(
            payload.object_attributes.unwrap().note.as_deref(),
            Some("@queue-bot merge")
        );
        assert!(payload.user.unwrap().email.is_none());
    }

    #[test]
    fn pipeline_payload_deserialises() {
        let payload: GitLabWebhookPayload = serde_json::from_value(json!({
            "object_kind": "pipeline",
            "project": {
                "name": "Test",
                "git_http_url": "https://gitlab.example.com/a/b.git"
            },
            "object_attributes": {
                "id": 321,
                "sha": "deadbeef",
                "status": "running"
            }
        }))
        .unwrap();

        let attributes = payload.object_attributes.unwrap();
        assert_eq!(attributes.id, Some(321));
        assert_eq!(attributes.sha.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn pipeline_statuses_classify() {
        assert_eq!(classify_pipeline("created"), PipelineTransition::Created);
        assert_eq!(classify_pipeline("pending"), PipelineTransition::Created);
        assert_eq!(classify_pipeline("running"), PipelineTransition::Created);
        assert_eq!(
            classify_pipeline("success"),
            PipelineTransition::Finished { success: true }
        );
        // Skipped pipelines count as passed, cancelled ones as failed.
        assert_eq!(
            classify_pipeline("skipped"),
            PipelineTransition::Finished { success: true }
        );
        assert_eq!(
            classify_pipeline("failed"),
            PipelineTransition::Finished { success: false }
        );
        assert_eq!(
            classify_pipeline("canceled"),
            PipelineTransition::Finished { success: false }
        );
        assert_eq!(classify_pipeline("manual"), PipelineTransition::Ignored);
    }

    #[test]
    fn missing_priority_label_defaults_to_zero() {
        let labels = vec![
            Label {
                title: "bug".to_string(),
            },
            Label {
                title: "priority:not-a-number".to_string(),
            },
        ];
        assert_eq!(priority_from_labels(&labels), 0);
        assert_eq!(priority_from_labels(&[]), 0);
    }
}
