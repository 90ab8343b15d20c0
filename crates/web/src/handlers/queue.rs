use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use mergebot_core::{AppError, models::PullRequestRef};
use serde_json::{Value, json};

use crate::AppState;

pub async fn list(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "queued": state.processor.pending().list() }))
}

pub async fn perms(State(state): State<AppState>) -> Result<Response, AppError> {
    let policy = state.processor.load_policy()?;
    Ok(Json(policy).into_response())
}

/// Queue every open pull request of the configured repositories.
pub async fn process_all(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let added = state.processor.rescan().await?;
    tracing::info!("Manual rescan queued {added} pull requests");
    Ok(Json(json!({ "queued": state.processor.pending().list() })))
}

pub async fn process_one(
    State(state): State<AppState>,
    Path((owner, repo, number)): Path<(String, String, u64)>,
) -> Json<Value> {
    let pr = PullRequestRef::new(format!("{owner}/{repo}"), number);
    tracing::info!("Manually queueing {pr}");
    state.processor.pending().insert(pr.clone());
    Json(json!({ "added_to_queue": pr }))
}

pub async fn health(State(state): State<AppState>) -> Response {
    let health = state.processor.health();
    let status = if health.is_stuck() {
        tracing::warn!("Batch running for {:.0}s", health.running_since);
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (status, Json(health)).into_response()
}
