use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;

mod queue;
mod webhook;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/", post(webhook::webhook))
        .route("/api/github/webhook", post(webhook::webhook))
        .route("/list", get(queue::list))
        .route("/perms", get(queue::perms))
        .route("/process/all", get(queue::process_all))
        .route("/process/{owner}/{repo}/{number}", get(queue::process_one))
        .route("/health", get(queue::health))
}

#[cfg(test)]
mod tests;
