use std::sync::Arc;

use axum::extract::State;
use mergebot_github::webhook::{GitHubEvent, WebhookEvent};
use mergebot_jobs::Processor;

use crate::AppState;

/// Accepts every event and queues the pull request it concerns. Processing
/// happens in the next batch.
pub async fn webhook(
    State(state): State<AppState>,
    GitHubEvent { payload }: GitHubEvent,
) -> &'static str {
    let event = payload.classify(&state.config.github.bot_user);
    enqueue(&state.processor, event);
    "roger"
}

fn enqueue(processor: &Arc<Processor>, event: WebhookEvent) {
    let pr = match event {
        WebhookEvent::PullRequestOpened(pr) => {
            tracing::info!("Pull request {pr} opened or updated");
            pr
        }
        WebhookEvent::Commented(pr) => {
            tracing::info!("New comment on {pr}");
            pr
        }
        WebhookEvent::StatusChanged { repo, sha } => {
            match processor.gateway().find_pull_by_head_sha(&sha) {
                Some(pr) if pr.repo == repo => {
                    tracing::info!("Status of {sha} changed, head of {pr}");
                    pr
                }
                _ => {
                    tracing::info!("Status of {repo}@{sha} changed, no known pull request with that head");
                    return;
                }
            }
        }
        WebhookEvent::Ignored => {
            tracing::debug!("Ignoring event");
            return;
        }
    };
    processor.pending().insert(pr);
}
