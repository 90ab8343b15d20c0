use std::{fmt::Display, sync::Arc};

use axum::{
    body::Bytes,
    extract::{FromRef, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use mergebot_core::{config::Config, models::PullRequestRef};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use sha2::Sha256;

#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    pub action: Option<String>,
    pub number: Option<u64>,
    pub repository: Option<RepositoryPayload>,
    pub pull_request: Option<Value>,
    pub state: Option<String>,
    pub context: Option<String>,
    pub sha: Option<String>,
    pub issue: Option<IssuePayload>,
    pub sender: Option<UserPayload>,
}

#[derive(Debug, Deserialize)]
pub struct RepositoryPayload {
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
pub struct IssuePayload {
    pub number: Option<u64>,
    pub pull_request: Option<Value>,
    /// `None` when the key is absent, `Some(Value::Null)` for an open issue.
    #[serde(default, deserialize_with = "present")]
    pub closed_at: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct UserPayload {
    pub login: String,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// What an incoming event means for the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    PullRequestOpened(PullRequestRef),
    /// A commit status changed; the pull request must be looked up by head SHA.
    StatusChanged { repo: String, sha: String },
    Commented(PullRequestRef),
    Ignored,
}

impl WebhookPayload {
    /// Classify by the shape of the payload.
    pub fn classify(&self, bot_user: &str) -> WebhookEvent {
        let Some(repo) = self.repository.as_ref().map(|r| r.full_name.clone()) else {
            return WebhookEvent::Ignored;
        };
        if self.pull_request.is_some() {
            return match (self.action.as_deref(), self.number) {
                (Some("opened" | "synchronize"), Some(number)) => {
                    WebhookEvent::PullRequestOpened(PullRequestRef::new(repo, number))
                }
                _ => WebhookEvent::Ignored,
            };
        }
        if self.state.is_some()
            && self.context.is_some()
            && let Some(sha) = &self.sha
        {
            return WebhookEvent::StatusChanged { repo, sha: sha.clone() };
        }
        if let Some(issue) = &self.issue
            && self.action.as_deref() == Some("created")
            && issue.pull_request.as_ref().is_some_and(Value::is_object)
            && issue.closed_at.as_ref().is_some_and(Value::is_null)
            && self.sender.as_ref().is_some_and(|s| s.login != bot_user)
            && let Some(number) = issue.number
        {
            return WebhookEvent::Commented(PullRequestRef::new(repo, number));
        }
        WebhookEvent::Ignored
    }
}

/// Verified webhook payload. The `X-Hub-Signature-256` header is checked when
/// a webhook secret is configured.
#[must_use]
pub struct GitHubEvent {
    pub payload: WebhookPayload,
}

impl<S> FromRequest<S> for GitHubEvent
where
    Arc<Config>: FromRef<S>,
    S: Send + Sync + Clone,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        fn err(m: impl Display) -> Response {
            tracing::error!("{m}");
            (StatusCode::BAD_REQUEST, m.to_string()).into_response()
        }
        let config = <Arc<Config>>::from_ref(state);
        let signature = match &config.github.webhook_secret {
            Some(_) => {
                let header = req
                    .headers()
                    .get("X-Hub-Signature-256")
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| err("X-Hub-Signature-256 missing"))?
                    .strip_prefix("sha256=")
                    .ok_or_else(|| err("X-Hub-Signature-256 sha256= prefix missing"))?;
                Some(hex::decode(header).map_err(|_| err("X-Hub-Signature-256 malformed"))?)
            }
            None => None,
        };
        let body = Bytes::from_request(req, state).await.map_err(|_| err("error reading body"))?;
        if let (Some(secret), Some(signature)) = (&config.github.webhook_secret, signature) {
            verify_signature(secret, &body, &signature).map_err(|_| err("signature mismatch"))?;
        }
        let payload = serde_json::from_slice(&body).map_err(|_| err("error parsing body"))?;
        Ok(GitHubEvent { payload })
    }
}

pub fn verify_signature(
    secret: &str,
    body: &[u8],
    signature: &[u8],
) -> Result<(), hmac::digest::MacError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(signature)
}
