use std::{fs, sync::Arc};

use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use mergebot_core::{config::Config, models::PullRequestRef};
use mergebot_github::{
    Gateway,
    dummy::{DummyBackend, DummyPull},
};
use mergebot_jobs::{PendingSet, Processor};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

use super::*;

struct Harness {
    _dir: TempDir,
    state: AppState,
}

impl Harness {
    fn new(webhook_secret: Option<&str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("perms.yml"), "org/repo:\n  tests: [ci/build]\n  rules: []\n")
            .unwrap();
        let config: Config = serde_json::from_value(json!({
            "server": { "port": 0 },
            "github": { "bot_user": "alibot", "admins": ["admin"], "webhook_secret": webhook_secret },
            "policy": {
                "perms": dir.path().join("perms.yml"),
                "groups": dir.path().join("groups.yml"),
                "mapusers": dir.path().join("mapusers.yml"),
            },
        }))
        .unwrap();
        let backend = Arc::new(DummyBackend::new("alibot"));
        backend.add_pull(DummyPull::new(PullRequestRef::new("org/repo", 7), "abc123", "eve", &["a"]));
        let config = Arc::new(config);
        let gateway = Arc::new(Gateway::new(backend, true));
        let processor = Arc::new(Processor::new(gateway, config.clone(), Arc::new(PendingSet::new())));
        Self { _dir: dir, state: AppState { config, processor } }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = build_router().with_state(self.state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let (status, body) = self.send(Request::get(uri).body(Body::empty()).unwrap()).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn post(&self, payload: Value) -> (StatusCode, String) {
        let request = Request::post("/")
            .header("Content-Type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap();
        let (status, body) = self.send(request).await;
        (status, String::from_utf8(body).unwrap())
    }

    fn queued(&self) -> Vec<String> {
        self.state.processor.pending().list().iter().map(ToString::to_string).collect()
    }
}

fn comment_event(sender: &str) -> Value {
    json!({
        "action": "created",
        "issue": { "number": 7, "pull_request": { "url": "x" }, "closed_at": null },
        "sender": { "login": sender },
        "repository": { "full_name": "org/repo" },
    })
}

#[tokio::test]
async fn test_webhook_queues() {
    let h = Harness::new(None);
    assert_eq!(h.post(comment_event("alibot")).await, (StatusCode::OK, "roger".to_string()));
    assert!(h.queued().is_empty());

    assert_eq!(h.post(comment_event("alice")).await.1, "roger");
    assert_eq!(h.queued(), ["org/repo#7"]);
    h.state.processor.pending().take();

    // Unknown until the head has been seen.
    let status = json!({
        "state": "success", "context": "ci/build", "sha": "abc123",
        "repository": { "full_name": "org/repo" },
    });
    assert_eq!(h.post(status.clone()).await.1, "roger");
    assert!(h.queued().is_empty());
    h.state.processor.rescan().await.unwrap();
    h.state.processor.pending().take();
    h.post(status).await;
    assert_eq!(h.queued(), ["org/repo#7"]);
}

#[tokio::test]
async fn test_webhook_signature() {
    let h = Harness::new(Some("secret"));
    let (status, _) = h.post(comment_event("alice")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(h.queued().is_empty());

    let request = Request::post("/api/github/webhook")
        .header("X-Hub-Signature-256", format!("sha256={}", "00".repeat(32)))
        .body(Body::from(comment_event("alice").to_string()))
        .unwrap();
    assert_eq!(h.send(request).await.0, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_queue_endpoints() {
    let h = Harness::new(None);
    assert_eq!(h.get("/list").await, (StatusCode::OK, json!({ "queued": [] })));

    let (status, body) = h.get("/process/org/other/3").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "added_to_queue": "org/other#3" }));

    let (_, body) = h.get("/process/all").await;
    assert_eq!(body, json!({ "queued": ["org/other#3", "org/repo#7"] }));

    let (status, body) = h.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["stuck_threshold_s"], 300);

    let (status, body) = h.get("/perms").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tests"], json!({ "org/repo": ["ci/build"] }));
    assert_eq!(body["perms"]["org/repo"][0]["path"], "^.*$");
}
