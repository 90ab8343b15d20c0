use std::{sync::Arc, time::Duration};

use mergebot_core::models::{MergeableState, PullRequestRef, Status, StatusState};
use mergebot_github::{
    Gateway,
    dummy::{DummyBackend, DummyPull},
};
use time::{OffsetDateTime, macros::datetime};

use super::*;

const PERMS: &str = r#"
org/repo:
  tests: [ci/build]
  rules:
    - "^src/": "approve=alice,bob num_approve=2"
    - "^docs/": "carol"
"#;

const MAPUSERS: &str = "
alice: alice Alice A.
bob: bob
carol: carol
";

struct Harness {
    backend: Arc<DummyBackend>,
    gateway: Gateway,
    policy: Policy,
    github: GitHubConfig,
    pr: PullRequestRef,
}

impl Harness {
    fn new(author: &str, files: &[&str]) -> Self {
        let backend = Arc::new(DummyBackend::new("alibot"));
        let pr = PullRequestRef::new("org/repo", 42);
        backend.add_pull(DummyPull::new(pr.clone(), "abc123", author, files));
        let github = serde_yaml::from_str("bot_user: alibot\nadmins: [admin]\n").unwrap();
        let policy = Policy::from_documents(
            "perms.yml",
            PERMS,
            None,
            Some(MAPUSERS),
            &["admin".to_string()],
        )
        .unwrap();
        Self { gateway: Gateway::new(backend.clone(), false), backend, policy, github, pr }
    }

    fn src(author: &str) -> Self { Self::new(author, &["src/a.c", "src/b.c", "src/c.c"]) }

    async fn run(&self) -> Outcome {
        Workflow::new(&self.gateway, &self.policy, &self.github).process(&self.pr).await.unwrap()
    }

    fn comment(&self, author: &str, body: &str) { self.backend.add_comment(&self.pr, author, body); }

    fn bot_comments(&self) -> Vec<String> { self.backend.bot_comments(&self.pr) }

    fn last_bot_summary(&self) -> String {
        self.bot_comments().last().and_then(|c| c.lines().next()).unwrap_or_default().to_string()
    }

    fn status(&self, context: &str) -> Option<Status> {
        self.backend.current_status("org/repo", "abc123", context)
    }

    fn ci_passes(&self) {
        self.backend.push_status("org/repo", "abc123", Status::new("ci/build", StatusState::Success, "ok"));
    }
}

#[tokio::test]
async fn test_approval_and_automerge() {
    let h = Harness::src("eve");
    assert_eq!(h.run().await, Outcome::Done);
    assert_eq!(h.last_bot_summary(), "abc123: approval required: 2 of @alice (Alice A.), @bob");
    assert!(h.bot_comments()[0].contains("[click here](https://github.com/org/repo/pull/42)"));
    assert!(h.status("review").unwrap().is(StatusState::Pending, "pending approval"));

    // Nothing new to say.
    h.run().await;
    assert_eq!(h.bot_comments().len(), 1);

    h.comment("alice", "+1");
    h.run().await;
    assert_eq!(h.last_bot_summary(), "abc123: approval required: 1 of @bob");

    h.comment("bob", "+1 thanks");
    h.run().await;
    assert_eq!(h.last_bot_summary(), "abc123: approved: will be automatically merged on successful tests");
    assert!(h.status("review").unwrap().is(StatusState::Success, "merge approved"));
    assert!(h.status("ci/build").unwrap().is(StatusState::Pending, "test required"));
    assert_eq!(h.bot_comments().len(), 3);

    // Waiting for tests.
    h.run().await;
    assert!(h.backend.merged().is_empty());

    h.ci_passes();
    h.run().await;
    assert_eq!(h.backend.merged(), [h.pr.clone()]);
    assert_eq!(h.bot_comments().len(), 3);

    // Closed now.
    let writes = h.backend.status_writes();
    assert_eq!(h.run().await, Outcome::Done);
    assert_eq!(h.backend.status_writes(), writes);
}

#[tokio::test]
async fn test_votes_from_non_approvers() {
    let h = Harness::src("eve");
    h.run().await;
    h.comment("mallory", "+1");
    h.comment("alice", "+1");
    h.comment("alice", "+1");
    h.run().await;
    assert_eq!(h.last_bot_summary(), "abc123: approval required: 1 of @bob");
    assert_eq!(h.bot_comments().len(), 2);
}

#[tokio::test]
async fn test_admin_vote() {
    let h = Harness::src("eve");
    h.run().await;
    h.comment("admin", "+1");
    h.run().await;
    assert_eq!(h.last_bot_summary(), "abc123: approved: will be automatically merged on successful tests");
}

#[tokio::test]
async fn test_too_many_files() {
    let files = (0..60).map(|i| format!("src/f{i}.c")).collect::<Vec<_>>();
    let files = files.iter().map(String::as_str).collect::<Vec<_>>();
    let h = Harness::new("eve", &files);
    h.run().await;
    assert_eq!(h.last_bot_summary(), "abc123: approval required: 1 of @admin");
}

#[tokio::test]
async fn test_authorized_author() {
    let h = Harness::new("carol", &["docs/index.md"]);
    h.run().await;
    assert_eq!(h.last_bot_summary(), "abc123: approved: will be automatically merged on successful tests");
    assert!(h.status("review").unwrap().is(StatusState::Success, "merge approved"));

    // Touching other paths still needs approval.
    let h = Harness::new("carol", &["docs/index.md", "src/a.c"]);
    h.run().await;
    assert_eq!(h.last_bot_summary(), "abc123: approval required: 2 of @alice (Alice A.), @bob");
}

#[tokio::test]
async fn test_tests_only() {
    let h = Harness::src("eve");
    h.run().await;
    h.comment("alice", "+test");
    h.comment("bob", "+1");
    h.run().await;
    assert!(h.last_bot_summary().starts_with("abc123: testing approved: will not be automatically merged"));
    assert!(h.last_bot_summary().ends_with("further approval from 2 of @alice (Alice A.), @bob"));
    assert!(h.status("review").unwrap().is(StatusState::Success, "tests approved"));

    // Tests still running.
    h.run().await;
    assert_eq!(h.bot_comments().len(), 2);

    h.ci_passes();
    h.run().await;
    assert_eq!(
        h.last_bot_summary(),
        "abc123: tests OK, approval required for merging: 2 of @alice (Alice A.), @bob"
    );
    assert!(h.bot_comments()[2].contains("_Comment with `+1` to merge."));

    h.run().await;
    assert_eq!(h.bot_comments().len(), 3);

    h.comment("alice", "+1");
    h.run().await;
    assert_eq!(h.last_bot_summary(), "abc123: tests OK, approval required for merging: 1 of @bob");
    assert!(h.backend.merged().is_empty());

    h.comment("bob", "+1");
    h.run().await;
    assert_eq!(h.backend.merged(), [h.pr.clone()]);
}

#[tokio::test]
async fn test_merge_stage_restores_review() {
    let h = Harness::src("eve");
    h.comment("alibot", "abc123: approval required: 1 of @alice");
    h.comment("alibot", "abc123: testing approved: starting testing, further approval from 1 of @alice");
    h.comment("alibot", "abc123: tests OK, approval required for merging: 1 of @alice");
    h.backend.push_status("org/repo", "abc123", Status::new("review", StatusState::Error, "conflicts"));
    h.run().await;
    assert!(h.status("review").unwrap().is(StatusState::Success, "tests approved"));
    assert_eq!(h.last_bot_summary(), "abc123: tests OK, approval required for merging: 1 of @alice (Alice A.)");
}

#[tokio::test]
async fn test_conflicts_reported_once() {
    let h = Harness::src("eve");
    h.backend.update_pull(&h.pr, |p| {
        p.snapshot.mergeable = false;
        p.snapshot.mergeable_state = MergeableState::Dirty;
    });
    for _ in 0..3 {
        assert_eq!(h.run().await, Outcome::Done);
    }
    assert_eq!(h.bot_comments().len(), 1);
    assert!(h.bot_comments()[0].starts_with("@eve: there are conflicts in your changes (abc123)"));
    assert!(h.status("review").unwrap().is(StatusState::Error, "conflicts"));
    assert_eq!(h.backend.status_writes(), 1);

    h.backend.update_pull(&h.pr, |p| {
        p.snapshot.mergeable = true;
        p.snapshot.mergeable_state = MergeableState::Clean;
    });
    h.run().await;
    assert_eq!(h.last_bot_summary(), "abc123: approval required: 2 of @alice (Alice A.), @bob");
    assert!(h.status("review").unwrap().is(StatusState::Pending, "pending approval"));
}

#[tokio::test]
async fn test_unknown_mergeability_deferred() {
    let h = Harness::src("eve");
    h.backend.update_pull(&h.pr, |p| {
        p.snapshot.mergeable = false;
        p.snapshot.mergeable_state = MergeableState::Unknown;
    });
    assert_eq!(h.run().await, Outcome::Deferred);
    assert!(h.bot_comments().is_empty());
    assert_eq!(h.backend.status_writes(), 0);
}

#[tokio::test]
async fn test_empty_and_closed() {
    let h = Harness::new("eve", &[]);
    h.run().await;
    h.run().await;
    assert_eq!(
        h.bot_comments(),
        ["@eve: your pull request changes no files (abc123). You may want to fix it or close it."]
    );
    assert!(h.status("review").unwrap().is(StatusState::Error, "empty pull request"));

    let h = Harness::src("eve");
    h.backend.update_pull(&h.pr, |p| p.snapshot.closed_at = Some(OffsetDateTime::now_utc()));
    assert_eq!(h.run().await, Outcome::Done);
    assert!(h.bot_comments().is_empty());
    assert_eq!(h.backend.status_writes(), 0);
}

#[tokio::test]
async fn test_stale_comments_ignored() {
    let h = Harness::src("eve");
    h.backend.push_commit(&h.pr, "abc123", datetime!(2024-05-01 10:00 UTC));
    h.backend.add_comment_at(&h.pr, "admin", "+1", datetime!(2024-05-01 09:59 UTC));
    h.run().await;
    assert_eq!(h.last_bot_summary(), "abc123: approval required: 2 of @alice (Alice A.), @bob");
}

#[tokio::test]
async fn test_new_commit_restarts() {
    let h = Harness::src("eve");
    h.run().await;
    h.comment("admin", "+1");
    h.run().await;
    assert!(h.last_bot_summary().starts_with("abc123: approved"));

    tokio::time::sleep(Duration::from_millis(5)).await;
    h.backend.push_commit(&h.pr, "def456", OffsetDateTime::now_utc());
    h.run().await;
    assert_eq!(h.last_bot_summary(), "def456: approval required: 2 of @alice (Alice A.), @bob");
    let review = h.backend.current_status("org/repo", "def456", "review").unwrap();
    assert!(review.is(StatusState::Pending, "pending approval"));
}

#[tokio::test]
async fn test_zero_tests_merge_immediately() {
    let h = Harness::src("eve");
    let policy = Policy::from_documents(
        "perms.yml",
        "org/repo:\n  rules: []\n",
        None,
        None,
        &["admin".to_string()],
    )
    .unwrap();
    let workflow = Workflow::new(&h.gateway, &policy, &h.github);
    workflow.process(&h.pr).await.unwrap();
    assert_eq!(h.last_bot_summary(), "abc123: approval required: 1 of @admin");
    h.comment("admin", "+1");
    workflow.process(&h.pr).await.unwrap();
    workflow.process(&h.pr).await.unwrap();
    assert_eq!(h.backend.merged(), [h.pr.clone()]);
}
