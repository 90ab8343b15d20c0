use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use mergebot_core::models::{
    Comment, MergeableState, PullHead, PullRequestRef, PullRequestSnapshot, RateLimit, Repository,
    Status,
};
use serde::Deserialize;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::{
    Cause, GatewayError,
    backend::{Backend, ItemStream},
};

/// A pull request held by the [`DummyBackend`].
#[derive(Debug, Clone)]
pub struct DummyPull {
    pub snapshot: PullRequestSnapshot,
    pub files: Vec<String>,
}

impl DummyPull {
    /// Open, clean pull request whose head commit dates from the Unix epoch.
    pub fn new(pr: PullRequestRef, sha: &str, author: &str, files: &[&str]) -> Self {
        Self {
            snapshot: PullRequestSnapshot {
                pr,
                title: String::new(),
                changed_files: files.len() as u64,
                sha: sha.to_string(),
                closed_at: None,
                mergeable: true,
                mergeable_state: MergeableState::Clean,
                author: author.to_string(),
                head_committed_at: OffsetDateTime::UNIX_EPOCH,
            },
            files: files.iter().map(|f| f.to_string()).collect(),
        }
    }
}

#[derive(Default)]
struct DummyState {
    pulls: BTreeMap<PullRequestRef, DummyPull>,
    /// Newest first, keyed by repository and SHA.
    statuses: HashMap<(String, String), Vec<Status>>,
    comments: HashMap<PullRequestRef, Vec<Comment>>,
    merged: Vec<PullRequestRef>,
    status_writes: usize,
}

/// In-memory backend used for local runs and tests.
pub struct DummyBackend {
    bot_user: String,
    state: Mutex<DummyState>,
}

#[derive(Deserialize)]
struct PullFixture {
    repo: String,
    number: u64,
    #[serde(default)]
    title: String,
    sha: String,
    author: String,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    mergeable_state: Option<MergeableState>,
    #[serde(default)]
    closed_at: Option<String>,
    #[serde(default)]
    committed_at: Option<String>,
    #[serde(default)]
    comments: Vec<CommentFixture>,
    #[serde(default)]
    statuses: Vec<Status>,
}

#[derive(Deserialize)]
struct CommentFixture {
    author: String,
    body: String,
    #[serde(default)]
    created_at: Option<String>,
}

fn parse_time(value: Option<&str>) -> Result<Option<OffsetDateTime>> {
    value
        .map(|v| OffsetDateTime::parse(v, &Rfc3339).with_context(|| format!("invalid time {v:?}")))
        .transpose()
}

impl DummyBackend {
    pub fn new(bot_user: impl Into<String>) -> Self {
        Self { bot_user: bot_user.into(), state: Mutex::new(DummyState::default()) }
    }

    fn state(&self) -> MutexGuard<'_, DummyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load every `*.yml`/`*.yaml` pull request fixture from `dir`.
    pub fn load_dir(bot_user: impl Into<String>, dir: &Path) -> Result<Self> {
        let backend = Self::new(bot_user);
        let mut paths = fs::read_dir(dir)
            .with_context(|| format!("Failed to read {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "yml" || ext == "yaml"))
            .collect::<Vec<_>>();
        paths.sort();
        for path in paths {
            let data = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let fixture: PullFixture = serde_yaml::from_str(&data)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            backend.add_fixture(fixture).with_context(|| format!("In {}", path.display()))?;
        }
        tracing::info!("Loaded {} dummy pull requests from {}", backend.state().pulls.len(), dir.display());
        Ok(backend)
    }

    fn add_fixture(&self, fixture: PullFixture) -> Result<()> {
        let pr = PullRequestRef::new(fixture.repo, fixture.number);
        let files = fixture.files.iter().map(String::as_str).collect::<Vec<_>>();
        let mut pull = DummyPull::new(pr.clone(), &fixture.sha, &fixture.author, &files);
        pull.snapshot.title = fixture.title;
        pull.snapshot.closed_at = parse_time(fixture.closed_at.as_deref())?;
        if let Some(at) = parse_time(fixture.committed_at.as_deref())? {
            pull.snapshot.head_committed_at = at;
        }
        if let Some(state) = fixture.mergeable_state {
            pull.snapshot.mergeable_state = state;
            pull.snapshot.mergeable = state == MergeableState::Clean;
        }
        let sha = fixture.sha;
        self.add_pull(pull);
        for comment in fixture.comments {
            let at = parse_time(comment.created_at.as_deref())?
                .unwrap_or_else(OffsetDateTime::now_utc);
            self.add_comment_at(&pr, &comment.author, &comment.body, at);
        }
        // Fixtures list statuses oldest first.
        let mut state = self.state();
        let list = state.statuses.entry((pr.repo.clone(), sha)).or_default();
        for status in fixture.statuses {
            list.insert(0, status);
        }
        Ok(())
    }

    pub fn add_pull(&self, pull: DummyPull) {
        self.state().pulls.insert(pull.snapshot.pr.clone(), pull);
    }

    pub fn add_comment(&self, pr: &PullRequestRef, author: &str, body: &str) {
        self.add_comment_at(pr, author, body, OffsetDateTime::now_utc());
    }

    pub fn add_comment_at(&self, pr: &PullRequestRef, author: &str, body: &str, at: OffsetDateTime) {
        self.state().comments.entry(pr.clone()).or_default().push(Comment::new(body, author, at));
    }

    /// Apply a change to a stored pull request.
    pub fn update_pull(&self, pr: &PullRequestRef, f: impl FnOnce(&mut DummyPull)) {
        if let Some(pull) = self.state().pulls.get_mut(pr) {
            f(pull);
        }
    }

    /// Replace the head commit, as a push to the pull request branch would.
    pub fn push_commit(&self, pr: &PullRequestRef, sha: &str, at: OffsetDateTime) {
        self.update_pull(pr, |pull| {
            pull.snapshot.sha = sha.to_string();
            pull.snapshot.head_committed_at = at;
        });
    }

    /// Add a status as an external CI system would.
    pub fn push_status(&self, repo: &str, sha: &str, status: Status) {
        self.state().statuses.entry((repo.to_string(), sha.to_string())).or_default().insert(0, status);
    }

    /// Current status per context of a commit.
    pub fn current_status(&self, repo: &str, sha: &str, context: &str) -> Option<Status> {
        self.state()
            .statuses
            .get(&(repo.to_string(), sha.to_string()))
            .and_then(|list| list.iter().find(|s| s.context == context).cloned())
    }

    pub fn comments_of(&self, pr: &PullRequestRef) -> Vec<Comment> {
        self.state().comments.get(pr).cloned().unwrap_or_default()
    }

    /// Comments written through the backend.
    pub fn bot_comments(&self, pr: &PullRequestRef) -> Vec<String> {
        self.comments_of(pr)
            .into_iter()
            .filter(|c| c.author == self.bot_user)
            .map(|c| c.body)
            .collect()
    }

    pub fn merged(&self) -> Vec<PullRequestRef> { self.state().merged.clone() }

    pub fn status_writes(&self) -> usize { self.state().status_writes }
}

#[async_trait]
impl Backend for DummyBackend {
    async fn repository(&self, repo: &str) -> Result<Option<Repository>, GatewayError> {
        let known = self.state().pulls.keys().any(|pr| pr.repo == repo);
        Ok(known.then(|| Repository {
            full_name: repo.to_string(),
            default_branch: "master".to_string(),
            private: false,
        }))
    }

    async fn pull_request(
        &self,
        pr: &PullRequestRef,
    ) -> Result<Option<PullRequestSnapshot>, GatewayError> {
        Ok(self.state().pulls.get(pr).map(|p| p.snapshot.clone()))
    }

    async fn open_pulls(&self, repo: &str) -> Result<Vec<PullHead>, GatewayError> {
        Ok(self
            .state()
            .pulls
            .values()
            .filter(|p| p.snapshot.pr.repo == repo && p.snapshot.closed_at.is_none())
            .map(|p| PullHead { pr: p.snapshot.pr.clone(), sha: p.snapshot.sha.clone() })
            .collect())
    }

    fn changed_files<'a>(&'a self, pr: &'a PullRequestRef) -> ItemStream<'a, String> {
        let files = match self.state().pulls.get(pr) {
            Some(pull) => pull.files.iter().cloned().map(Ok).collect::<Vec<_>>(),
            None => vec![Err(GatewayError::new(format!("list files of {pr}"), Cause::NotFound))],
        };
        stream::iter(files).boxed()
    }

    fn statuses<'a>(&'a self, repo: &'a str, sha: &'a str) -> ItemStream<'a, Status> {
        let statuses = self
            .state()
            .statuses
            .get(&(repo.to_string(), sha.to_string()))
            .cloned()
            .unwrap_or_default();
        stream::iter(statuses.into_iter().map(Ok)).boxed()
    }

    fn comments<'a>(&'a self, pr: &'a PullRequestRef) -> ItemStream<'a, Comment> {
        stream::iter(self.comments_of(pr).into_iter().map(Ok)).boxed()
    }

    async fn create_status(
        &self,
        repo: &str,
        sha: &str,
        status: &Status,
    ) -> Result<(), GatewayError> {
        let mut state = self.state();
        state.status_writes += 1;
        state
            .statuses
            .entry((repo.to_string(), sha.to_string()))
            .or_default()
            .insert(0, status.clone());
        Ok(())
    }

    async fn create_comment(&self, pr: &PullRequestRef, body: &str) -> Result<(), GatewayError> {
        if !self.state().pulls.contains_key(pr) {
            return Err(GatewayError::new(format!("comment on {pr}"), Cause::NotFound));
        }
        self.add_comment(pr, &self.bot_user, body);
        Ok(())
    }

    async fn merge(&self, pr: &PullRequestRef, sha: &str) -> Result<(), GatewayError> {
        let mut state = self.state();
        let Some(pull) = state.pulls.get_mut(pr) else {
            return Err(GatewayError::new(format!("merge {pr}"), Cause::NotFound));
        };
        if pull.snapshot.sha != sha {
            return Err(GatewayError::new(
                format!("merge {pr}"),
                Cause::Invalid(format!("head is {}, not {sha}", pull.snapshot.sha)),
            ));
        }
        pull.snapshot.closed_at = Some(OffsetDateTime::now_utc());
        state.merged.push(pr.clone());
        Ok(())
    }

    async fn rate_limit(&self) -> Result<Option<RateLimit>, GatewayError> {
        Ok(Some(RateLimit { remaining: 5000, limit: 5000, reset: 0 }))
    }
}

#[cfg(test)]
mod tests {
    use futures_util::TryStreamExt;
    use mergebot_core::models::StatusState;

    use super::*;

    #[tokio::test]
    async fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("42.yml"),
            r#"
repo: org/repo
number: 42
sha: abc123
author: bob
files: [src/a.rs, src/b.rs]
committed_at: 2024-05-01T10:00:00Z
comments:
  - { author: alice, body: "+1", created_at: "2024-05-01T11:00:00Z" }
statuses:
  - { context: ci/build, state: pending, description: building }
  - { context: ci/build, state: success, description: built }
"#,
        )
        .unwrap();
        fs::write(dir.path().join("README.md"), "ignored").unwrap();
        let backend = DummyBackend::load_dir("alibot", dir.path()).unwrap();
        let pr = PullRequestRef::new("org/repo", 42);

        let snapshot = backend.pull_request(&pr).await.unwrap().unwrap();
        assert_eq!(snapshot.changed_files, 2);
        assert_eq!(snapshot.mergeable_state, MergeableState::Clean);
        let files = backend.changed_files(&pr).try_collect::<Vec<_>>().await.unwrap();
        assert_eq!(files, ["src/a.rs", "src/b.rs"]);
        assert_eq!(backend.comments_of(&pr)[0].summary, "+1");
        let current = backend.current_status("org/repo", "abc123", "ci/build").unwrap();
        assert_eq!(current.state, StatusState::Success);
        assert_eq!(backend.open_pulls("org/repo").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_merge_requires_head() {
        let backend = DummyBackend::new("alibot");
        let pr = PullRequestRef::new("org/repo", 1);
        backend.add_pull(DummyPull::new(pr.clone(), "aaa", "bob", &["x"]));
        assert!(backend.merge(&pr, "bbb").await.is_err());
        backend.merge(&pr, "aaa").await.unwrap();
        assert_eq!(backend.merged(), [pr.clone()]);
        assert!(backend.open_pulls("org/repo").await.unwrap().is_empty());
    }
}
