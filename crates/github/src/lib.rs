pub mod backend;
pub mod cache;
pub mod client;
pub mod dummy;
pub mod http;
pub mod rest;
pub mod webhook;

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures_util::TryStreamExt;
use mergebot_core::models::{
    Comment, PullRequestRef, PullRequestSnapshot, RateLimit, Repository, Status, StatusState,
};
use thiserror::Error;

use crate::{
    backend::{Backend, ItemStream},
    client::ApiError,
};

#[derive(Debug, Error)]
pub enum Cause {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("not found")]
    NotFound,
    #[error("forbidden (rate limit exceeded?)")]
    Forbidden,
    #[error("{0}")]
    Invalid(String),
}

/// A failed gateway operation.
#[derive(Debug, Error)]
#[error("{operation}: {cause}")]
pub struct GatewayError {
    pub operation: String,
    #[source]
    pub cause: Cause,
}

impl GatewayError {
    pub fn new(operation: impl Into<String>, cause: impl Into<Cause>) -> Self {
        Self { operation: operation.into(), cause: cause.into() }
    }

    /// Transport failures, server errors and rate-limit refusals are worth retrying.
    pub fn is_transient(&self) -> bool {
        match &self.cause {
            Cause::Forbidden => true,
            Cause::Api(ApiError::Transport(_)) => true,
            Cause::Api(ApiError::UnexpectedStatus { status, .. }) => *status >= 500,
            Cause::Api(ApiError::PageUnavailable { status, .. }) => *status == 403,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self.cause, Cause::NotFound) }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The only component talking to the code-review platform.
pub struct Gateway {
    backend: Arc<dyn Backend>,
    read_only: bool,
    repos: Mutex<HashMap<String, Repository>>,
    pulls: Mutex<HashMap<PullRequestRef, PullRequestSnapshot>>,
    heads: Mutex<HashMap<String, PullRequestRef>>,
}

impl Gateway {
    pub fn new(backend: Arc<dyn Backend>, read_only: bool) -> Self {
        Self {
            backend,
            read_only,
            repos: Mutex::new(HashMap::new()),
            pulls: Mutex::new(HashMap::new()),
            heads: Mutex::new(HashMap::new()),
        }
    }

    pub async fn log_usage(&self) {
        let used = self.backend.api_calls();
        match self.rate_limit().await {
            Ok(Some(rl)) => tracing::debug!("used {used} API calls, {} left", rl.remaining),
            _ => tracing::debug!("used {used} API calls"),
        }
    }

    pub async fn get_repository(&self, repo: &str) -> Result<Repository, GatewayError> {
        if let Some(cached) = lock(&self.repos).get(repo).cloned() {
            return Ok(cached);
        }
        let repository = self
            .backend
            .repository(repo)
            .await?
            .ok_or_else(|| GatewayError::new(format!("get repository {repo}"), Cause::NotFound))?;
        lock(&self.repos).insert(repo.to_string(), repository.clone());
        Ok(repository)
    }

    /// Snapshot of a pull request. With `cached`, a snapshot fetched earlier in
    /// this process is returned without asking the backend.
    pub async fn get_pull_request(
        &self,
        pr: &PullRequestRef,
        cached: bool,
    ) -> Result<PullRequestSnapshot, GatewayError> {
        if cached && let Some(snapshot) = lock(&self.pulls).get(pr).cloned() {
            return Ok(snapshot);
        }
        let snapshot = self
            .backend
            .pull_request(pr)
            .await?
            .ok_or_else(|| GatewayError::new(format!("get pull request {pr}"), Cause::NotFound))?;
        self.remember_head(&snapshot.sha, pr);
        lock(&self.pulls).insert(pr.clone(), snapshot.clone());
        Ok(snapshot)
    }

    /// Only the latest head of a pull request resolves to it.
    fn remember_head(&self, sha: &str, pr: &PullRequestRef) {
        let mut heads = lock(&self.heads);
        heads.retain(|_, known| known != pr);
        heads.insert(sha.to_string(), pr.clone());
    }

    /// Open pull requests of `repo`. Cached heads and snapshots of pull
    /// requests of `repo` that are no longer open are forgotten.
    pub async fn list_open_pulls(
        &self,
        repo: &str,
    ) -> Result<BTreeSet<PullRequestRef>, GatewayError> {
        let heads = self.backend.open_pulls(repo).await?;
        let open = heads.iter().map(|head| head.pr.clone()).collect::<BTreeSet<_>>();
        lock(&self.pulls).retain(|pr, _| pr.repo != repo || open.contains(pr));
        let mut cache = lock(&self.heads);
        cache.retain(|_, pr| pr.repo != repo || open.contains(pr));
        for head in heads {
            cache.retain(|_, pr| *pr != head.pr);
            cache.insert(head.sha, head.pr);
        }
        Ok(open)
    }

    pub fn changed_files<'a>(&'a self, pr: &'a PullRequestRef) -> ItemStream<'a, String> {
        self.backend.changed_files(pr)
    }

    pub fn list_comments<'a>(&'a self, pr: &'a PullRequestRef) -> ItemStream<'a, Comment> {
        self.backend.comments(pr)
    }

    /// Current status per context on the head commit. With `contexts`, only
    /// those are collected and listing stops once all of them were seen.
    pub async fn get_statuses(
        &self,
        pr: &PullRequestRef,
        contexts: Option<&[&str]>,
    ) -> Result<HashMap<String, Status>, GatewayError> {
        let snapshot = self.get_pull_request(pr, true).await?;
        let mut statuses = HashMap::new();
        let mut stream = self.backend.statuses(&pr.repo, &snapshot.sha);
        while let Some(status) = stream.try_next().await? {
            if contexts.is_some_and(|c| !c.contains(&status.context.as_str())) {
                continue;
            }
            statuses.entry(status.context.clone()).or_insert(status);
            if contexts.is_some_and(|c| c.len() == statuses.len()) {
                break;
            }
        }
        Ok(statuses)
    }

    pub async fn get_status(
        &self,
        pr: &PullRequestRef,
        context: &str,
    ) -> Result<Option<Status>, GatewayError> {
        Ok(self.get_statuses(pr, Some(&[context])).await?.remove(context))
    }

    /// Set a status on the head commit. Unless `force`, nothing is written when
    /// the current status of `context` already has this state and description.
    /// Returns whether a write was issued.
    pub async fn set_status(
        &self,
        pr: &PullRequestRef,
        context: &str,
        state: StatusState,
        description: &str,
        force: bool,
    ) -> Result<bool, GatewayError> {
        let status = Status::new(context, state, description);
        if !force
            && let Some(current) = self.get_status(pr, context).await?
            && current.is(state, description)
            && current.target_url == status.target_url
        {
            tracing::debug!("{pr}: status {context} already {state} ({description})");
            return Ok(false);
        }
        let snapshot = self.get_pull_request(pr, true).await?;
        if self.read_only {
            tracing::info!("{pr}: dry run: would set status {context} to {state} ({description})");
            return Ok(false);
        }
        tracing::info!("{pr}: setting status {context} to {state} ({description})");
        self.backend.create_status(&pr.repo, &snapshot.sha, &status).await?;
        Ok(true)
    }

    pub async fn add_comment(&self, pr: &PullRequestRef, text: &str) -> Result<(), GatewayError> {
        let summary = text.lines().next().unwrap_or_default();
        if self.read_only {
            tracing::info!("{pr}: dry run: would comment: {summary}");
            return Ok(());
        }
        tracing::info!("{pr}: commenting: {summary}");
        self.backend.create_comment(pr, text).await
    }

    pub async fn merge(&self, pr: &PullRequestRef) -> Result<(), GatewayError> {
        let snapshot = self.get_pull_request(pr, true).await?;
        if self.read_only {
            tracing::info!("{pr}: dry run: would merge {}", snapshot.sha);
            return Ok(());
        }
        tracing::info!("{pr}: merging {}", snapshot.sha);
        self.backend.merge(pr, &snapshot.sha).await?;
        lock(&self.pulls).remove(pr);
        lock(&self.heads).retain(|_, known| known != pr);
        Ok(())
    }

    /// Pull request whose head is `sha`, among those seen by this process.
    pub fn find_pull_by_head_sha(&self, sha: &str) -> Option<PullRequestRef> {
        lock(&self.heads).get(sha).cloned()
    }

    pub async fn rate_limit(&self) -> Result<Option<RateLimit>, GatewayError> {
        self.backend.rate_limit().await
    }

    /// Changed file paths of a pull request, fully collected.
    pub async fn collect_changed_files(
        &self,
        pr: &PullRequestRef,
    ) -> Result<Vec<String>, GatewayError> {
        self.changed_files(pr).try_collect().await
    }
}
