use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use mergebot_core::models::{
    Comment, MergeableState, PullHead, PullRequestRef, PullRequestSnapshot, RateLimit, Repository,
    Status, StatusState,
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::{
    Cause, GatewayError,
    backend::{Backend, ItemStream},
    client::{CachedClient, Fetched},
    http::Method,
};

const PER_PAGE: (&str, &str) = ("per_page", "100");

/// Commit dates remembered by the REST backend.
const MAX_COMMIT_DATES: usize = 2000;

/// Head commit dates by SHA, oldest evicted first.
#[derive(Default)]
struct CommitDates {
    dates: HashMap<String, OffsetDateTime>,
    order: VecDeque<String>,
}

impl CommitDates {
    fn get(&self, sha: &str) -> Option<OffsetDateTime> { self.dates.get(sha).copied() }

    fn insert(&mut self, sha: String, date: OffsetDateTime) {
        if self.dates.insert(sha.clone(), date).is_none() {
            self.order.push_back(sha);
        }
        while self.order.len() > MAX_COMMIT_DATES {
            if let Some(oldest) = self.order.pop_front() {
                self.dates.remove(&oldest);
            }
        }
    }
}

#[derive(Deserialize)]
struct UserJson {
    login: String,
}

#[derive(Deserialize)]
struct RepoJson {
    full_name: String,
    default_branch: Option<String>,
    #[serde(default)]
    private: bool,
}

#[derive(Deserialize)]
struct HeadJson {
    sha: String,
}

#[derive(Deserialize)]
struct PullJson {
    number: u64,
    #[serde(default)]
    title: String,
    head: HeadJson,
    #[serde(default)]
    changed_files: u64,
    closed_at: Option<String>,
    mergeable: Option<bool>,
    mergeable_state: Option<String>,
    user: UserJson,
}

#[derive(Deserialize)]
struct FileJson {
    filename: String,
}

#[derive(Deserialize)]
struct StatusJson {
    context: String,
    state: StatusState,
    description: Option<String>,
    target_url: Option<String>,
}

#[derive(Deserialize)]
struct CommentJson {
    body: Option<String>,
    user: UserJson,
    created_at: String,
}

#[derive(Deserialize)]
struct CommitJson {
    commit: CommitDetailJson,
}

#[derive(Deserialize)]
struct CommitDetailJson {
    committer: Option<SignatureJson>,
    author: Option<SignatureJson>,
}

#[derive(Deserialize)]
struct SignatureJson {
    date: String,
}

#[derive(Deserialize)]
struct RateLimitJson {
    resources: RateLimitResources,
}

#[derive(Deserialize)]
struct RateLimitResources {
    core: RateLimitCore,
}

#[derive(Deserialize)]
struct RateLimitCore {
    limit: u64,
    remaining: u64,
    reset: u64,
}

fn parse_time(value: &str) -> Result<OffsetDateTime, Cause> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|e| Cause::Invalid(format!("invalid timestamp {value:?}: {e}")))
}

fn decode<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, Cause> {
    serde_json::from_value(value).map_err(|e| Cause::Invalid(e.to_string()))
}

/// `NotFound` becomes `None`, `Forbidden` an error.
fn found<T>(operation: &str, fetched: Fetched<T>) -> Result<Option<T>, GatewayError> {
    match fetched {
        Fetched::Found(value) => Ok(Some(value)),
        Fetched::NotFound => Ok(None),
        Fetched::Forbidden => Err(GatewayError::new(operation, Cause::Forbidden)),
    }
}

/// GitHub REST backend.
pub struct RestBackend {
    client: Arc<CachedClient>,
    commit_dates: Mutex<CommitDates>,
}

impl RestBackend {
    pub fn new(client: Arc<CachedClient>) -> Self {
        Self { client, commit_dates: Mutex::new(CommitDates::default()) }
    }

    fn commit_dates(&self) -> MutexGuard<'_, CommitDates> {
        self.commit_dates.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn commit_date(&self, repo: &str, sha: &str) -> Result<OffsetDateTime, GatewayError> {
        let operation = format!("get commit {repo}@{sha}");
        let cached = self.commit_dates().get(sha);
        if let Some(date) = cached {
            return Ok(date);
        }
        let value = self
            .client
            .get(&format!("/repos/{repo}/commits/{sha}"), &[])
            .await
            .map_err(|e| GatewayError::new(&operation, e))?;
        let value = found(&operation, value)?
            .ok_or_else(|| GatewayError::new(&operation, Cause::NotFound))?;
        let commit: CommitJson = decode(value).map_err(|c| GatewayError::new(&operation, c))?;
        let signature = commit
            .commit
            .committer
            .or(commit.commit.author)
            .ok_or_else(|| GatewayError::new(&operation, Cause::Invalid("no commit date".into())))?;
        let date = parse_time(&signature.date).map_err(|c| GatewayError::new(&operation, c))?;
        self.commit_dates().insert(sha.to_string(), date);
        Ok(date)
    }

    /// Stream a paginated list, converting every item.
    fn list<'a, T, U, F>(&'a self, operation: String, path: String, convert: F) -> ItemStream<'a, U>
    where
        T: DeserializeOwned + 'a,
        U: Send + 'a,
        F: Fn(T) -> Result<U, Cause> + Send + Sync + 'a,
    {
        let pages = async move {
            let fetched = self
                .client
                .get_list(&path, &[PER_PAGE])
                .await
                .map_err(|e| GatewayError::new(&operation, e))?;
            let pages = found(&operation, fetched)?
                .ok_or_else(|| GatewayError::new(&operation, Cause::NotFound))?;
            Ok::<_, GatewayError>(pages.map(move |item| {
                let item = item.map_err(|e| GatewayError::new(&operation, e))?;
                decode::<T>(item)
                    .and_then(|raw| convert(raw))
                    .map_err(|c| GatewayError::new(&operation, c))
            }))
        };
        futures_util::stream::once(pages).try_flatten().boxed()
    }
}

#[async_trait]
impl Backend for RestBackend {
    async fn repository(&self, repo: &str) -> Result<Option<Repository>, GatewayError> {
        let operation = format!("get repository {repo}");
        let value = self
            .client
            .get(&format!("/repos/{repo}"), &[])
            .await
            .map_err(|e| GatewayError::new(&operation, e))?;
        let Some(value) = found(&operation, value)? else { return Ok(None) };
        let repo: RepoJson = decode(value).map_err(|c| GatewayError::new(&operation, c))?;
        Ok(Some(Repository {
            full_name: repo.full_name,
            default_branch: repo.default_branch.unwrap_or_else(|| "master".to_string()),
            private: repo.private,
        }))
    }

    async fn pull_request(
        &self,
        pr: &PullRequestRef,
    ) -> Result<Option<PullRequestSnapshot>, GatewayError> {
        let operation = format!("get pull request {pr}");
        let value = self
            .client
            .get(&format!("/repos/{}/pulls/{}", pr.repo, pr.number), &[])
            .await
            .map_err(|e| GatewayError::new(&operation, e))?;
        let Some(value) = found(&operation, value)? else { return Ok(None) };
        let pull: PullJson = decode(value).map_err(|c| GatewayError::new(&operation, c))?;
        let closed_at = pull
            .closed_at
            .as_deref()
            .map(parse_time)
            .transpose()
            .map_err(|c| GatewayError::new(&operation, c))?;
        let head_committed_at = self.commit_date(&pr.repo, &pull.head.sha).await?;
        Ok(Some(PullRequestSnapshot {
            pr: PullRequestRef::new(pr.repo.clone(), pull.number),
            title: pull.title,
            changed_files: pull.changed_files,
            mergeable: pull.mergeable.unwrap_or(false),
            mergeable_state: MergeableState::from_platform(
                pull.mergeable,
                pull.mergeable_state.as_deref(),
            ),
            sha: pull.head.sha,
            closed_at,
            author: pull.user.login,
            head_committed_at,
        }))
    }

    async fn open_pulls(&self, repo: &str) -> Result<Vec<PullHead>, GatewayError> {
        #[derive(Deserialize)]
        struct ListedPull {
            number: u64,
            head: HeadJson,
        }
        let repo_name = repo.to_string();
        let pulls = self.list(
            format!("list open pull requests of {repo}"),
            format!("/repos/{repo}/pulls?state=open"),
            |pull: ListedPull| Ok((pull.number, pull.head.sha)),
        );
        let pulls = pulls.try_collect::<Vec<_>>().await?;
        Ok(pulls
            .into_iter()
            .map(|(number, sha)| PullHead { pr: PullRequestRef::new(repo_name.clone(), number), sha })
            .collect())
    }

    fn changed_files<'a>(&'a self, pr: &'a PullRequestRef) -> ItemStream<'a, String> {
        self.list(
            format!("list files of {pr}"),
            format!("/repos/{}/pulls/{}/files", pr.repo, pr.number),
            |file: FileJson| Ok(file.filename),
        )
    }

    fn statuses<'a>(&'a self, repo: &'a str, sha: &'a str) -> ItemStream<'a, Status> {
        self.list(
            format!("list statuses of {repo}@{sha}"),
            format!("/repos/{repo}/commits/{sha}/statuses"),
            |status: StatusJson| {
                Ok(Status {
                    context: status.context,
                    state: status.state,
                    description: status.description.unwrap_or_default(),
                    target_url: status.target_url.filter(|u| !u.is_empty()),
                })
            },
        )
    }

    fn comments<'a>(&'a self, pr: &'a PullRequestRef) -> ItemStream<'a, Comment> {
        self.list(
            format!("list comments of {pr}"),
            format!("/repos/{}/issues/{}/comments", pr.repo, pr.number),
            |comment: CommentJson| {
                let created_at = parse_time(&comment.created_at)?;
                Ok(Comment::new(comment.body.unwrap_or_default(), comment.user.login, created_at))
            },
        )
    }

    async fn create_status(
        &self,
        repo: &str,
        sha: &str,
        status: &Status,
    ) -> Result<(), GatewayError> {
        let operation = format!("set status {} on {repo}@{sha}", status.context);
        let mut body = json!({
            "state": status.state,
            "context": status.context,
            "description": status.description,
        });
        if let Some(target_url) = &status.target_url {
            body["target_url"] = json!(target_url);
        }
        let result = self
            .client
            .send(Method::Post, &format!("/repos/{repo}/statuses/{sha}"), &body)
            .await
            .map_err(|e| GatewayError::new(&operation, e))?;
        found(&operation, result)?.ok_or_else(|| GatewayError::new(&operation, Cause::NotFound))?;
        Ok(())
    }

    async fn create_comment(&self, pr: &PullRequestRef, body: &str) -> Result<(), GatewayError> {
        let operation = format!("comment on {pr}");
        let result = self
            .client
            .send(
                Method::Post,
                &format!("/repos/{}/issues/{}/comments", pr.repo, pr.number),
                &json!({ "body": body }),
            )
            .await
            .map_err(|e| GatewayError::new(&operation, e))?;
        found(&operation, result)?.ok_or_else(|| GatewayError::new(&operation, Cause::NotFound))?;
        Ok(())
    }

    async fn merge(&self, pr: &PullRequestRef, sha: &str) -> Result<(), GatewayError> {
        let operation = format!("merge {pr}");
        let result = self
            .client
            .send(
                Method::Put,
                &format!("/repos/{}/pulls/{}/merge", pr.repo, pr.number),
                &json!({ "sha": sha }),
            )
            .await
            .map_err(|e| GatewayError::new(&operation, e))?;
        found(&operation, result)?.ok_or_else(|| GatewayError::new(&operation, Cause::NotFound))?;
        Ok(())
    }

    async fn rate_limit(&self) -> Result<Option<RateLimit>, GatewayError> {
        if let Some(rate_limit) = self.client.rate_limit() {
            return Ok(Some(rate_limit));
        }
        let operation = "get rate limit";
        let value = self
            .client
            .get("/rate_limit", &[])
            .await
            .map_err(|e| GatewayError::new(operation, e))?;
        let Some(value) = found(operation, value)? else { return Ok(None) };
        let RateLimitJson { resources: RateLimitResources { core } } =
            decode(value).map_err(|c| GatewayError::new(operation, c))?;
        Ok(Some(RateLimit { remaining: core.remaining, limit: core.limit, reset: core.reset }))
    }

    fn api_calls(&self) -> u64 { self.client.api_calls() }
}
