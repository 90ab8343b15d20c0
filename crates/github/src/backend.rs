use async_trait::async_trait;
use futures_util::stream::BoxStream;
use mergebot_core::models::{
    Comment, PullHead, PullRequestRef, PullRequestSnapshot, RateLimit, Repository, Status,
};

use crate::GatewayError;

pub type ItemStream<'a, T> = BoxStream<'a, Result<T, GatewayError>>;

/// Storage and transport behind the [`Gateway`](crate::Gateway).
///
/// Lookups returning `Ok(None)` mean the object does not exist. Listings are
/// streams so that callers can stop early without fetching every page.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn repository(&self, repo: &str) -> Result<Option<Repository>, GatewayError>;

    async fn pull_request(
        &self,
        pr: &PullRequestRef,
    ) -> Result<Option<PullRequestSnapshot>, GatewayError>;

    async fn open_pulls(&self, repo: &str) -> Result<Vec<PullHead>, GatewayError>;

    fn changed_files<'a>(&'a self, pr: &'a PullRequestRef) -> ItemStream<'a, String>;

    /// Statuses of a commit, newest first.
    fn statuses<'a>(&'a self, repo: &'a str, sha: &'a str) -> ItemStream<'a, Status>;

    /// Comments of a pull request, oldest first.
    fn comments<'a>(&'a self, pr: &'a PullRequestRef) -> ItemStream<'a, Comment>;

    async fn create_status(&self, repo: &str, sha: &str, status: &Status)
    -> Result<(), GatewayError>;

    async fn create_comment(&self, pr: &PullRequestRef, body: &str) -> Result<(), GatewayError>;

    async fn merge(&self, pr: &PullRequestRef, sha: &str) -> Result<(), GatewayError>;

    async fn rate_limit(&self) -> Result<Option<RateLimit>, GatewayError>;

    /// Requests sent to the platform so far.
    fn api_calls(&self) -> u64 { 0 }
}
