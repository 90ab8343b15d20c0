use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use time::OffsetDateTime;

/// A pull request, identified by repository full name and number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PullRequestRef {
    pub repo: String,
    pub number: u64,
}

impl PullRequestRef {
    pub fn new(repo: impl Into<String>, number: u64) -> Self { Self { repo: repo.into(), number } }
}

impl fmt::Display for PullRequestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

impl Serialize for PullRequestRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repository {
    pub full_name: String,
    pub default_branch: String,
    pub private: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MergeableState {
    #[default]
    Unknown,
    Clean,
    Dirty,
}

impl MergeableState {
    /// Map the platform's mergeable state onto the three states the automaton cares about.
    /// Anything that is neither conflicting nor still being computed counts as clean.
    pub fn from_platform(mergeable: Option<bool>, state: Option<&str>) -> Self {
        match (mergeable, state) {
            (_, Some("dirty")) => Self::Dirty,
            (None, _) | (_, Some("unknown")) => Self::Unknown,
            (Some(false), _) => Self::Dirty,
            (Some(true), _) => Self::Clean,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Clean => "clean",
            Self::Dirty => "dirty",
        }
    }
}

impl fmt::Display for MergeableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequestSnapshot {
    pub pr: PullRequestRef,
    pub title: String,
    pub changed_files: u64,
    pub sha: String,
    pub closed_at: Option<OffsetDateTime>,
    pub mergeable: bool,
    pub mergeable_state: MergeableState,
    pub author: String,
    /// Committer timestamp of the head commit. Comments older than this are stale.
    pub head_committed_at: OffsetDateTime,
}

/// Head SHA of an open pull request, as returned by listings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PullHead {
    pub pr: PullRequestRef,
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Comment {
    pub body: String,
    /// First line of the body, trimmed.
    pub summary: String,
    pub author: String,
    pub created_at: OffsetDateTime,
}

impl Comment {
    pub fn new(body: impl Into<String>, author: impl Into<String>, created_at: OffsetDateTime) -> Self {
        let body = body.into();
        let summary = body.split('\n').next().unwrap_or_default().trim().to_string();
        Self { body, summary, author: author.into(), created_at }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Pending,
    Success,
    Error,
    Failure,
}

impl StatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub context: String,
    pub state: StatusState,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target_url: Option<String>,
}

impl Status {
    pub fn new(context: impl Into<String>, state: StatusState, description: impl Into<String>) -> Self {
        Self { context: context.into(), state, description: description.into(), target_url: None }
    }

    pub fn is(&self, state: StatusState, description: &str) -> bool {
        self.state == state && self.description == description
    }
}

/// API usage counters as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RateLimit {
    pub remaining: u64,
    pub limit: u64,
    /// Unix timestamp at which the counters are reset.
    pub reset: u64,
}

impl RateLimit {
    pub fn reset_in_secs(&self) -> i64 {
        self.reset as i64 - OffsetDateTime::now_utc().unix_timestamp()
    }
}
