use std::path::PathBuf;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub github: GitHubConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    /// Falls back to the `GITHUB_TOKEN` environment variable.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    #[serde(default = "default_api_url")]
    pub api_url: Url,
    #[serde(default = "default_web_url")]
    pub web_url: Url,
    pub bot_user: String,
    pub admins: Vec<String>,
    #[serde(default, skip_serializing)]
    pub webhook_secret: Option<String>,
}

fn default_api_url() -> Url { Url::parse("https://api.github.com").expect("valid URL") }

fn default_web_url() -> Url { Url::parse("https://github.com").expect("valid URL") }

impl GitHubConfig {
    pub fn resolve_token(&self) -> Option<String> {
        self.token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty()))
    }

    /// Link to a pull request page, without trailing slash issues.
    pub fn pull_url(&self, repo: &str, number: u64) -> String {
        format!("{}/{}/pull/{}", self.web_url.as_str().trim_end_matches('/'), repo, number)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub process_every_secs: u64,
    /// Zero disables periodic rescans.
    pub rescan_every_secs: u64,
    pub stuck_threshold_secs: u64,
    pub workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { process_every_secs: 30, rescan_every_secs: 600, stuck_threshold_secs: 300, workers: 4 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub path: PathBuf,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self { Self { path: PathBuf::from(".github-cache"), max_entries: 4000 } }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub perms: PathBuf,
    pub groups: PathBuf,
    pub mapusers: PathBuf,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            perms: PathBuf::from("perms.yml"),
            groups: PathBuf::from("groups.yml"),
            mapusers: PathBuf::from("mapusers.yml"),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.github.bot_user.trim().is_empty() {
            bail!("github.bot_user must be set");
        }
        if self.github.admins.iter().all(|a| a.trim().is_empty()) {
            bail!("github.admins must list at least one administrator");
        }
        if self.queue.process_every_secs < 5 {
            bail!("queue.process_every_secs must be at least 5");
        }
        if self.queue.rescan_every_secs != 0 && self.queue.rescan_every_secs < 10 {
            bail!("queue.rescan_every_secs must be 0 (disabled) or at least 10");
        }
        if self.queue.workers == 0 {
            bail!("queue.workers must be at least 1");
        }
        if self.cache.max_entries == 0 {
            bail!("cache.max_entries must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
server:
  port: 8000
github:
  bot_user: alibot
  admins: [alice]
"#;

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.github.api_url.as_str(), "https://api.github.com/");
        assert_eq!(config.queue.process_every_secs, 30);
        assert_eq!(config.queue.rescan_every_secs, 600);
        assert_eq!(config.cache.path, PathBuf::from(".github-cache"));
        assert_eq!(config.policy.perms, PathBuf::from("perms.yml"));
        assert_eq!(config.github.pull_url("org/repo", 42), "https://github.com/org/repo/pull/42");
    }

    #[test]
    fn test_validate() {
        let cases: &[(&str, bool)] = &[
            ("queue: { process_every_secs: 4 }", false),
            ("queue: { process_every_secs: 5 }", true),
            ("queue: { rescan_every_secs: 0 }", true),
            ("queue: { rescan_every_secs: 9 }", false),
            ("queue: { workers: 0 }", false),
            ("cache: { max_entries: 0 }", false),
        ];
        for &(extra, ok) in cases {
            let config: Config = serde_yaml::from_str(&format!("{MINIMAL}{extra}\n")).unwrap();
            assert_eq!(config.validate().is_ok(), ok, "{extra}");
        }
    }

    #[test]
    fn test_missing_admins() {
        let yaml = "server: { port: 1 }\ngithub: { bot_user: alibot, admins: [] }\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
