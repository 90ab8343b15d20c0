use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    path::{Path, PathBuf},
};

use mergebot_core::config::PolicyConfig;
use regex::Regex;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::approvers::{ApproverRequirement, RequirementBuilder};

/// Above this many changed files every pull request needs an administrator.
pub const MAX_REVIEWABLE_FILES: u64 = 50;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("cannot read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("{origin}: invalid YAML: {source}")]
    Syntax { origin: String, source: serde_yaml::Error },
    #[error("{origin}: {message}")]
    Invalid { origin: String, message: String },
    #[error("{origin}: invalid path pattern {pattern:?} for {repo}: {source}")]
    Pattern { origin: String, repo: String, pattern: String, source: regex::Error },
}

/// A path rule of one repository.
#[derive(Debug, Clone, Serialize)]
pub struct Rule {
    pub path: String,
    #[serde(skip)]
    regex: Regex,
    /// Authors who need no approval for matching files.
    pub authorized: BTreeSet<String>,
    pub approvers: BTreeSet<String>,
    pub required: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMatch {
    Authorized,
    Approval { required: usize, approvers: BTreeSet<String> },
}

impl Rule {
    fn new(path: &str, regex: Regex, approvers: BTreeSet<String>, required: usize) -> Self {
        Self { path: path.to_string(), regex, authorized: BTreeSet::new(), approvers, required }
    }

    pub fn matches(&self, file: &str) -> bool { self.regex.is_match(file) }

    pub fn evaluate(&self, author: &str) -> RuleMatch {
        if self.authorized.contains(author) {
            RuleMatch::Authorized
        } else {
            RuleMatch::Approval { required: self.required, approvers: self.approvers.clone() }
        }
    }
}

/// Per-repository rules and test contexts, with user name mappings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Policy {
    pub perms: BTreeMap<String, Vec<Rule>>,
    pub tests: BTreeMap<String, Vec<String>>,
    /// GitHub login to real name.
    pub usermap: BTreeMap<String, String>,
    #[serde(skip)]
    admins: BTreeSet<String>,
}

impl Policy {
    /// Load the policy files. The rules file must be valid; a broken group
    /// or user map only produces warnings.
    pub fn load(config: &PolicyConfig, admins: &[String]) -> Result<Self, PolicyError> {
        let perms = std::fs::read_to_string(&config.perms)
            .map_err(|source| PolicyError::Read { path: config.perms.clone(), source })?;
        let groups = read_optional(&config.groups);
        let mapusers = read_optional(&config.mapusers);
        Self::from_documents(
            &config.perms.display().to_string(),
            &perms,
            groups.as_deref(),
            mapusers.as_deref(),
            admins,
        )
    }

    pub fn from_documents(
        origin: &str,
        perms: &str,
        groups: Option<&str>,
        mapusers: Option<&str>,
        admins: &[String],
    ) -> Result<Self, PolicyError> {
        let admins = admins.iter().filter(|a| !a.is_empty()).cloned().collect::<BTreeSet<_>>();
        let invalid = |message: String| PolicyError::Invalid { origin: origin.to_string(), message };

        let document = serde_yaml::from_str::<Value>(perms)
            .map_err(|source| PolicyError::Syntax { origin: origin.to_string(), source })?;
        let document = match document {
            Value::Mapping(m) => m,
            Value::Null => Mapping::new(),
            _ => return Err(invalid("top level must be a mapping".into())),
        };

        let (dir_to_login, usermap) = parse_usermap(mapusers);
        let mut group_defs = groups.map(|g| parse_groups("groups", g)).unwrap_or_default();
        if let Some(own) = document.get("groups") {
            match own {
                Value::Mapping(m) => group_defs.extend(group_entries("perms groups", m)),
                _ => tracing::warn!("{origin}: ignoring groups: not a mapping"),
            }
        }
        let resolver = Resolver { groups: &group_defs, dir_to_login: &dir_to_login };

        let mut policy = Policy { usermap, admins: admins.clone(), ..Default::default() };
        for (key, section) in &document {
            let Some(repo) = key.as_str().filter(|k| k.contains('/')) else { continue };
            let Value::Mapping(section) = section else {
                return Err(invalid(format!("repository {repo}: section must be a mapping")));
            };
            let repo_admins = match section.get("admins") {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::String(s)) => split_list(s),
                Some(_) => return Err(invalid(format!("repository {repo}: admins must be a string"))),
            };
            let tests = match section.get("tests") {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Sequence(s)) => {
                    s.iter().filter_map(|t| t.as_str().map(str::to_string)).collect()
                }
                Some(_) => {
                    tracing::warn!("{origin}: {repo}: tests must be a list, ignoring");
                    Vec::new()
                }
            };
            let entries = match section.get("rules") {
                None | Some(Value::Null) => &[][..],
                Some(Value::Sequence(s)) => s.as_slice(),
                Some(_) => return Err(invalid(format!("repository {repo}: rules must be a list"))),
            };

            let mut rules = Vec::with_capacity(entries.len() + 1);
            for entry in entries {
                let Some((pattern, tokens)) = single_entry(entry) else {
                    tracing::warn!("{origin}: {repo}: skipping malformed rule {entry:?}");
                    continue;
                };
                let regex = Regex::new(pattern).map_err(|source| PolicyError::Pattern {
                    origin: origin.to_string(),
                    repo: repo.to_string(),
                    pattern: pattern.to_string(),
                    source,
                })?;
                rules.push(parse_rule(pattern, regex, tokens, &repo_admins, &resolver, &admins));
            }
            let catch_all = Regex::new("^.*$").map_err(|source| PolicyError::Pattern {
                origin: origin.to_string(),
                repo: repo.to_string(),
                pattern: "^.*$".into(),
                source,
            })?;
            rules.push(Rule::new("^.*$", catch_all, admins.clone(), 1));

            policy.perms.insert(repo.to_string(), rules);
            policy.tests.insert(repo.to_string(), tests);
        }
        Ok(policy)
    }

    pub fn is_configured(&self, repo: &str) -> bool { self.perms.contains_key(repo) }

    pub fn repositories(&self) -> impl Iterator<Item = &str> { self.perms.keys().map(String::as_str) }

    pub fn tests(&self, repo: &str) -> &[String] {
        self.tests.get(repo).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn admins(&self) -> &BTreeSet<String> { &self.admins }

    pub fn realnames(&self) -> &BTreeMap<String, String> { &self.usermap }

    /// First rule matching `file` decides.
    pub fn evaluate(&self, repo: &str, file: &str, author: &str) -> Option<RuleMatch> {
        self.perms.get(repo)?.iter().find(|r| r.matches(file)).map(|r| r.evaluate(author))
    }

    /// Requirement for a pull request by `author` touching `files`.
    pub fn requirement<'a>(
        &self,
        repo: &str,
        author: &str,
        files: impl IntoIterator<Item = &'a str>,
    ) -> ApproverRequirement {
        let mut builder = RequirementBuilder::new();
        for file in files {
            match self.evaluate(repo, file, author) {
                Some(RuleMatch::Authorized) => builder.authorized(),
                Some(RuleMatch::Approval { required, approvers }) => builder.push(required, approvers),
                None => builder.push(1, self.admins.clone()),
            }
        }
        builder.build(&self.admins)
    }

    /// Requirement for pull requests too large to review file by file.
    pub fn admin_requirement(&self) -> ApproverRequirement {
        ApproverRequirement::one_of(self.admins.iter().cloned())
    }
}

fn read_optional(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Some(contents),
        Err(e) => {
            tracing::warn!("cannot read {}: {e}", path.display());
            None
        }
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn single_entry(entry: &Value) -> Option<(&str, &str)> {
    let Value::Mapping(m) = entry else { return None };
    if m.len() != 1 {
        return None;
    }
    let (k, v) = m.iter().next()?;
    Some((k.as_str()?, v.as_str().unwrap_or_default()))
}

/// Returns the directory-to-login map and the login-to-real-name map.
fn parse_usermap(document: Option<&str>) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut dir_to_login = BTreeMap::new();
    let mut realnames = BTreeMap::new();
    let Some(document) = document else { return (dir_to_login, realnames) };
    let mapping = match serde_yaml::from_str::<Value>(document) {
        Ok(Value::Mapping(m)) => m,
        Ok(Value::Null) => return (dir_to_login, realnames),
        Ok(_) => {
            tracing::warn!("mapusers: not a mapping, ignoring");
            return (dir_to_login, realnames);
        }
        Err(e) => {
            tracing::warn!("mapusers: invalid YAML, ignoring: {e}");
            return (dir_to_login, realnames);
        }
    };
    for (dir, value) in &mapping {
        let (Some(dir), Some(value)) = (dir.as_str(), value.as_str()) else {
            tracing::warn!("mapusers: skipping entry {dir:?}");
            continue;
        };
        let value = value.trim();
        let (login, name) = value.split_once(' ').unwrap_or((value, value));
        if login.is_empty() {
            continue;
        }
        dir_to_login.insert(dir.to_string(), login.to_string());
        realnames.insert(login.to_string(), name.trim().to_string());
    }
    (dir_to_login, realnames)
}

fn parse_groups(origin: &str, document: &str) -> BTreeMap<String, Vec<String>> {
    match serde_yaml::from_str::<Value>(document) {
        Ok(Value::Mapping(m)) => group_entries(origin, &m).collect(),
        Ok(Value::Null) => BTreeMap::new(),
        Ok(_) => {
            tracing::warn!("{origin}: not a mapping, ignoring");
            BTreeMap::new()
        }
        Err(e) => {
            tracing::warn!("{origin}: invalid YAML, ignoring: {e}");
            BTreeMap::new()
        }
    }
}

fn group_entries<'a>(
    origin: &'a str,
    mapping: &'a Mapping,
) -> impl Iterator<Item = (String, Vec<String>)> + 'a {
    mapping.iter().filter_map(move |(name, members)| {
        let members = match members {
            Value::String(s) => s.split_whitespace().map(str::to_string).collect(),
            Value::Sequence(s) => s.iter().filter_map(|m| m.as_str().map(str::to_string)).collect(),
            _ => {
                tracing::warn!("{origin}: skipping group {name:?}");
                return None;
            }
        };
        Some((name.as_str()?.to_string(), members))
    })
}

struct Resolver<'a> {
    groups: &'a BTreeMap<String, Vec<String>>,
    dir_to_login: &'a BTreeMap<String, String>,
}

impl Resolver<'_> {
    /// Expand `@group` references and map directory names to logins.
    fn resolve<'t>(&self, names: impl IntoIterator<Item = &'t str>) -> BTreeSet<String> {
        let mut users = BTreeSet::new();
        let mut visiting = Vec::new();
        for name in names {
            self.expand(name, &mut visiting, &mut users);
        }
        users
            .into_iter()
            .filter_map(|u| match self.dir_to_login.get(&u) {
                Some(login) => Some(login.clone()),
                None => {
                    tracing::debug!("dropping unmapped user {u}");
                    None
                }
            })
            .collect()
    }

    fn expand(&self, name: &str, visiting: &mut Vec<String>, users: &mut BTreeSet<String>) {
        let Some(group) = name.strip_prefix('@') else {
            if !name.is_empty() {
                users.insert(name.to_string());
            }
            return;
        };
        if visiting.iter().any(|g| g == group) {
            return;
        }
        let Some(members) = self.groups.get(group) else {
            tracing::warn!("unknown group @{group}");
            return;
        };
        visiting.push(group.to_string());
        for member in members {
            self.expand(member, visiting, users);
        }
        visiting.pop();
    }
}

fn parse_rule(
    pattern: &str,
    regex: Regex,
    tokens: &str,
    repo_admins: &[String],
    resolver: &Resolver<'_>,
    admins: &BTreeSet<String>,
) -> Rule {
    let mut authorized = Vec::new();
    let mut approvers = Vec::new();
    let mut required = 1;
    for token in tokens.split_whitespace() {
        if let Some(list) = token.strip_prefix("approve=") {
            approvers.extend(split_list(list));
        } else if let Some(n) = token.strip_prefix("num_approve=") {
            required = match n.parse::<usize>() {
                Ok(n) if n >= 1 => n,
                _ => {
                    tracing::warn!("rule {pattern}: invalid num_approve={n}, using 1");
                    1
                }
            };
        } else if !token.contains('=') {
            authorized.extend(split_list(token));
        }
    }
    approvers.extend(repo_admins.iter().cloned());

    let authorized = resolver.resolve(authorized.iter().map(String::as_str));
    let mut approvers = resolver.resolve(approvers.iter().map(String::as_str));
    if approvers.is_empty() {
        approvers = admins.clone();
    }
    let required = required.min(approvers.len());
    Rule { path: pattern.to_string(), regex, authorized, approvers, required }
}
