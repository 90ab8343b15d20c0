use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::OnceLock,
};

use regex::Regex;
use serde::Serialize;

/// `required` distinct approvals out of `members`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApproverGroup {
    pub required: usize,
    pub members: BTreeSet<String>,
}

/// Who still has to approve a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ApproverRequirement {
    Satisfied,
    Unsatisfied(Vec<ApproverGroup>),
}

impl ApproverRequirement {
    /// A single group needing one approval from `members`.
    pub fn one_of<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Unsatisfied(vec![ApproverGroup {
            required: 1,
            members: members.into_iter().map(Into::into).collect(),
        }])
    }

    pub fn is_satisfied(&self) -> bool { matches!(self, Self::Satisfied) }

    /// Apply a vote by `user`. A vote from one of `overrides` satisfies the
    /// requirement outright; otherwise the voter is removed from every group
    /// they belong to and each such group needs one approval less.
    ///
    /// Returns the new requirement and whether the vote had any effect.
    pub fn approve(&self, user: &str, overrides: &BTreeSet<String>) -> (Self, bool) {
        if overrides.contains(user) {
            return (Self::Satisfied, true);
        }
        let Self::Unsatisfied(groups) = self else { return (Self::Satisfied, true) };
        let mut changed = false;
        let mut groups = groups.clone();
        for group in &mut groups {
            if group.members.remove(user) {
                group.required = group.required.saturating_sub(1);
                changed = true;
            }
        }
        if !changed {
            return (self.clone(), false);
        }
        groups.retain(|g| g.required > 0);
        if groups.is_empty() { (Self::Satisfied, true) } else { (Self::Unsatisfied(groups), true) }
    }

    /// Union of all group members.
    pub fn flat(&self) -> BTreeSet<String> {
        match self {
            Self::Satisfied => BTreeSet::new(),
            Self::Unsatisfied(groups) => groups.iter().flat_map(|g| g.members.iter().cloned()).collect(),
        }
    }

    /// Parse the textual form written by [`ApproverRequirement::display`],
    /// e.g. `2 of @alice (Alice A.), @bob; 1 of @carol`. Mentions are stripped
    /// of `@` and of any parenthesized real name. Returns `None` when the text
    /// holds no usable group.
    pub fn parse(text: &str) -> Option<Self> {
        static REGEX: OnceLock<Regex> = OnceLock::new();
        static REALNAME: OnceLock<Regex> = OnceLock::new();
        let regex = REGEX.get_or_init(|| Regex::new(r"([0-9]+) of ([^;]+)").unwrap());
        // Real names may hold commas and semicolons themselves.
        let realname = REALNAME.get_or_init(|| Regex::new(r"\([^)]*\)").unwrap());
        let text = realname.replace_all(text, "");
        let groups = regex
            .captures_iter(&text)
            .filter_map(|c| {
                let required = c[1].parse::<usize>().ok()?;
                let members = c[2]
                    .split(',')
                    .map(strip_mention)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .collect::<BTreeSet<_>>();
                (required > 0 && !members.is_empty()).then_some(ApproverGroup { required, members })
            })
            .collect::<Vec<_>>();
        (!groups.is_empty()).then_some(Self::Unsatisfied(groups))
    }

    /// Human-readable form, decorating mentions with real names when known.
    pub fn display<'a>(&'a self, realnames: &'a BTreeMap<String, String>) -> RequirementDisplay<'a> {
        RequirementDisplay { requirement: self, realnames: Some(realnames) }
    }
}

fn strip_mention(member: &str) -> &str { member.trim_matches(|c: char| c == '@' || c.is_whitespace()) }

impl fmt::Display for ApproverRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        RequirementDisplay { requirement: self, realnames: None }.fmt(f)
    }
}

pub struct RequirementDisplay<'a> {
    requirement: &'a ApproverRequirement,
    realnames: Option<&'a BTreeMap<String, String>>,
}

impl fmt::Display for RequirementDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ApproverRequirement::Unsatisfied(groups) = self.requirement else {
            return f.write_str("approved");
        };
        for (i, group) in groups.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{} of ", group.required)?;
            for (j, member) in group.members.iter().enumerate() {
                if j > 0 {
                    f.write_str(", ")?;
                }
                match self.realnames.and_then(|r| r.get(member)) {
                    Some(name) if name != member => write!(f, "@{member} ({name})")?,
                    _ => write!(f, "@{member}")?,
                }
            }
        }
        Ok(())
    }
}

/// Accumulates per-file rule matches into a requirement.
///
/// Files matched by a rule the author is authorized for count only when
/// nothing else requires approval. Groups with identical members are merged,
/// keeping the stricter quorum.
#[derive(Debug, Default)]
pub struct RequirementBuilder {
    authorized: bool,
    groups: Vec<ApproverGroup>,
}

impl RequirementBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn authorized(&mut self) { self.authorized = true; }

    pub fn push(&mut self, required: usize, members: BTreeSet<String>) {
        match self.groups.iter_mut().find(|g| g.members == members) {
            Some(group) => group.required = group.required.max(required),
            None => self.groups.push(ApproverGroup { required, members }),
        }
    }

    /// An empty builder falls back to one approval from `admins`.
    pub fn build(self, admins: &BTreeSet<String>) -> ApproverRequirement {
        let groups = self.groups.into_iter().filter(|g| g.required > 0).collect::<Vec<_>>();
        if !groups.is_empty() {
            ApproverRequirement::Unsatisfied(groups)
        } else if self.authorized {
            ApproverRequirement::Satisfied
        } else {
            ApproverRequirement::one_of(admins.iter().cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(members: &[&str]) -> BTreeSet<String> { members.iter().map(|m| m.to_string()).collect() }

    fn two_of_three() -> ApproverRequirement {
        ApproverRequirement::Unsatisfied(vec![ApproverGroup {
            required: 2,
            members: set(&["alice", "bob", "carol"]),
        }])
    }

    #[test]
    fn test_quorum() {
        let admins = set(&["root"]);
        let pairs = [("alice", "bob"), ("alice", "carol"), ("bob", "carol"), ("carol", "alice")];
        for (first, second) in pairs {
            let (req, changed) = two_of_three().approve(first, &admins);
            assert!(changed);
            assert!(!req.is_satisfied());
            let (req, changed) = req.approve(second, &admins);
            assert!(changed);
            assert!(req.is_satisfied(), "{first} then {second}");
        }
    }

    #[test]
    fn test_non_member_and_repeat() {
        let admins = set(&["root"]);
        let (req, changed) = two_of_three().approve("mallory", &admins);
        assert!(!changed);
        assert_eq!(req, two_of_three());

        let (req, _) = two_of_three().approve("alice", &admins);
        let (again, changed) = req.approve("alice", &admins);
        assert!(!changed);
        assert_eq!(again, req);
        assert_eq!(again.to_string(), "1 of @bob, @carol");
    }

    #[test]
    fn test_admin_override() {
        let (req, changed) = two_of_three().approve("root", &set(&["root"]));
        assert!(changed);
        assert!(req.is_satisfied());
        let (req, changed) = ApproverRequirement::Satisfied.approve("anyone", &set(&["root"]));
        assert!(changed);
        assert!(req.is_satisfied());
    }

    #[test]
    fn test_member_of_several_groups() {
        let req = ApproverRequirement::Unsatisfied(vec![
            ApproverGroup { required: 1, members: set(&["alice", "bob"]) },
            ApproverGroup { required: 2, members: set(&["alice", "carol", "dave"]) },
        ]);
        let (req, _) = req.approve("alice", &BTreeSet::new());
        assert_eq!(req.to_string(), "1 of @carol, @dave");
        assert_eq!(req.flat(), set(&["carol", "dave"]));
    }

    #[test]
    fn test_parse() {
        let cases: &[(&str, Option<&str>)] = &[
            ("2 of @alice (Alice A.), @bob", Some("2 of @alice, @bob")),
            ("1 of alice; 2 of @bob, @carol (Carol)", Some("1 of @alice; 2 of @bob, @carol")),
            ("3 of @alice, , @bob", Some("3 of @alice, @bob")),
            ("1 of @jdoe (Doe, John), @bob", Some("1 of @bob, @jdoe")),
            ("1 of @jdoe (Doe; John); 1 of @bob", Some("1 of @jdoe; 1 of @bob")),
            ("0 of @alice", None),
            ("approved", None),
            ("", None),
        ];
        for &(text, expected) in cases {
            let parsed = ApproverRequirement::parse(text);
            assert_eq!(parsed.map(|r| r.to_string()).as_deref(), expected, "{text}");
        }
    }

    #[test]
    fn test_display_round_trip() {
        let realnames = BTreeMap::from([("alice".to_string(), "Alice A.".to_string())]);
        let req = two_of_three();
        let text = req.display(&realnames).to_string();
        assert_eq!(text, "2 of @alice (Alice A.), @bob, @carol");
        assert_eq!(ApproverRequirement::parse(&text), Some(req.clone()));
        assert_eq!(ApproverRequirement::Satisfied.to_string(), "approved");

        let realnames = BTreeMap::from([("bob".to_string(), "Doe, John".to_string())]);
        let text = req.display(&realnames).to_string();
        assert_eq!(text, "2 of @alice, @bob (Doe, John), @carol");
        assert_eq!(ApproverRequirement::parse(&text), Some(req));
    }

    #[test]
    fn test_builder() {
        let admins = set(&["root"]);
        let mut builder = RequirementBuilder::new();
        builder.authorized();
        builder.push(1, set(&["alice", "bob"]));
        builder.push(2, set(&["alice", "bob"]));
        builder.push(1, set(&["carol"]));
        assert_eq!(builder.build(&admins).to_string(), "2 of @alice, @bob; 1 of @carol");

        let mut builder = RequirementBuilder::new();
        builder.authorized();
        assert!(builder.build(&admins).is_satisfied());

        assert_eq!(RequirementBuilder::new().build(&admins).to_string(), "1 of @root");
    }
}
