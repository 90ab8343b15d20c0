use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteKind {
    Merge,
    Test,
}

/// A comment summary the workflow reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `+1` or `+test`, from anyone.
    Vote(VoteKind),
    /// `<sha>: approval required: <approvers>`
    ApprovalRequired { sha: String, approvers: String },
    /// `<sha>: testing approved: ... further approval from <approvers>`
    TestingApproved { sha: String, approvers: String },
    /// `<sha>: approved: ...`
    Approved { sha: String },
    /// `<sha>: tests OK, approval required for merging: <approvers>`
    TestsOk { sha: String, approvers: String },
}

impl Directive {
    pub fn sha(&self) -> Option<&str> {
        match self {
            Self::Vote(_) => None,
            Self::ApprovalRequired { sha, .. }
            | Self::TestingApproved { sha, .. }
            | Self::Approved { sha }
            | Self::TestsOk { sha, .. } => Some(sha),
        }
    }

    /// Approver text carried by the directive, if any.
    pub fn approvers(&self) -> Option<&str> {
        match self {
            Self::ApprovalRequired { approvers, .. }
            | Self::TestingApproved { approvers, .. }
            | Self::TestsOk { approvers, .. } => Some(approvers),
            Self::Vote(_) | Self::Approved { .. } => None,
        }
    }
}

struct Patterns {
    vote: Regex,
    approval_required: Regex,
    testing_approved: Regex,
    approved: Regex,
    tests_ok: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        vote: Regex::new(r"^\+(1|test)").unwrap(),
        approval_required: Regex::new(r"^([a-fA-F0-9]+): approval required[^:]*: (.*)").unwrap(),
        testing_approved: Regex::new(r"^([a-fA-F0-9]+): testing approved.*further approval from (.*)")
            .unwrap(),
        approved: Regex::new(r"^([a-fA-F0-9]+): approved").unwrap(),
        tests_ok: Regex::new(r"^([a-fA-F0-9]+): tests OK, approval required[^:]*: (.*)").unwrap(),
    })
}

/// Recognize a comment summary, trying patterns in priority order.
pub fn parse(summary: &str) -> Option<Directive> {
    let p = patterns();
    if let Some(c) = p.vote.captures(summary) {
        let kind = if &c[1] == "test" { VoteKind::Test } else { VoteKind::Merge };
        return Some(Directive::Vote(kind));
    }
    if let Some(c) = p.approval_required.captures(summary) {
        return Some(Directive::ApprovalRequired { sha: c[1].to_string(), approvers: c[2].to_string() });
    }
    if let Some(c) = p.testing_approved.captures(summary) {
        return Some(Directive::TestingApproved { sha: c[1].to_string(), approvers: c[2].to_string() });
    }
    if let Some(c) = p.approved.captures(summary) {
        return Some(Directive::Approved { sha: c[1].to_string() });
    }
    if let Some(c) = p.tests_ok.captures(summary) {
        return Some(Directive::TestsOk { sha: c[1].to_string(), approvers: c[2].to_string() });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let cases = [
            ("+1", Some(Directive::Vote(VoteKind::Merge))),
            ("+1 looks good", Some(Directive::Vote(VoteKind::Merge))),
            ("+test", Some(Directive::Vote(VoteKind::Test))),
            ("+2", None),
            ("I say +1", None),
            (
                "abc123: approval required: 2 of @alice, @bob",
                Some(Directive::ApprovalRequired {
                    sha: "abc123".into(),
                    approvers: "2 of @alice, @bob".into(),
                }),
            ),
            (
                "abc123: approval required for merging: 1 of @bob",
                Some(Directive::ApprovalRequired { sha: "abc123".into(), approvers: "1 of @bob".into() }),
            ),
            (
                "abc123: testing approved: will not be automatically merged; starting testing. \
                 If testing succeeds, merging will require further approval from 1 of @carol",
                Some(Directive::TestingApproved {
                    sha: "abc123".into(),
                    approvers: "1 of @carol".into(),
                }),
            ),
            (
                "abc123: approved: will be automatically merged on successful tests",
                Some(Directive::Approved { sha: "abc123".into() }),
            ),
            (
                "ABC123: tests OK, approval required for merging: 1 of @dave (Dave)",
                Some(Directive::TestsOk { sha: "ABC123".into(), approvers: "1 of @dave (Dave)".into() }),
            ),
            ("xyz: approved", None),
            ("", None),
        ];
        for (summary, expected) in cases {
            assert_eq!(parse(summary), expected, "{summary}");
        }
    }

    #[test]
    fn test_accessors() {
        let directive = parse("abc123: tests OK, approval required for merging: 1 of @bob").unwrap();
        assert_eq!(directive.sha(), Some("abc123"));
        assert_eq!(directive.approvers(), Some("1 of @bob"));
        assert_eq!(parse("+1").unwrap().sha(), None);
        assert_eq!(parse("abc: approved").unwrap().approvers(), None);
    }
}
