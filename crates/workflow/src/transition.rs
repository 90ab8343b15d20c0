use std::collections::BTreeSet;

use mergebot_core::models::Comment;
use mergebot_perms::ApproverRequirement;
use time::OffsetDateTime;

use crate::{
    grammar::{self, Directive},
    state::{StateName, Vote, WorkflowState},
};

/// The identities that may steer the workflow besides the current approvers.
#[derive(Debug, Clone, Copy)]
pub struct Actors<'a> {
    pub bot_user: &'a str,
    pub admins: &'a BTreeSet<String>,
}

impl Actors<'_> {
    fn allows(&self, state: &WorkflowState, user: &str) -> bool {
        user == self.bot_user
            || self.admins.contains(user)
            || state.requirement.as_ref().is_some_and(|r| r.flat().contains(user))
    }
}

fn accepts(directive: &Directive, from: StateName) -> bool {
    use StateName::*;
    match directive {
        Directive::Vote(_) => {
            matches!(from, Initial | ApprovalRequired | ApprovalPending | MergeApprovalPending)
        }
        Directive::ApprovalRequired { .. }
        | Directive::TestingApproved { .. }
        | Directive::Approved { .. } => matches!(from, Initial | ApprovalPending),
        Directive::TestsOk { .. } => matches!(from, TestsOnly | MergeApprovalPending),
    }
}

impl WorkflowState {
    /// Apply one comment. Returns `None` when the comment causes no transition.
    pub fn evolve(&self, author: &str, summary: &str, actors: Actors<'_>) -> Option<Self> {
        let directive = grammar::parse(summary)?;
        if !accepts(&directive, self.name) {
            tracing::debug!("{summary:?} not applicable in state {}", self.name);
            return None;
        }
        if directive.sha().is_some_and(|sha| sha != self.sha) {
            tracing::debug!("{summary:?} does not pertain to {}", self.sha);
            return None;
        }
        if let Directive::Vote(kind) = directive {
            let mut next = self.clone();
            let vote = Vote { user: author.to_string(), kind };
            if self.name == StateName::MergeApprovalPending {
                next.merge_votes.push(vote);
            } else {
                next.votes.push(vote);
            }
            return Some(next);
        }
        if !actors.allows(self, author) {
            tracing::debug!("{author} may not move {} forward", self.name);
            return None;
        }
        let name = match directive {
            Directive::ApprovalRequired { .. } => StateName::ApprovalPending,
            Directive::TestingApproved { .. } => StateName::TestsOnly,
            Directive::Approved { .. } => StateName::TestsAutomerge,
            Directive::TestsOk { .. } => StateName::MergeApprovalPending,
            Directive::Vote(_) => return None,
        };
        let requirement = match directive.approvers() {
            Some(text) => match ApproverRequirement::parse(text) {
                Some(requirement) => Some(requirement),
                None => {
                    tracing::debug!("cannot parse approvers from {text:?}");
                    return None;
                }
            },
            None => self.requirement.clone(),
        };
        Some(self.enter(name, requirement, author))
    }
}

/// Reconstruct the state of head commit `sha` from comments, oldest first.
/// Comments written before `head_committed_at` are ignored.
pub fn replay<'c>(
    sha: &str,
    head_committed_at: OffsetDateTime,
    comments: impl IntoIterator<Item = &'c Comment>,
    actors: Actors<'_>,
) -> WorkflowState {
    let mut state = WorkflowState::initial(sha);
    for comment in comments {
        if comment.created_at < head_committed_at {
            tracing::debug!("* {} @ {}: {} (stale)", comment.author, comment.created_at, comment.summary);
            continue;
        }
        tracing::debug!("* {} @ {}: {}", comment.author, comment.created_at, comment.summary);
        if let Some(next) = state.evolve(&comment.author, &comment.summary, actors) {
            tracing::debug!("  => {next}");
            state = next;
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::grammar::VoteKind;

    fn admins() -> BTreeSet<String> { BTreeSet::from(["root".to_string()]) }

    fn comment(author: &str, body: &str) -> Comment {
        Comment::new(body, author, datetime!(2024-05-01 12:00 UTC))
    }

    fn run(comments: &[Comment]) -> WorkflowState {
        let admins = admins();
        let actors = Actors { bot_user: "alibot", admins: &admins };
        replay("abc123", datetime!(2024-05-01 10:00 UTC), comments, actors)
    }

    #[test]
    fn test_votes_before_announcement() {
        let state = run(&[comment("alice", "+1"), comment("bob", "+test")]);
        assert_eq!(state.name, StateName::Initial);
        assert_eq!(
            state.votes,
            [
                Vote { user: "alice".into(), kind: VoteKind::Merge },
                Vote { user: "bob".into(), kind: VoteKind::Test }
            ]
        );
    }

    #[test]
    fn test_announcements() {
        let state = run(&[
            comment("alibot", "abc123: approval required: 2 of @alice (Alice), @bob"),
            comment("alice", "+1"),
        ]);
        assert_eq!(state.name, StateName::ApprovalPending);
        assert_eq!(state.requirement.as_ref().map(|r| r.to_string()).as_deref(), Some("2 of @alice, @bob"));
        assert_eq!(state.opener.as_deref(), Some("alibot"));
        assert_eq!(state.votes.len(), 1);

        let state = run(&[
            comment("alibot", "abc123: approval required: 1 of @alice"),
            comment("alibot", "abc123: approved: will be automatically merged on successful tests"),
        ]);
        assert_eq!(state.name, StateName::TestsAutomerge);
        // The requirement is carried over.
        assert_eq!(state.requirement.as_ref().map(|r| r.to_string()).as_deref(), Some("1 of @alice"));
    }

    #[test]
    fn test_merge_stage() {
        let state = run(&[
            comment("alibot", "abc123: approval required: 1 of @alice"),
            comment("alice", "+test"),
            comment(
                "alibot",
                "abc123: testing approved: will not be automatically merged; starting testing. \
                 If testing succeeds, merging will require further approval from 1 of @alice",
            ),
            comment("alice", "+1"),
            comment("alibot", "abc123: tests OK, approval required for merging: 1 of @alice"),
            comment("alice", "+1"),
        ]);
        assert_eq!(state.name, StateName::MergeApprovalPending);
        assert_eq!(state.votes.len(), 1);
        // The vote cast while testing does not count for merging.
        assert_eq!(state.merge_votes, [Vote { user: "alice".into(), kind: VoteKind::Merge }]);
    }

    #[test]
    fn test_rejections() {
        let cases = [
            // Other head commit.
            (comment("alibot", "def456: approval required: 1 of @alice"), StateName::Initial),
            // Not an allowed opener.
            (comment("mallory", "abc123: approved"), StateName::Initial),
            // Unparsable approvers.
            (comment("alibot", "abc123: approval required: nobody"), StateName::Initial),
            // Not applicable from the initial state.
            (comment("alibot", "abc123: tests OK, approval required: 1 of @alice"), StateName::Initial),
            // Stale.
            (
                Comment::new(
                    "abc123: approval required: 1 of @alice",
                    "alibot",
                    datetime!(2024-05-01 09:00 UTC),
                ),
                StateName::Initial,
            ),
        ];
        for (comment, expected) in cases {
            assert_eq!(run(&[comment.clone()]).name, expected, "{:?}", comment.body);
        }
    }

    #[test]
    fn test_openers() {
        // Admins and current approvers may write directives.
        let state = run(&[comment("root", "abc123: approval required: 1 of @alice")]);
        assert_eq!(state.name, StateName::ApprovalPending);
        let state = run(&[
            comment("alibot", "abc123: approval required: 1 of @alice"),
            comment("alice", "abc123: approved"),
        ]);
        assert_eq!(state.name, StateName::TestsAutomerge);
        assert_eq!(state.opener.as_deref(), Some("alice"));
    }
}
