use std::fmt;

use mergebot_perms::ApproverRequirement;

use crate::grammar::VoteKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateName {
    Initial,
    ApprovalRequired,
    ApprovalPending,
    TestsOnly,
    TestsAutomerge,
    MergeApprovalPending,
}

impl StateName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::ApprovalRequired => "approval required",
            Self::ApprovalPending => "approval pending",
            Self::TestsOnly => "tests only",
            Self::TestsAutomerge => "tests automerge",
            Self::MergeApprovalPending => "merge approval pending",
        }
    }
}

impl fmt::Display for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub user: String,
    pub kind: VoteKind,
}

/// Where a pull request stands, as reconstructed from its comments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowState {
    pub name: StateName,
    /// Head commit the state applies to.
    pub sha: String,
    /// `None` until computed from the policy or announced in a comment.
    pub requirement: Option<ApproverRequirement>,
    /// The requirement as it was when this state was entered.
    pub unchanged: Option<ApproverRequirement>,
    /// Who wrote the comment that led to this state.
    pub opener: Option<String>,
    pub votes: Vec<Vote>,
    pub merge_votes: Vec<Vote>,
}

impl WorkflowState {
    pub fn initial(sha: impl Into<String>) -> Self {
        Self {
            name: StateName::Initial,
            sha: sha.into(),
            requirement: None,
            unchanged: None,
            opener: None,
            votes: Vec::new(),
            merge_votes: Vec::new(),
        }
    }

    /// Enter `name`, keeping the recorded votes.
    pub fn enter(
        &self,
        name: StateName,
        requirement: Option<ApproverRequirement>,
        opener: &str,
    ) -> Self {
        Self {
            name,
            sha: self.sha.clone(),
            unchanged: requirement.clone(),
            requirement,
            opener: Some(opener.to_string()),
            votes: self.votes.clone(),
            merge_votes: self.merge_votes.clone(),
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.sha)?;
        if let Some(requirement) = &self.requirement {
            write!(f, ", approvers: {requirement}")?;
        }
        if let Some(opener) = &self.opener {
            write!(f, ", opener: {opener}")?;
        }
        write!(f, ", votes: {}, merge votes: {}", self.votes.len(), self.merge_votes.len())
    }
}
