pub mod grammar;
pub mod state;
pub mod transition;

use futures_util::TryStreamExt;
use mergebot_core::{
    config::GitHubConfig,
    models::{MergeableState, PullRequestRef, PullRequestSnapshot, StatusState},
};
use mergebot_github::{Gateway, GatewayError};
use mergebot_perms::{ApproverRequirement, Policy, policy::MAX_REVIEWABLE_FILES};

use crate::{
    grammar::VoteKind,
    state::{StateName, Vote, WorkflowState},
    transition::Actors,
};

/// Status context carrying the review verdict.
pub const REVIEW_CONTEXT: &str = "review";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing left to do until the next event.
    Done,
    /// Mergeability is not known yet; try again later.
    Deferred,
}

/// Runs one pass of the approval workflow for a pull request.
pub struct Workflow<'a> {
    gateway: &'a Gateway,
    policy: &'a Policy,
    github: &'a GitHubConfig,
}

struct Applied {
    requirement: ApproverRequirement,
    changed: bool,
    tests_only: bool,
}

impl<'a> Workflow<'a> {
    pub fn new(gateway: &'a Gateway, policy: &'a Policy, github: &'a GitHubConfig) -> Self {
        Self { gateway, policy, github }
    }

    fn actors(&self) -> Actors<'a> {
        Actors { bot_user: &self.github.bot_user, admins: self.policy.admins() }
    }

    pub async fn process(&self, pr: &PullRequestRef) -> Result<Outcome, GatewayError> {
        let pull = self.gateway.get_pull_request(pr, false).await?;
        tracing::info!("~~~ processing {pr}: {} (changed files: {}) ~~~", pull.title, pull.changed_files);

        if pull.closed_at.is_some() {
            tracing::info!("{pr}: skipping: closed");
            return Ok(Outcome::Done);
        }
        if pull.changed_files == 0 {
            if !self.review_is(pr, StatusState::Error, "empty pull request").await? {
                let text = format!(
                    "@{}: your pull request changes no files ({}). You may want to fix it or close it.",
                    pull.author, pull.sha
                );
                self.gateway.add_comment(pr, &text).await?;
                self.set_review(pr, StatusState::Error, "empty pull request").await?;
            }
            tracing::info!("{pr}: skipping: empty");
            return Ok(Outcome::Done);
        }
        if !pull.mergeable {
            if pull.mergeable_state != MergeableState::Dirty {
                tracing::info!("{pr}: mergeability is {}, retrying later", pull.mergeable_state);
                return Ok(Outcome::Deferred);
            }
            if !self.review_is(pr, StatusState::Error, "conflicts").await? {
                let text = format!(
                    "@{}: there are conflicts in your changes ({}) you need to fix.\n\n\
                     _You can have a look at the [documentation](http://alisw.github.io/git-advanced/) \
                     or you can press the **Resolve conflicts** button and try to fix them from the \
                     web interface._",
                    pull.author, pull.sha
                );
                self.gateway.add_comment(pr, &text).await?;
                self.set_review(pr, StatusState::Error, "conflicts").await?;
            }
            tracing::info!("{pr}: skipping: cannot merge");
            return Ok(Outcome::Done);
        }

        let comments = self.gateway.list_comments(pr).try_collect::<Vec<_>>().await?;
        let state = transition::replay(&pull.sha, pull.head_committed_at, &comments, self.actors());
        tracing::info!("{pr}: final state is {state}");
        self.act(&pull, state).await?;
        Ok(Outcome::Done)
    }

    async fn act(&self, pull: &PullRequestSnapshot, state: WorkflowState) -> Result<(), GatewayError> {
        match state.name {
            StateName::Initial | StateName::ApprovalRequired => self.approval_pending(pull, &state, true).await,
            StateName::ApprovalPending => self.approval_pending(pull, &state, false).await,
            StateName::TestsOnly => self.tests_only(pull, &state).await,
            StateName::TestsAutomerge => self.tests_automerge(pull).await,
            StateName::MergeApprovalPending => self.merge_approval_pending(pull, &state).await,
        }
    }

    async fn compute_requirement(
        &self,
        pull: &PullRequestSnapshot,
    ) -> Result<ApproverRequirement, GatewayError> {
        let pr = &pull.pr;
        if pull.changed_files > MAX_REVIEWABLE_FILES {
            tracing::info!(
                "{pr}: {} (> {MAX_REVIEWABLE_FILES}) changed files, requesting approval from the admins only",
                pull.changed_files
            );
            return Ok(self.policy.admin_requirement());
        }
        let files = self.gateway.collect_changed_files(pr).await?;
        let requirement =
            self.policy.requirement(&pr.repo, &pull.author, files.iter().map(String::as_str));
        tracing::debug!("{pr}: computed approvers: {requirement}");
        Ok(requirement)
    }

    fn apply_votes(&self, requirement: &ApproverRequirement, votes: &[Vote]) -> Applied {
        let mut applied = Applied { requirement: requirement.clone(), changed: false, tests_only: false };
        for vote in votes {
            let (next, changed) = applied.requirement.approve(&vote.user, self.policy.admins());
            if changed {
                applied.changed = true;
                if vote.kind == VoteKind::Test {
                    applied.tests_only = true;
                }
            }
            applied.requirement = next;
        }
        applied
    }

    /// With `always_request`, approval is requested whenever votes leave the
    /// requirement unsatisfied.
    async fn approval_pending(
        &self,
        pull: &PullRequestSnapshot,
        state: &WorkflowState,
        always_request: bool,
    ) -> Result<(), GatewayError> {
        let pr = &pull.pr;
        let requirement = match &state.requirement {
            Some(requirement) => requirement.clone(),
            None => self.compute_requirement(pull).await?,
        };
        let unchanged = state.unchanged.clone().unwrap_or_else(|| requirement.clone());
        let mut applied = self.apply_votes(&requirement, &state.votes);
        // Nobody is left to approve the merge of an authorized change.
        applied.tests_only &= !unchanged.is_satisfied();

        if applied.requirement.is_satisfied() {
            let description = if applied.tests_only { "tests approved" } else { "merge approved" };
            self.set_review(pr, StatusState::Success, description).await?;
            for test in self.policy.tests(&pr.repo) {
                self.gateway.set_status(pr, test, StatusState::Pending, "test required", false).await?;
            }
            let text = if applied.tests_only {
                tracing::info!("{pr}: only testing approved, no automatic merge on test success");
                format!(
                    "{}: testing approved: will not be automatically merged; starting testing. \
                     If testing succeeds, merging will require further approval from {}",
                    pull.sha,
                    unchanged.display(self.policy.realnames())
                )
            } else {
                tracing::info!("{pr}: changes approved, automatic merge on test success");
                format!("{}: approved: will be automatically merged on successful tests", pull.sha)
            };
            return self.gateway.add_comment(pr, &text).await;
        }

        let review = self.gateway.get_status(pr, REVIEW_CONTEXT).await?;
        let not_pending = review.is_some_and(|s| s.state != StatusState::Pending);
        if always_request || applied.changed || not_pending {
            tracing::info!("{pr}: approval required by {}", applied.requirement);
            self.request_approval(pull, &applied.requirement).await
        } else {
            tracing::info!("{pr}: approvers unchanged, nothing to say");
            Ok(())
        }
    }

    async fn request_approval(
        &self,
        pull: &PullRequestSnapshot,
        requirement: &ApproverRequirement,
    ) -> Result<(), GatewayError> {
        let pr = &pull.pr;
        self.set_review(pr, StatusState::Pending, "pending approval").await?;
        let text = format!(
            "{}: approval required: {}\n\n\
             _Comment with `+1` to approve and allow automatic merging, or with `+test` to run \
             tests only. **Please comment on the pull request: [click here]({}) and comment at \
             the bottom of the page.**_",
            pull.sha,
            requirement.display(self.policy.realnames()),
            self.github.pull_url(&pr.repo, pr.number)
        );
        self.gateway.add_comment(pr, &text).await
    }

    async fn request_merge_approval(
        &self,
        pull: &PullRequestSnapshot,
        requirement: &ApproverRequirement,
    ) -> Result<(), GatewayError> {
        let pr = &pull.pr;
        let text = format!(
            "{}: tests OK, approval required for merging: {}\n\n\
             _Comment with `+1` to merge. **Please comment on the pull request: \
             [click here]({}) and comment at the bottom of the page.**_",
            pull.sha,
            requirement.display(self.policy.realnames()),
            self.github.pull_url(&pr.repo, pr.number)
        );
        self.gateway.add_comment(pr, &text).await
    }

    async fn tests_only(&self, pull: &PullRequestSnapshot, state: &WorkflowState) -> Result<(), GatewayError> {
        let pr = &pull.pr;
        self.restore_review(pr, "tests approved").await?;
        if !self.tests_passed(pr).await? {
            tracing::info!("{pr}: tests in progress, will not merge automatically on success");
            return Ok(());
        }
        let requirement = match &state.requirement {
            Some(requirement) => requirement.clone(),
            None => self.policy.admin_requirement(),
        };
        tracing::info!("{pr}: all tests passed, requesting merge approval from {requirement}");
        self.request_merge_approval(pull, &requirement).await
    }

    async fn tests_automerge(&self, pull: &PullRequestSnapshot) -> Result<(), GatewayError> {
        let pr = &pull.pr;
        self.restore_review(pr, "merge approved").await?;
        if self.tests_passed(pr).await? {
            self.gateway.merge(pr).await
        } else {
            tracing::info!("{pr}: tests in progress, will merge automatically on success");
            Ok(())
        }
    }

    async fn merge_approval_pending(
        &self,
        pull: &PullRequestSnapshot,
        state: &WorkflowState,
    ) -> Result<(), GatewayError> {
        let pr = &pull.pr;
        let requirement = match &state.requirement {
            Some(requirement) => requirement.clone(),
            None => self.policy.admin_requirement(),
        };
        let applied = self.apply_votes(&requirement, &state.merge_votes);
        if applied.requirement.is_satisfied() {
            tracing::info!("{pr}: merge approved, merging now");
            return self.gateway.merge(pr).await;
        }
        let restored = self.restore_review(pr, "tests approved").await?;
        if applied.changed || restored {
            tracing::info!("{pr}: merge approvers changed to {}, notifying", applied.requirement);
            self.request_merge_approval(pull, &applied.requirement).await
        } else {
            tracing::info!("{pr}: merge approvers unchanged, nothing to say");
            Ok(())
        }
    }

    /// Every required test context has succeeded. Vacuously true without tests.
    async fn tests_passed(&self, pr: &PullRequestRef) -> Result<bool, GatewayError> {
        let tests = self.policy.tests(&pr.repo);
        if tests.is_empty() {
            return Ok(true);
        }
        let contexts = tests.iter().map(String::as_str).collect::<Vec<_>>();
        let statuses = self.gateway.get_statuses(pr, Some(contexts.as_slice())).await?;
        Ok(contexts.iter().all(|c| {
            let state = statuses.get(*c).map(|s| s.state);
            tracing::debug!("{pr}: required test {c} is {state:?}");
            state == Some(StatusState::Success)
        }))
    }

    async fn review_is(
        &self,
        pr: &PullRequestRef,
        state: StatusState,
        description: &str,
    ) -> Result<bool, GatewayError> {
        let review = self.gateway.get_status(pr, REVIEW_CONTEXT).await?;
        Ok(review.is_some_and(|s| s.is(state, description)))
    }

    async fn set_review(
        &self,
        pr: &PullRequestRef,
        state: StatusState,
        description: &str,
    ) -> Result<(), GatewayError> {
        self.gateway.set_status(pr, REVIEW_CONTEXT, state, description, false).await.map(|_| ())
    }

    /// Set the review back to success unless it already is. Returns whether
    /// it had to be restored.
    async fn restore_review(&self, pr: &PullRequestRef, description: &str) -> Result<bool, GatewayError> {
        let review = self.gateway.get_status(pr, REVIEW_CONTEXT).await?;
        if review.is_some_and(|s| s.state == StatusState::Success) {
            return Ok(false);
        }
        self.set_review(pr, StatusState::Success, description).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests;
