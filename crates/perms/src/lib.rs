pub mod approvers;
pub mod policy;

pub use approvers::{ApproverGroup, ApproverRequirement, RequirementBuilder};
pub use policy::{Policy, PolicyError, Rule, RuleMatch};
