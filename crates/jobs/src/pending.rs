use std::{
    collections::BTreeSet,
    sync::{Mutex, MutexGuard, PoisonError},
};

use mergebot_core::models::PullRequestRef;

/// Pull requests waiting for the next batch. Duplicates collapse.
#[derive(Debug, Default)]
pub struct PendingSet {
    items: Mutex<BTreeSet<PullRequestRef>>,
}

impl PendingSet {
    pub fn new() -> Self { Self::default() }

    fn items(&self) -> MutexGuard<'_, BTreeSet<PullRequestRef>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns whether the pull request was not queued yet.
    pub fn insert(&self, pr: PullRequestRef) -> bool { self.items().insert(pr) }

    pub fn extend(&self, prs: impl IntoIterator<Item = PullRequestRef>) { self.items().extend(prs); }

    /// Swap the set for an empty one, returning what was queued.
    pub fn take(&self) -> BTreeSet<PullRequestRef> { std::mem::take(&mut *self.items()) }

    pub fn list(&self) -> Vec<PullRequestRef> { self.items().iter().cloned().collect() }

    pub fn len(&self) -> usize { self.items().len() }

    pub fn is_empty(&self) -> bool { self.items().is_empty() }
}
