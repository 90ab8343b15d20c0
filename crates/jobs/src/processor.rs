use std::{
    any::Any,
    collections::BTreeSet,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use futures_util::FutureExt;
use mergebot_core::{config::Config, models::PullRequestRef};
use mergebot_github::{Gateway, GatewayError};
use mergebot_perms::{Policy, PolicyError};
use mergebot_workflow::{Outcome, Workflow};
use serde::Serialize;
use tokio::{
    sync::{Notify, Semaphore},
    task::JoinSet,
};

use crate::pending::PendingSet;

/// Tally of one batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub done: usize,
    pub requeued: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: &'static str,
    /// Seconds spent in the current batch, zero when idle.
    pub running_since: f64,
    pub stuck_threshold_s: u64,
}

impl Health {
    pub fn is_stuck(&self) -> bool { self.status == "stuck" }
}

enum Verdict {
    Done,
    Requeue,
    Drop,
}

type TaskResult = Result<Result<Outcome, GatewayError>, Box<dyn Any + Send>>;

/// Drains the [`PendingSet`] in batches and runs the workflow on each entry.
pub struct Processor {
    gateway: Arc<Gateway>,
    config: Arc<Config>,
    pending: Arc<PendingSet>,
    must_exit: AtomicBool,
    wakeup: Notify,
    busy_since: Mutex<Option<Instant>>,
}

impl Processor {
    pub fn new(gateway: Arc<Gateway>, config: Arc<Config>, pending: Arc<PendingSet>) -> Self {
        Self {
            gateway,
            config,
            pending,
            must_exit: AtomicBool::new(false),
            wakeup: Notify::new(),
            busy_since: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Arc<Config> { &self.config }

    pub fn pending(&self) -> &Arc<PendingSet> { &self.pending }

    pub fn gateway(&self) -> &Arc<Gateway> { &self.gateway }

    fn busy_since(&self) -> MutexGuard<'_, Option<Instant>> {
        self.busy_since.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn load_policy(&self) -> Result<Policy, PolicyError> {
        Policy::load(&self.config.policy, &self.config.github.admins)
    }

    /// Stop taking new pull requests. The batch in flight finishes the
    /// pull requests already started and requeues the others.
    pub fn shutdown(&self) {
        self.must_exit.store(true, Ordering::SeqCst);
        self.wakeup.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool { self.must_exit.load(Ordering::SeqCst) }

    pub fn health(&self) -> Health {
        let running_since = self.busy_since().map_or(0.0, |since| since.elapsed().as_secs_f64());
        let stuck_threshold_s = self.config.queue.stuck_threshold_secs;
        let status = if running_since > stuck_threshold_s as f64 { "stuck" } else { "ok" };
        Health { status, running_since, stuck_threshold_s }
    }

    /// Process every queued pull request once. On a policy error the batch is
    /// put back and the error returned.
    pub async fn run_batch(&self) -> Result<BatchReport, PolicyError> {
        let batch = self.pending.take();
        let mut report = BatchReport::default();
        if batch.is_empty() {
            return Ok(report);
        }
        tracing::info!("Processing {} queued pull requests", batch.len());
        let policy = match self.load_policy() {
            Ok(policy) => Arc::new(policy),
            Err(e) => {
                self.pending.extend(batch);
                return Err(e);
            }
        };
        *self.busy_since() = Some(Instant::now());

        let semaphore = Arc::new(Semaphore::new(self.config.queue.workers.max(1)));
        let mut tasks = JoinSet::new();
        let mut running = BTreeSet::new();
        let mut items = batch.into_iter();
        while let Some(pr) = items.next() {
            if !policy.is_configured(&pr.repo) {
                tracing::debug!("Skipping {pr}: not a configured repository");
                report.dropped += 1;
                continue;
            }
            let permit = semaphore.clone().acquire_owned().await;
            if self.is_shutting_down() || permit.is_err() {
                tracing::info!("Interrupting batch: shutting down");
                let rest = std::iter::once(pr).chain(items.by_ref()).collect::<Vec<_>>();
                report.requeued += rest.len();
                self.pending.extend(rest);
                break;
            }
            let gateway = self.gateway.clone();
            let policy = policy.clone();
            let config = self.config.clone();
            running.insert(pr.clone());
            tasks.spawn(async move {
                let _permit = permit;
                let result =
                    AssertUnwindSafe(process_one(gateway, policy, config, pr.clone())).catch_unwind().await;
                (pr, result)
            });
        }

        self.collect(tasks, running, &mut report).await;

        self.gateway.log_usage().await;
        *self.busy_since() = None;
        tracing::info!(
            "Batch finished: {} done, {} requeued, {} dropped",
            report.done,
            report.requeued,
            report.dropped
        );
        Ok(report)
    }

    /// Wait for the workers and settle their pull requests. Those whose task
    /// never returned are requeued.
    async fn collect(
        &self,
        mut tasks: JoinSet<(PullRequestRef, TaskResult)>,
        mut running: BTreeSet<PullRequestRef>,
        report: &mut BatchReport,
    ) {
        while let Some(joined) = tasks.join_next().await {
            let (pr, result) = match joined {
                Ok(joined) => joined,
                Err(e) => {
                    tracing::error!("Worker task failed: {e}");
                    continue;
                }
            };
            running.remove(&pr);
            match settle(&pr, result) {
                Verdict::Done => report.done += 1,
                Verdict::Drop => report.dropped += 1,
                Verdict::Requeue => {
                    report.requeued += 1;
                    self.pending.insert(pr);
                }
            }
        }
        for pr in running {
            tracing::warn!("Worker for {pr} did not finish, retrying");
            report.requeued += 1;
            self.pending.insert(pr);
        }
    }

    /// Queue every open pull request of the configured repositories.
    /// Repositories the token cannot see are skipped. Returns how many were
    /// not queued yet.
    pub async fn rescan(&self) -> Result<usize, PolicyError> {
        let policy = self.load_policy()?;
        let mut added = 0;
        for repo in policy.repositories() {
            match self.gateway.get_repository(repo).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    tracing::warn!("Repository {repo} not found, skipping");
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Cannot get repository {repo}: {e}");
                    continue;
                }
            }
            match self.gateway.list_open_pulls(repo).await {
                Ok(prs) => {
                    for pr in prs {
                        tracing::debug!("Rescan: queueing {pr}");
                        if self.pending.insert(pr) {
                            added += 1;
                        }
                    }
                }
                Err(e) => tracing::warn!("Cannot list pull requests of {repo}: {e}"),
            }
        }
        Ok(added)
    }

    /// Sleep, run a batch, repeat until shut down. A new batch never starts
    /// before the previous one has finished.
    pub async fn run(&self) -> Result<()> {
        let interval = Duration::from_secs(self.config.queue.process_every_secs);
        while !self.is_shutting_down() {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.wakeup.notified() => {}
            }
            if self.is_shutting_down() {
                break;
            }
            self.run_batch().await.context("Failed to load permissions")?;
        }
        tracing::info!("Processor stopped with {} pull requests queued", self.pending.len());
        Ok(())
    }
}

async fn process_one(
    gateway: Arc<Gateway>,
    policy: Arc<Policy>,
    config: Arc<Config>,
    pr: PullRequestRef,
) -> Result<Outcome, GatewayError> {
    Workflow::new(&gateway, &policy, &config.github).process(&pr).await
}

fn settle(pr: &PullRequestRef, result: TaskResult) -> Verdict {
    match result {
        Ok(Ok(Outcome::Done)) => Verdict::Done,
        Ok(Ok(Outcome::Deferred)) => Verdict::Requeue,
        Ok(Err(e)) if e.is_transient() => {
            tracing::warn!("Cannot process {pr}, retrying: {e}");
            Verdict::Requeue
        }
        Ok(Err(e)) => {
            tracing::error!("Cannot process {pr}, removing from queue: {e}");
            Verdict::Drop
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            tracing::error!("Cannot process {pr}, retrying after panic: {message}");
            Verdict::Requeue
        }
    }
}
