use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::processor::Processor;

pub type Scheduler = JobScheduler;

/// Start the periodic rescan of open pull requests. Returns `None` when
/// rescans are disabled.
pub async fn create(processor: Arc<Processor>) -> Result<Option<Scheduler>> {
    let every = processor.config().queue.rescan_every_secs;
    if every == 0 {
        tracing::warn!("Periodic rescans disabled, relying on webhooks only");
        return Ok(None);
    }
    let sched = JobScheduler::new().await?;

    // Catch up on events missed while webhooks were not delivered
    sched
        .add(Job::new_repeated_async(Duration::from_secs(every), move |_uuid, _l| {
            let processor = processor.clone();
            Box::pin(async move {
                if processor.is_shutting_down() {
                    return;
                }
                match processor.rescan().await {
                    Ok(0) => tracing::debug!("Rescan found nothing new"),
                    Ok(added) => tracing::info!("Rescan queued {added} pull requests"),
                    Err(e) => tracing::error!("Failed to rescan pull requests: {e:?}"),
                }
            })
        })?)
        .await?;

    sched.start().await?;
    tracing::info!("Rescanning open pull requests every {every}s");
    Ok(Some(sched))
}
