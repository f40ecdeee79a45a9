use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::orchestrator::SyncOrchestrator;

/// Periodic incremental sync for every user, or `None` when disabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: SyncOrchestrator,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            if let Err(err) = orchestrator.sync_all_users().await {
                warn!(error = %err, "scheduled sync pass failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron, "sync scheduler configured");
    Ok(Some(sched))
}

/// Run the scheduler until ctrl-c.
pub async fn run_until_shutdown(mut sched: JobScheduler) -> Result<()> {
    sched.start().await.context("starting scheduler")?;
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
