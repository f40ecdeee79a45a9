use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dsync_core::{JobId, JobKind, SyncJob, UserId};
use dsync_storage::Store;
use dsync_sync::{SyncConfig, SyncOrchestrator};
use tracing::warn;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(name = "dsync")]
#[command(about = "Dota match history sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Register (or rename) a tracked user by 64-bit Steam id.
    AddUser { steam_id: i64, persona_name: String },
    Users,
    /// Create and run a sync job chain; ctrl-c cancels it.
    Trigger {
        user_id: UserId,
        /// full, incremental, missing-only, collect-ids or fetch-details
        kind: JobKind,
        /// Print progress while the jobs run.
        #[arg(long)]
        wait: bool,
    },
    Cancel { user_id: UserId, job_id: JobId },
    Jobs {
        user_id: UserId,
        #[arg(long)]
        limit: Option<u32>,
    },
    Job { user_id: UserId, job_id: JobId },
    /// Run the periodic incremental sync until ctrl-c.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command {
        Commands::Migrate => {
            let store = Store::connect(&config.store_config())
                .await
                .with_context(|| format!("connecting to {}", config.database_url))?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied: {}", config.database_url);
        }
        Commands::AddUser {
            steam_id,
            persona_name,
        } => {
            let orch = dsync_sync::build_orchestrator(&config).await?;
            let user = orch.store().upsert_user(steam_id, &persona_name).await?;
            println!(
                "user id={} steam_id={} account_id={} name={}",
                user.id,
                user.steam_id,
                user.account_id(),
                user.persona_name
            );
        }
        Commands::Users => {
            let orch = dsync_sync::build_orchestrator(&config).await?;
            for user in orch.store().list_users().await? {
                let counts = orch.store().match_counts(user.id).await?;
                println!(
                    "user id={} name={} last_sync={} complete={} stub={} failed={}",
                    user.id,
                    user.persona_name,
                    user.last_sync_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string()),
                    counts.complete,
                    counts.stub,
                    counts.failed
                );
            }
        }
        Commands::Trigger {
            user_id,
            kind,
            wait,
        } => {
            let orch = dsync_sync::build_orchestrator(&config).await?;
            let jobs = orch.trigger(user_id, kind).await?;
            for job in &jobs {
                print_job(job);
            }
            run_to_completion(&orch, user_id, &jobs, wait).await?;
        }
        Commands::Cancel { user_id, job_id } => {
            let orch = dsync_sync::build_orchestrator(&config).await?;
            print_job(&orch.cancel(user_id, job_id).await?);
        }
        Commands::Jobs { user_id, limit } => {
            let orch = dsync_sync::build_orchestrator(&config).await?;
            for job in orch.jobs(user_id, limit).await? {
                print_job(&job);
            }
        }
        Commands::Job { user_id, job_id } => {
            let orch = dsync_sync::build_orchestrator(&config).await?;
            print_job(&orch.job(user_id, job_id).await?);
        }
        Commands::Schedule => {
            let orch = dsync_sync::build_orchestrator(&config).await?;
            let Some(sched) = dsync_sync::maybe_build_scheduler(&config, orch).await? else {
                bail!("scheduler disabled; set DSYNC_SCHEDULER_ENABLED=true");
            };
            println!("scheduler running: cron={}", config.sync_cron);
            dsync_sync::run_until_shutdown(sched).await?;
        }
    }

    Ok(())
}

/// Units run on this process's worker pool, so stay until every job in the
/// chain is terminal. Ctrl-c cancels whatever is still active.
async fn run_to_completion(
    orch: &SyncOrchestrator,
    user_id: UserId,
    jobs: &[SyncJob],
    progress: bool,
) -> Result<()> {
    for job in jobs {
        let finished = tokio::select! {
            finished = follow(orch, job.id, progress) => finished?,
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for ctrl-c")?;
                for pending in jobs.iter().filter(|j| j.id >= job.id) {
                    if let Err(err) = orch.cancel(user_id, pending.id).await {
                        warn!(job_id = pending.id, error = %err, "cancel on interrupt failed");
                    }
                }
                orch.wait_for_terminal(job.id, POLL_INTERVAL).await?
            }
        };
        print_job(&finished);
    }
    Ok(())
}

async fn follow(orch: &SyncOrchestrator, job_id: JobId, progress: bool) -> Result<SyncJob> {
    if !progress {
        return Ok(orch.wait_for_terminal(job_id, POLL_INTERVAL).await?);
    }
    let mut last = None;
    loop {
        let job = orch
            .store()
            .get_job(job_id)
            .await?
            .with_context(|| format!("job {job_id} disappeared"))?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        let snapshot = (job.status, job.processed, job.total);
        if last != Some(snapshot) {
            println!(
                "  job {} {} {}/{} ({:.0}%) new={}",
                job.id,
                job.status,
                job.processed,
                job.total,
                job.progress_percent(),
                job.new_matches
            );
            last = Some(snapshot);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn print_job(job: &SyncJob) {
    println!(
        "job id={} user={} kind={} status={} total={} processed={} new={} error={}",
        job.id,
        job.user_id,
        job.kind,
        job.status,
        job.total,
        job.processed,
        job.new_matches,
        job.error.as_deref().unwrap_or("-")
    );
}
