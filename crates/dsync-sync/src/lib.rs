//! Two-phase match history sync: id collection, then detail fetching, run as
//! jobs on a bounded worker pool.

use std::sync::Arc;

use anyhow::{Context, Result};
use dsync_providers::build_provider;
use dsync_storage::Store;
use tracing::info;

mod collector;
mod config;
mod control;
mod error;
mod fetcher;
mod orchestrator;
mod scheduler;
mod teammates;

pub use collector::{CollectSummary, IdCollector};
pub use config::SyncConfig;
pub use control::{CancelFlag, JobContext};
pub use error::SyncError;
pub use fetcher::{DetailFetcher, FetchSummary, DETAIL_BATCH_SIZE};
pub use orchestrator::{
    EngineOptions, PhaseReport, SyncAllSummary, SyncOrchestrator, WorkerPool, CANCELLED_MESSAGE,
    DEFAULT_JOB_LIMIT,
};
pub use scheduler::{maybe_build_scheduler, run_until_shutdown};
pub use teammates::TeammateAggregator;

pub const CRATE_NAME: &str = "dsync-sync";

/// Connect, migrate and wire the configured provider into an orchestrator.
pub async fn build_orchestrator(config: &SyncConfig) -> Result<SyncOrchestrator> {
    let store = Store::connect(&config.store_config())
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    store.migrate().await.context("running migrations")?;

    let provider = build_provider(
        &config.provider,
        config.http_config(),
        Arc::new(store.clone()),
    )
    .context("building match provider")?;
    info!(
        provider = %config.provider.kind(),
        workers = config.worker_concurrency,
        "sync engine ready"
    );

    Ok(SyncOrchestrator::new(
        store,
        provider,
        WorkerPool::new(config.worker_concurrency),
        EngineOptions {
            history_page_size: config.history_page_size,
            detail_batch_size: config.detail_batch_size,
        },
    ))
}
