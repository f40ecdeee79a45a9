use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dsync_core::{JobId, JobKind, JobPhase, JobStatus, SyncJob, User, UserId, HISTORY_PAGE_SIZE};
use dsync_providers::MatchProvider;
use dsync_storage::Store;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::collector::{CollectSummary, IdCollector};
use crate::control::{CancelFlag, JobContext};
use crate::error::SyncError;
use crate::fetcher::{DetailFetcher, FetchSummary, DETAIL_BATCH_SIZE};

pub const CANCELLED_MESSAGE: &str = "Cancelled by user";
pub const DEFAULT_JOB_LIMIT: u32 = 10;
const MAX_JOB_LIMIT: u32 = 100;

/// Bounded set of tokio tasks that execute job units, plus the cancel flags
/// of the units currently known to this process.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    flags: Arc<Mutex<HashMap<JobId, CancelFlag>>>,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            flags: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn spawn<F>(&self, unit: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!("worker pool closed; dropping unit");
                return;
            };
            unit.await;
        })
    }

    fn register(&self, job_id: JobId) -> CancelFlag {
        let mut flags = self.flags.lock().unwrap_or_else(|p| p.into_inner());
        flags.entry(job_id).or_default().clone()
    }

    fn release(&self, job_id: JobId) {
        let mut flags = self.flags.lock().unwrap_or_else(|p| p.into_inner());
        flags.remove(&job_id);
    }

    /// Raise the flag of a unit owned by this process. Returns false when the
    /// job is not registered here.
    pub fn request_cancel(&self, job_id: JobId) -> bool {
        let flags = self.flags.lock().unwrap_or_else(|p| p.into_inner());
        match flags.get(&job_id) {
            Some(flag) => {
                flag.cancel();
                true
            }
            None => false,
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(4)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub history_page_size: usize,
    pub detail_batch_size: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            history_page_size: HISTORY_PAGE_SIZE,
            detail_batch_size: DETAIL_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseReport {
    Collected(CollectSummary),
    Fetched(FetchSummary),
}

impl PhaseReport {
    pub fn cancelled(&self) -> bool {
        match self {
            Self::Collected(s) => s.cancelled,
            Self::Fetched(s) => s.cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncAllSummary {
    pub users: usize,
    pub triggered: usize,
    pub skipped: usize,
    pub failed: usize,
}

struct Inner {
    store: Store,
    provider: Arc<dyn MatchProvider>,
    pool: WorkerPool,
    options: EngineOptions,
}

/// Creates jobs, dispatches them onto the worker pool and answers job
/// queries on behalf of a user.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Store,
        provider: Arc<dyn MatchProvider>,
        pool: WorkerPool,
        options: EngineOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                provider,
                pool,
                options,
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Create the job rows for `kind` and dispatch the first one. A second
    /// row, if any, runs as the continuation of the first whatever its
    /// outcome. Fails with `Conflict` while the user has an active job.
    pub async fn trigger(&self, user_id: UserId, kind: JobKind) -> Result<Vec<SyncJob>, SyncError> {
        let user = self
            .inner
            .store
            .get_user(user_id)
            .await?
            .ok_or(SyncError::UserNotFound(user_id))?;
        let jobs = self
            .inner
            .store
            .create_jobs(user_id, &kind.plan())
            .await?
            .ok_or(SyncError::Conflict { user_id })?;
        info!(
            user_id,
            %kind,
            job_ids = ?jobs.iter().map(|j| j.id).collect::<Vec<_>>(),
            "sync triggered"
        );

        let mut chain = jobs.clone().into_iter();
        if let Some(first) = chain.next() {
            self.submit(user, first, chain.next());
        }
        Ok(jobs)
    }

    fn submit(&self, user: User, job: SyncJob, next: Option<SyncJob>) {
        let flag = self.inner.pool.register(job.id);
        if let Some(next) = &next {
            self.inner.pool.register(next.id);
        }
        let this = self.clone();
        let span = info_span!("sync_job", job_id = job.id, user_id = user.id, kind = %job.kind);
        self.inner.pool.spawn(
            async move {
                this.run_unit(&user, &job, flag).await;
                this.inner.pool.release(job.id);
                if let Some(next) = next {
                    debug!(job_id = next.id, after = job.id, "dispatching continuation");
                    this.submit(user, next, None);
                }
            }
            .instrument(span),
        );
    }

    async fn run_unit(&self, user: &User, job: &SyncJob, flag: CancelFlag) {
        let store = &self.inner.store;
        match store.mark_job_running(job.id, Uuid::new_v4()).await {
            Ok(true) => {}
            Ok(false) => {
                info!(job_id = job.id, "job left pending before it started; skipping");
                return;
            }
            Err(err) => {
                error!(job_id = job.id, error = %err, "could not start job");
                self.finish(job, JobStatus::Failed, Some(err.to_string())).await;
                return;
            }
        }

        let ctx = JobContext::new(job.id, user.clone(), store.clone(), flag);
        let this = self.clone();
        let kind = job.kind;
        let phase = tokio::spawn(async move { this.run_phase(&ctx, kind).await });

        match phase.await {
            Ok(Ok(report)) if report.cancelled() => {
                info!(job_id = job.id, "job stopped after cancellation");
                self.finish(job, JobStatus::Cancelled, Some(CANCELLED_MESSAGE.to_string()))
                    .await;
            }
            Ok(Ok(_)) => {
                let finished = self.finish(job, JobStatus::Completed, None).await;
                if finished && job.kind.phase() == JobPhase::FetchDetails {
                    if let Err(err) = store.touch_last_sync(user.id, Utc::now()).await {
                        warn!(user_id = user.id, error = %err, "could not record last sync time");
                    }
                }
            }
            Ok(Err(err)) => {
                error!(job_id = job.id, error = %err, "job failed");
                self.finish(job, JobStatus::Failed, Some(err.to_string())).await;
            }
            Err(join_err) => {
                let message = panic_message(join_err);
                error!(job_id = job.id, error = %message, "job unit aborted");
                self.finish(job, JobStatus::Failed, Some(message)).await;
            }
        }
    }

    async fn run_phase(&self, ctx: &JobContext, kind: JobKind) -> Result<PhaseReport, SyncError> {
        let inner = &self.inner;
        match kind.phase() {
            JobPhase::CollectIds(mode) => {
                let collector = IdCollector::new(inner.store.clone(), inner.provider.clone())
                    .with_page_size(inner.options.history_page_size);
                Ok(PhaseReport::Collected(collector.collect(ctx, mode).await?))
            }
            JobPhase::FetchDetails => {
                let fetcher = DetailFetcher::new(inner.store.clone(), inner.provider.clone())
                    .with_batch_size(inner.options.detail_batch_size);
                Ok(PhaseReport::Fetched(fetcher.fetch(ctx).await?))
            }
        }
    }

    /// Returns true when this call moved the job to its terminal status.
    async fn finish(&self, job: &SyncJob, status: JobStatus, error: Option<String>) -> bool {
        match self
            .inner
            .store
            .finish_job(job.id, status, error.as_deref())
            .await
        {
            Ok(true) => {
                info!(job_id = job.id, %status, "job finished");
                true
            }
            Ok(false) => {
                debug!(job_id = job.id, "job already terminal");
                false
            }
            Err(err) => {
                error!(job_id = job.id, error = %err, "could not record job outcome");
                false
            }
        }
    }

    /// Stop a pending or running job. A running unit stops at its next
    /// cancellation check; work it already committed stays.
    pub async fn cancel(&self, user_id: UserId, job_id: JobId) -> Result<SyncJob, SyncError> {
        let job = self.job(user_id, job_id).await?;
        if !job.status.is_active() {
            return Err(SyncError::NotCancellable {
                job_id,
                status: job.status,
            });
        }
        let signalled = self.inner.pool.request_cancel(job_id);
        self.inner.store.cancel_job(job_id, CANCELLED_MESSAGE).await?;
        info!(job_id, user_id, signalled, "job cancelled");
        self.inner
            .store
            .get_job(job_id)
            .await?
            .ok_or(SyncError::JobNotFound(job_id))
    }

    pub async fn job(&self, user_id: UserId, job_id: JobId) -> Result<SyncJob, SyncError> {
        let job = self
            .inner
            .store
            .get_job(job_id)
            .await?
            .ok_or(SyncError::JobNotFound(job_id))?;
        if job.user_id != user_id {
            return Err(SyncError::Forbidden { job_id, user_id });
        }
        Ok(job)
    }

    /// Most recent jobs first.
    pub async fn jobs(
        &self,
        user_id: UserId,
        limit: Option<u32>,
    ) -> Result<Vec<SyncJob>, SyncError> {
        if self.inner.store.get_user(user_id).await?.is_none() {
            return Err(SyncError::UserNotFound(user_id));
        }
        let limit = limit.unwrap_or(DEFAULT_JOB_LIMIT).clamp(1, MAX_JOB_LIMIT);
        Ok(self.inner.store.jobs_for_user(user_id, limit).await?)
    }

    /// Trigger an incremental sync for every user without an active job.
    pub async fn sync_all_users(&self) -> Result<SyncAllSummary, SyncError> {
        let users = self.inner.store.list_users().await?;
        let mut summary = SyncAllSummary {
            users: users.len(),
            ..Default::default()
        };
        for user in users {
            match self.trigger(user.id, JobKind::Incremental).await {
                Ok(_) => summary.triggered += 1,
                Err(SyncError::Conflict { .. }) => {
                    debug!(user_id = user.id, "sync already active; skipping");
                    summary.skipped += 1;
                }
                Err(err) => {
                    warn!(user_id = user.id, error = %err, "scheduled sync not triggered");
                    summary.failed += 1;
                }
            }
        }
        info!(
            users = summary.users,
            triggered = summary.triggered,
            skipped = summary.skipped,
            failed = summary.failed,
            "scheduled sync pass"
        );
        Ok(summary)
    }

    /// Poll until the job reaches a terminal status.
    pub async fn wait_for_terminal(
        &self,
        job_id: JobId,
        poll: Duration,
    ) -> Result<SyncJob, SyncError> {
        loop {
            let job = self
                .inner
                .store
                .get_job(job_id)
                .await?
                .ok_or(SyncError::JobNotFound(job_id))?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            tokio::time::sleep(poll).await;
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "job unit was aborted".to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("job unit panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("job unit panicked: {message}")
    } else {
        "job unit panicked".to_string()
    }
}
