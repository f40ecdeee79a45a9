use std::sync::Arc;

use chrono::Utc;
use dsync_core::{AccountId, MatchRecord};
use dsync_providers::{normalize_match, MatchProvider};
use dsync_storage::{DetailBatch, DetailOutcome, JobProgress, Store};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::control::JobContext;
use crate::error::SyncError;
use crate::teammates::TeammateAggregator;

/// Records resolved between two durable commits.
pub const DETAIL_BATCH_SIZE: usize = 25;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FetchSummary {
    pub eligible: i64,
    pub fetched: i64,
    pub failed: i64,
    pub deferred: i64,
    pub cancelled: bool,
}

impl FetchSummary {
    pub fn processed(&self) -> i64 {
        self.fetched + self.failed + self.deferred
    }

    fn progress(&self) -> JobProgress {
        JobProgress {
            total: self.eligible,
            processed: self.processed(),
            new_matches: self.fetched,
        }
    }
}

/// Phase 2: resolve eligible stubs into full match records.
pub struct DetailFetcher {
    store: Store,
    provider: Arc<dyn MatchProvider>,
    batch_size: usize,
}

impl DetailFetcher {
    pub fn new(store: Store, provider: Arc<dyn MatchProvider>) -> Self {
        Self {
            store,
            provider,
            batch_size: DETAIL_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub async fn fetch(&self, ctx: &JobContext) -> Result<FetchSummary, SyncError> {
        let span = info_span!("fetch_details", job_id = ctx.job_id, user_id = ctx.user.id);
        self.run(ctx).instrument(span).await
    }

    async fn run(&self, ctx: &JobContext) -> Result<FetchSummary, SyncError> {
        let eligible = self.store.eligible_matches(ctx.user.id).await?;
        let mut summary = FetchSummary {
            eligible: eligible.len() as i64,
            ..Default::default()
        };
        self.store.set_job_total(ctx.job_id, summary.eligible).await?;
        info!(job_id = ctx.job_id, eligible = summary.eligible, "detail fetch started");

        let account_id = ctx.user.account_id();
        let aggregator = TeammateAggregator::new(ctx.user.id);
        let mut batch = DetailBatch::default();

        for record in &eligible {
            if ctx.cancellation_requested().await {
                summary.cancelled = true;
                break;
            }
            let outcome = self
                .attempt(record, account_id, &aggregator, &mut summary)
                .await;
            batch.outcomes.push(outcome);
            if batch.outcomes.len() >= self.batch_size {
                self.commit(ctx, &mut batch, &summary).await?;
            }
        }
        if !batch.outcomes.is_empty() {
            self.commit(ctx, &mut batch, &summary).await?;
        }

        info!(
            job_id = ctx.job_id,
            fetched = summary.fetched,
            failed = summary.failed,
            deferred = summary.deferred,
            cancelled = summary.cancelled,
            "detail fetch finished"
        );
        Ok(summary)
    }

    /// One provider call. Never fails the job; the outcome carries the
    /// record's next state.
    async fn attempt(
        &self,
        record: &MatchRecord,
        account_id: AccountId,
        aggregator: &TeammateAggregator,
        summary: &mut FetchSummary,
    ) -> DetailOutcome {
        let attempted_at = Utc::now();
        let resolved = match self.provider.fetch_details(record.id).await {
            Ok(payload) => {
                normalize_match(&payload, record.id, account_id).map_err(SyncError::from)
            }
            Err(err) => Err(SyncError::from(err)),
        };

        match resolved {
            Ok(normalized) => {
                summary.fetched += 1;
                let encounters = aggregator.deltas(&normalized);
                debug!(match_id = record.id, teammates = encounters.len(), "match resolved");
                DetailOutcome::Resolved {
                    match_id: record.id,
                    normalized: Box::new(normalized),
                    encounters,
                    attempted_at,
                }
            }
            Err(err) if err.is_outage() => {
                summary.deferred += 1;
                warn!(match_id = record.id, error = %err, "provider outage; match stays eligible");
                DetailOutcome::Unresolved {
                    match_id: record.id,
                    state: record.state.after_outage(),
                    error: err.to_string(),
                    attempted_at,
                }
            }
            Err(err) => {
                summary.failed += 1;
                let state = record.state.after_failure();
                if state.is_eligible() {
                    warn!(
                        match_id = record.id,
                        retries = state.retries(),
                        error = %err,
                        "detail fetch failed"
                    );
                } else {
                    warn!(
                        match_id = record.id,
                        error = %err,
                        "detail fetch failed; attempts exhausted"
                    );
                }
                DetailOutcome::Unresolved {
                    match_id: record.id,
                    state,
                    error: err.to_string(),
                    attempted_at,
                }
            }
        }
    }

    async fn commit(
        &self,
        ctx: &JobContext,
        batch: &mut DetailBatch,
        summary: &FetchSummary,
    ) -> Result<(), SyncError> {
        batch.progress = summary.progress();
        let written = self.store.commit_detail_batch(ctx.job_id, batch).await?;
        debug!(
            job_id = ctx.job_id,
            records = batch.outcomes.len(),
            written,
            processed = batch.progress.processed,
            "detail batch committed"
        );
        *batch = DetailBatch::default();
        Ok(())
    }
}
