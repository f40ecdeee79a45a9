use std::sync::Arc;

use dsync_core::{CollectMode, MatchId, HISTORY_PAGE_SIZE};
use dsync_providers::{MatchProvider, PageCursor};
use dsync_storage::Store;
use serde::Serialize;
use tracing::{debug, info, info_span, Instrument};

use crate::control::JobContext;
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectSummary {
    pub ids_seen: i64,
    pub stubs_created: i64,
    pub pages: usize,
    pub cancelled: bool,
}

/// Phase 1: walk the provider's match history and record a stub for every
/// match id not yet known.
pub struct IdCollector {
    store: Store,
    provider: Arc<dyn MatchProvider>,
    page_size: usize,
}

impl IdCollector {
    pub fn new(store: Store, provider: Arc<dyn MatchProvider>) -> Self {
        Self {
            store,
            provider,
            page_size: HISTORY_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, HISTORY_PAGE_SIZE);
        self
    }

    pub async fn collect(
        &self,
        ctx: &JobContext,
        mode: CollectMode,
    ) -> Result<CollectSummary, SyncError> {
        let span = info_span!("collect_ids", job_id = ctx.job_id, user_id = ctx.user.id, ?mode);
        let summary = match mode {
            CollectMode::Full => self.collect_full(ctx).instrument(span).await?,
            CollectMode::Incremental => self.collect_incremental(ctx).instrument(span).await?,
        };
        info!(
            job_id = ctx.job_id,
            ids_seen = summary.ids_seen,
            stubs_created = summary.stubs_created,
            pages = summary.pages,
            cancelled = summary.cancelled,
            "id collection finished"
        );
        Ok(summary)
    }

    async fn collect_full(&self, ctx: &JobContext) -> Result<CollectSummary, SyncError> {
        let account_id = ctx.user.account_id();
        let mut summary = CollectSummary::default();
        let mut cursor: Option<PageCursor> = None;

        loop {
            if ctx.cancellation_requested().await {
                summary.cancelled = true;
                break;
            }

            let page = self
                .provider
                .fetch_history(account_id, self.page_size, cursor)
                .await?;
            summary.pages += 1;
            if page.is_empty() {
                break;
            }

            let ids: Vec<MatchId> = page.iter().map(|m| m.match_id).collect();
            self.record_page(ctx, &ids, &mut summary).await?;

            let oldest = ids.iter().copied().min().unwrap_or_default();
            if cursor.is_some_and(|c| oldest >= c.oldest_seen) {
                debug!(job_id = ctx.job_id, oldest, "history cursor did not advance");
                break;
            }
            if page.len() < self.page_size {
                break;
            }
            cursor = Some(PageCursor {
                oldest_seen: oldest,
                offset: summary.ids_seen as usize,
            });
        }
        Ok(summary)
    }

    /// One page, newest first, stopping at the newest fully fetched match.
    async fn collect_incremental(&self, ctx: &JobContext) -> Result<CollectSummary, SyncError> {
        let mut summary = CollectSummary::default();
        if ctx.cancellation_requested().await {
            summary.cancelled = true;
            return Ok(summary);
        }

        let watermark = self.store.complete_watermark(ctx.user.id).await?;
        let page = self
            .provider
            .fetch_history(ctx.user.account_id(), self.page_size, None)
            .await?;
        summary.pages = 1;

        let ids: Vec<MatchId> = page
            .iter()
            .map(|m| m.match_id)
            .take_while(|id| watermark.map_or(true, |w| *id > w))
            .collect();
        debug!(job_id = ctx.job_id, ?watermark, newer = ids.len(), "incremental page scanned");
        self.record_page(ctx, &ids, &mut summary).await?;
        Ok(summary)
    }

    async fn record_page(
        &self,
        ctx: &JobContext,
        ids: &[MatchId],
        summary: &mut CollectSummary,
    ) -> Result<(), SyncError> {
        let ids_seen = summary.ids_seen + ids.len() as i64;
        let created = self
            .store
            .record_collected_page(ctx.job_id, ctx.user.id, ids, ids_seen, summary.stubs_created)
            .await?;
        summary.ids_seen = ids_seen;
        summary.stubs_created += created as i64;
        Ok(())
    }
}
