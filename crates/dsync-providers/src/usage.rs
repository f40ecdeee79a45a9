use async_trait::async_trait;
use dsync_core::ApiCallRecord;
use dsync_storage::Store;
use tracing::warn;

/// Sink for per-call usage rows.
#[async_trait]
pub trait UsageRecorder: Send + Sync {
    async fn record(&self, call: ApiCallRecord) -> anyhow::Result<()>;

    /// Record without ever failing the caller.
    async fn record_best_effort(&self, call: ApiCallRecord) {
        let provider = call.provider;
        let endpoint = call.endpoint.clone();
        if let Err(err) = self.record(call).await {
            warn!(%provider, endpoint, error = %err, "failed to record api call");
        }
    }
}

#[async_trait]
impl UsageRecorder for Store {
    async fn record(&self, call: ApiCallRecord) -> anyhow::Result<()> {
        self.record_api_call(&call).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsage;

#[async_trait]
impl UsageRecorder for NoopUsage {
    async fn record(&self, _call: ApiCallRecord) -> anyhow::Result<()> {
        Ok(())
    }
}
