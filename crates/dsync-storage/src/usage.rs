use chrono::Utc;
use dsync_core::{ApiCallRecord, ProviderKind};

use crate::{StorageResult, Store};

impl Store {
    pub async fn record_api_call(&self, call: &ApiCallRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO api_calls (provider, endpoint, authenticated, cost, status_code, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(call.provider.as_str())
        .bind(&call.endpoint)
        .bind(call.authenticated)
        .bind(call.cost)
        .bind(call.status.map(i64::from))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Newest first.
    pub async fn recent_api_calls(&self, limit: u32) -> StorageResult<Vec<ApiCallRecord>> {
        let rows: Vec<(String, String, bool, f64, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT provider, endpoint, authenticated, cost, status_code
              FROM api_calls
             ORDER BY id DESC
             LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for (provider, endpoint, authenticated, cost, status) in rows {
            records.push(ApiCallRecord {
                provider: provider.parse::<ProviderKind>()?,
                endpoint,
                authenticated,
                cost,
                status: status.and_then(|s| u16::try_from(s).ok()),
            });
        }
        Ok(records)
    }
}
