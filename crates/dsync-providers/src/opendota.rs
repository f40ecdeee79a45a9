use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dsync_core::{AccountId, MatchId, MatchSummary, ProviderKind};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::http::{ApiRequest, HttpFetcher};
use crate::{clamp_page_size, MatchProvider, PageCursor, ProviderError};

const HISTORY_ENDPOINT: &str = "/players/{account_id}/matches";
const DETAILS_ENDPOINT: &str = "/matches/{match_id}";

/// Per-call price once an API key is attached.
pub const KEYED_CALL_COST_USD: f64 = 0.0001;

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    match_id: MatchId,
    #[serde(default)]
    start_time: Option<i64>,
}

/// OpenDota backend. Anonymous calls are free; keyed calls are billed.
pub struct OpenDotaProvider {
    http: HttpFetcher,
    base_url: String,
    api_key: Option<String>,
}

impl OpenDotaProvider {
    pub fn new(http: HttpFetcher, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    fn authenticated(&self) -> bool {
        self.api_key.is_some()
    }

    fn cost(&self) -> f64 {
        if self.authenticated() {
            KEYED_CALL_COST_USD
        } else {
            0.0
        }
    }

    fn with_key(&self, mut query: Vec<(&'static str, String)>) -> Vec<(&'static str, String)> {
        if let Some(key) = &self.api_key {
            query.push(("api_key", key.clone()));
        }
        query
    }

    /// No id cursor on this backend; the consumed count becomes the offset.
    fn history_query(
        &self,
        page_size: usize,
        cursor: Option<PageCursor>,
    ) -> Vec<(&'static str, String)> {
        let offset = cursor.map(|c| c.offset).unwrap_or(0);
        self.with_key(vec![
            ("limit", clamp_page_size(page_size).to_string()),
            ("offset", offset.to_string()),
        ])
    }
}

fn parse_history(body: JsonValue) -> Result<Vec<MatchSummary>, ProviderError> {
    let entries: Vec<HistoryEntry> =
        serde_json::from_value(body).map_err(|err| ProviderError::Malformed(err.to_string()))?;
    Ok(entries
        .into_iter()
        .map(|entry| MatchSummary {
            match_id: entry.match_id,
            start_time: entry
                .start_time
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
        })
        .collect())
}

fn check_details(body: JsonValue, match_id: MatchId) -> Result<JsonValue, ProviderError> {
    if let Some(error) = body.get("error") {
        let reason = error.as_str().unwrap_or("error");
        return Err(ProviderError::NotFound(format!("match {match_id}: {reason}")));
    }
    if !body.is_object() {
        return Err(ProviderError::Malformed(format!(
            "match {match_id}: details body is not an object"
        )));
    }
    Ok(body)
}

#[async_trait]
impl MatchProvider for OpenDotaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenDota
    }

    async fn fetch_history(
        &self,
        account_id: AccountId,
        page_size: usize,
        cursor: Option<PageCursor>,
    ) -> Result<Vec<MatchSummary>, ProviderError> {
        let body = self
            .http
            .get_json(ApiRequest {
                endpoint: HISTORY_ENDPOINT,
                subject: format!("history of account {account_id}"),
                url: format!("{}/players/{account_id}/matches", self.base_url),
                query: self.history_query(page_size, cursor),
                authenticated: self.authenticated(),
                cost: self.cost(),
            })
            .await?;
        parse_history(body)
    }

    async fn fetch_details(&self, match_id: MatchId) -> Result<JsonValue, ProviderError> {
        let body = self
            .http
            .get_json(ApiRequest {
                endpoint: DETAILS_ENDPOINT,
                subject: format!("match {match_id}"),
                url: format!("{}/matches/{match_id}", self.base_url),
                query: self.with_key(Vec::new()),
                authenticated: self.authenticated(),
                cost: self.cost(),
            })
            .await?;
        check_details(body, match_id)
    }
}
