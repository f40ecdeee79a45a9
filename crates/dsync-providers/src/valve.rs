use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dsync_core::{AccountId, MatchId, MatchSummary, ProviderKind};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::http::{ApiRequest, HttpFetcher};
use crate::{clamp_page_size, MatchProvider, PageCursor, ProviderError};

const HISTORY_ENDPOINT: &str = "IDOTA2Match_570/GetMatchHistory/v1";
const DETAILS_ENDPOINT: &str = "IDOTA2Match_570/GetMatchDetails/v1";

/// Valve reports this status when the profile hides its match history.
const STATUS_PRIVATE_HISTORY: i64 = 15;

#[derive(Debug, Deserialize)]
struct HistoryEnvelope {
    result: HistoryResult,
}

#[derive(Debug, Deserialize)]
struct HistoryResult {
    #[serde(default)]
    status: Option<i64>,
    #[serde(default, rename = "statusDetail")]
    status_detail: Option<String>,
    #[serde(default)]
    matches: Vec<HistoryEntry>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    match_id: MatchId,
    #[serde(default)]
    start_time: Option<i64>,
}

/// Steam Web API backend. Always keyed, never billed.
pub struct ValveProvider {
    http: HttpFetcher,
    base_url: String,
    api_key: String,
}

impl ValveProvider {
    pub fn new(http: HttpFetcher, base_url: &str, api_key: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn history_query(
        &self,
        account_id: AccountId,
        page_size: usize,
        cursor: Option<PageCursor>,
    ) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("key", self.api_key.clone()),
            ("account_id", account_id.to_string()),
            ("matches_requested", clamp_page_size(page_size).to_string()),
        ];
        // start_at_match_id is inclusive
        if let Some(cursor) = cursor {
            query.push(("start_at_match_id", (cursor.oldest_seen - 1).to_string()));
        }
        query
    }
}

fn parse_history(body: JsonValue) -> Result<Vec<MatchSummary>, ProviderError> {
    let envelope: HistoryEnvelope =
        serde_json::from_value(body).map_err(|err| ProviderError::Malformed(err.to_string()))?;
    if envelope.result.status == Some(STATUS_PRIVATE_HISTORY) {
        return Err(ProviderError::Rejected(
            envelope
                .result
                .status_detail
                .unwrap_or_else(|| "match history is private".to_string()),
        ));
    }
    Ok(envelope
        .result
        .matches
        .into_iter()
        .map(|entry| MatchSummary {
            match_id: entry.match_id,
            start_time: entry
                .start_time
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
        })
        .collect())
}

/// Strip the `result` envelope; an `error` inside it means the id is unknown.
fn unwrap_details(mut body: JsonValue, match_id: MatchId) -> Result<JsonValue, ProviderError> {
    let result = body
        .get_mut("result")
        .map(JsonValue::take)
        .ok_or_else(|| ProviderError::Malformed("details body has no `result`".to_string()))?;
    if let Some(error) = result.get("error") {
        let reason = error.as_str().unwrap_or("error");
        return Err(ProviderError::NotFound(format!("match {match_id}: {reason}")));
    }
    Ok(result)
}

#[async_trait]
impl MatchProvider for ValveProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Valve
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
                url: format!("{}/{HISTORY_ENDPOINT}/", self.base_url),
                query: self.history_query(account_id, page_size, cursor),
                authenticated: true,
                cost: 0.0,
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
                url: format!("{}/{DETAILS_ENDPOINT}/", self.base_url),
                query: vec![
                    ("key", self.api_key.clone()),
                    ("match_id", match_id.to_string()),
                ],
                authenticated: true,
                cost: 0.0,
            })
            .await?;
        unwrap_details(body, match_id)
    }
}
