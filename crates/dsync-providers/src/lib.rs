//! Provider client contracts and the two match-statistics backends.

mod http;
mod normalize;
mod opendota;
mod usage;
mod valve;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dsync_core::{AccountId, MatchId, MatchSummary, ProviderKind};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use http::{classify_status, HttpClientConfig, HttpFetcher};
pub use normalize::{normalize_match, NormalizeError};
pub use opendota::OpenDotaProvider;
pub use usage::{NoopUsage, UsageRecorder};
pub use valve::ValveProvider;

pub const CRATE_NAME: &str = "dsync-providers";

/// Classified failure of a single provider call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("provider outage: http {status}")]
    Outage { status: u16 },
    #[error("provider rejected request: {0}")]
    Rejected(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Outages are retried for free; everything else counts against a
    /// record's attempt budget.
    pub fn is_outage(&self) -> bool {
        matches!(self, Self::Outage { .. })
    }
}

/// Position after the last page the collector consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    /// Lowest match id seen so far.
    pub oldest_seen: MatchId,
    /// Number of summaries consumed so far.
    pub offset: usize,
}

#[async_trait]
pub trait MatchProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// One newest-first page of the account's history. A page shorter than
    /// `page_size` means the history is exhausted.
    async fn fetch_history(
        &self,
        account_id: AccountId,
        page_size: usize,
        cursor: Option<PageCursor>,
    ) -> Result<Vec<MatchSummary>, ProviderError>;

    /// Raw detail payload, in the shape [`normalize_match`] understands.
    async fn fetch_details(&self, match_id: MatchId) -> Result<JsonValue, ProviderError>;
}

#[derive(Debug, Clone)]
pub enum ProviderSettings {
    Valve {
        api_key: String,
        base_url: String,
        delay: Duration,
    },
    OpenDota {
        api_key: Option<String>,
        base_url: String,
        delay: Duration,
    },
}

impl ProviderSettings {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Valve { .. } => ProviderKind::Valve,
            Self::OpenDota { .. } => ProviderKind::OpenDota,
        }
    }
}

/// Build the configured backend once; callers only see the trait object.
pub fn build_provider(
    settings: &ProviderSettings,
    http: HttpClientConfig,
    usage: Arc<dyn UsageRecorder>,
) -> anyhow::Result<Arc<dyn MatchProvider>> {
    let provider: Arc<dyn MatchProvider> = match settings {
        ProviderSettings::Valve {
            api_key,
            base_url,
            delay,
        } => {
            let fetcher = HttpFetcher::new(
                ProviderKind::Valve,
                HttpClientConfig {
                    delay: *delay,
                    ..http
                },
                usage,
            )?;
            Arc::new(ValveProvider::new(fetcher, base_url, api_key))
        }
        ProviderSettings::OpenDota {
            api_key,
            base_url,
            delay,
        } => {
            let fetcher = HttpFetcher::new(
                ProviderKind::OpenDota,
                HttpClientConfig {
                    delay: *delay,
                    ..http
                },
                usage,
            )?;
            Arc::new(OpenDotaProvider::new(fetcher, base_url, api_key.clone()))
        }
    };
    Ok(provider)
}

fn clamp_page_size(page_size: usize) -> usize {
    page_size.clamp(1, dsync_core::HISTORY_PAGE_SIZE)
}
