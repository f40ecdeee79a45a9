use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dsync_core::{ApiCallRecord, ProviderKind};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use tracing::{debug, info_span, Instrument};

use crate::usage::UsageRecorder;
use crate::ProviderError;

/// Map a non-success status onto the provider error taxonomy.
pub fn classify_status(status: StatusCode, subject: &str) -> ProviderError {
    if status == StatusCode::NOT_FOUND {
        ProviderError::NotFound(subject.to_string())
    } else if status.is_server_error() {
        ProviderError::Outage {
            status: status.as_u16(),
        }
    } else {
        ProviderError::Rejected(format!("http {} for {subject}", status.as_u16()))
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> ProviderError {
    if err.is_decode() {
        ProviderError::Malformed(err.to_string())
    } else if err.is_timeout() {
        ProviderError::Network(format!("timed out: {err}"))
    } else {
        ProviderError::Network(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Fixed pause before every call.
    pub delay: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            delay: Duration::ZERO,
        }
    }
}

/// One outbound GET, with the usage metadata reported for it.
#[derive(Debug, Clone)]
pub(crate) struct ApiRequest {
    pub endpoint: &'static str,
    pub subject: String,
    pub url: String,
    pub query: Vec<(&'static str, String)>,
    pub authenticated: bool,
    pub cost: f64,
}

/// Paced JSON client shared by both backends. Never retries.
pub struct HttpFetcher {
    client: reqwest::Client,
    provider: ProviderKind,
    delay: Duration,
    usage: Arc<dyn UsageRecorder>,
}

impl HttpFetcher {
    pub fn new(
        provider: ProviderKind,
        config: HttpClientConfig,
        usage: Arc<dyn UsageRecorder>,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            provider,
            delay: config.delay,
            usage,
        })
    }

    pub(crate) async fn get_json(&self, request: ApiRequest) -> Result<JsonValue, ProviderError> {
        let span = info_span!(
            "provider_call",
            provider = %self.provider,
            endpoint = request.endpoint,
            subject = %request.subject
        );
        self.send(request).instrument(span).await
    }

    async fn send(&self, request: ApiRequest) -> Result<JsonValue, ProviderError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = self
            .client
            .get(&request.url)
            .query(&request.query)
            .send()
            .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(err) => {
                self.report(&request, None).await;
                return Err(classify_reqwest_error(&err));
            }
        };

        let status = resp.status();
        self.report(&request, Some(status.as_u16())).await;
        debug!(status = status.as_u16(), "provider responded");

        if !status.is_success() {
            return Err(classify_status(status, &request.subject));
        }

        resp.json::<JsonValue>()
            .await
            .map_err(|err| classify_reqwest_error(&err))
    }

    async fn report(&self, request: &ApiRequest, status: Option<u16>) {
        let record = ApiCallRecord {
            provider: self.provider,
            endpoint: request.endpoint.to_string(),
            authenticated: request.authenticated,
            cost: request.cost,
            status,
        };
        self.usage.record_best_effort(record).await;
    }
}
