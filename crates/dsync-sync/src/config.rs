use std::time::Duration;

use anyhow::{bail, Result};
use dsync_core::{ProviderKind, HISTORY_PAGE_SIZE};
use dsync_providers::{HttpClientConfig, ProviderSettings};
use dsync_storage::StoreConfig;

use crate::fetcher::DETAIL_BATCH_SIZE;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub provider: ProviderSettings,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub worker_concurrency: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub history_page_size: usize,
    pub detail_batch_size: usize,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let delay = |key: &str, default: f64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .unwrap_or_else(|| Duration::from_secs_f64(default))
        };

        let provider = match var("API_PROVIDER", "valve").parse::<ProviderKind>() {
            Ok(ProviderKind::Valve) => ProviderSettings::Valve {
                api_key: var("STEAM_API_KEY", ""),
                base_url: var("VALVE_API_BASE_URL", "https://api.steampowered.com"),
                delay: delay("VALVE_RATE_LIMIT_DELAY", 7.0),
            },
            Ok(ProviderKind::OpenDota) => ProviderSettings::OpenDota {
                api_key: lookup("OPENDOTA_API_KEY").filter(|k| !k.trim().is_empty()),
                base_url: var("OPENDOTA_API_BASE_URL", "https://api.opendota.com/api"),
                delay: delay("OPENDOTA_RATE_LIMIT_DELAY", 1.0),
            },
            Err(err) => bail!("API_PROVIDER: {err}"),
        };

        Ok(Self {
            database_url: var("DATABASE_URL", "sqlite://dsync.db"),
            db_max_connections: lookup("DSYNC_DB_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            provider,
            http_timeout_secs: lookup("DSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            user_agent: var("DSYNC_USER_AGENT", "dsync/0.1"),
            worker_concurrency: lookup("DSYNC_WORKER_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(4),
            scheduler_enabled: lookup("DSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: var("SYNC_CRON", "0 0 * * * *"),
            history_page_size: HISTORY_PAGE_SIZE,
            detail_batch_size: DETAIL_BATCH_SIZE,
        })
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.database_url.clone()).max_connections(self.db_max_connections)
    }

    /// Transport settings; the per-provider delay is applied by the factory.
    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}
