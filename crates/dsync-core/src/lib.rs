//! Core domain model for dsync: match records, fetch state, sync jobs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dsync-core";

pub type UserId = i64;
pub type MatchId = i64;
pub type AccountId = i64;
pub type JobId = i64;

/// Non-outage failures a match may accumulate before it is excluded for good.
pub const MAX_FETCH_ATTEMPTS: u32 = 3;

/// Largest history page either provider will serve.
pub const HISTORY_PAGE_SIZE: usize = 100;

/// Player slots at or above this value belong to the Dire side.
pub const DIRE_SLOT_START: i64 = 128;

/// Account id the providers report for players with a private profile.
pub const ANONYMOUS_ACCOUNT_ID: AccountId = 4_294_967_295;

const STEAM_ID64_OFFSET: i64 = 76_561_197_960_265_728;

pub fn steam_id_to_account_id(steam_id64: i64) -> AccountId {
    steam_id64 - STEAM_ID64_OFFSET
}

pub fn account_id_to_steam_id(account_id: AccountId) -> i64 {
    account_id + STEAM_ID64_OFFSET
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("unknown job kind `{0}`")]
    UnknownJobKind(String),
    #[error("unknown job status `{0}`")]
    UnknownJobStatus(String),
    #[error("unknown fetch state `{0}`")]
    UnknownFetchState(String),
    #[error("unknown provider `{0}`")]
    UnknownProvider(String),
}

/// Detail-resolution state of a match row.
///
/// `Stub` covers both "never attempted" and "last attempt hit a provider
/// outage": neither costs the row any of its attempt budget. `Failed` carries
/// the number of non-outage failures so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FetchState {
    Stub { retries: u32 },
    Complete,
    Failed { retries: u32 },
}

impl Default for FetchState {
    fn default() -> Self {
        Self::Stub { retries: 0 }
    }
}

impl FetchState {
    pub fn retries(&self) -> u32 {
        match self {
            Self::Stub { retries } | Self::Failed { retries } => *retries,
            Self::Complete => 0,
        }
    }

    pub fn is_eligible(&self) -> bool {
        match self {
            Self::Stub { .. } => true,
            Self::Failed { retries } => *retries < MAX_FETCH_ATTEMPTS,
            Self::Complete => false,
        }
    }

    /// Outages defer the row without touching its attempt budget.
    pub fn after_outage(self) -> Self {
        match self {
            Self::Stub { retries } | Self::Failed { retries } => Self::Stub { retries },
            Self::Complete => Self::Complete,
        }
    }

    pub fn after_failure(self) -> Self {
        Self::Failed {
            retries: self.retries().saturating_add(1),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Stub { .. } => "stub",
            Self::Complete => "complete",
            Self::Failed { .. } => "failed",
        }
    }

    /// Rebuild the state from its persisted `(state, retry_count)` columns.
    pub fn from_columns(label: &str, retry_count: i64) -> Result<Self, CoreError> {
        let retries = u32::try_from(retry_count.max(0)).unwrap_or(u32::MAX);
        match label {
            "stub" => Ok(Self::Stub { retries }),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed { retries }),
            other => Err(CoreError::UnknownFetchState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TeamSide {
    Radiant,
    Dire,
}

impl TeamSide {
    pub fn from_slot(player_slot: i64) -> Self {
        if player_slot < DIRE_SLOT_START {
            Self::Radiant
        } else {
            Self::Dire
        }
    }

    pub fn won(self, radiant_win: bool) -> bool {
        match self {
            Self::Radiant => radiant_win,
            Self::Dire => !radiant_win,
        }
    }
}

/// One entry of a provider's newest-first match history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSummary {
    pub match_id: MatchId,
    pub start_time: Option<DateTime<Utc>>,
}

/// Per-player line of a resolved match, shared by the user's own line and
/// every participant row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerLine {
    pub account_id: Option<AccountId>,
    pub player_slot: i64,
    pub hero_id: i64,
    pub kills: Option<i64>,
    pub deaths: Option<i64>,
    pub assists: Option<i64>,
    pub last_hits: Option<i64>,
    pub denies: Option<i64>,
    pub gold_per_min: Option<i64>,
    pub xp_per_min: Option<i64>,
    pub hero_damage: Option<i64>,
    pub tower_damage: Option<i64>,
    pub hero_healing: Option<i64>,
    pub level: Option<i64>,
    pub net_worth: Option<i64>,
    pub items: [Option<i64>; 6],
    pub backpack: [Option<i64>; 3],
    pub item_neutral: Option<i64>,
    pub rank_tier: Option<i64>,
    pub ability_upgrades: Option<JsonValue>,
}

impl PlayerLine {
    pub fn side(&self) -> TeamSide {
        TeamSide::from_slot(self.player_slot)
    }

    /// Account id usable as a relationship key, `None` for private profiles.
    pub fn known_account(&self) -> Option<AccountId> {
        self.account_id
            .filter(|id| *id != ANONYMOUS_ACCOUNT_ID && *id > 0)
    }
}

/// Provider payload reduced to what the store keeps, anchored on the tracked
/// account's own line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMatch {
    pub match_id: MatchId,
    pub start_time: DateTime<Utc>,
    pub duration: Option<i64>,
    pub game_mode: Option<i64>,
    pub lobby_type: Option<i64>,
    pub radiant_win: bool,
    pub player: PlayerLine,
    pub players: Vec<PlayerLine>,
    pub raw: JsonValue,
}

impl NormalizedMatch {
    pub fn user_side(&self) -> TeamSide {
        self.player.side()
    }

    pub fn user_won(&self) -> bool {
        self.user_side().won(self.radiant_win)
    }

    /// Other known accounts on the user's side of the slot boundary.
    pub fn teammates(&self) -> impl Iterator<Item = &PlayerLine> + '_ {
        let side = self.user_side();
        let own_account = self.player.account_id;
        let own_slot = self.player.player_slot;
        self.players.iter().filter(move |p| {
            p.side() == side
                && p.player_slot != own_slot
                && p.known_account().is_some()
                && p.account_id != own_account
        })
    }
}

/// Lightweight view of a match row used by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: MatchId,
    pub user_id: UserId,
    pub state: FetchState,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchParticipant {
    pub id: i64,
    pub match_id: MatchId,
    pub line: PlayerLine,
}

/// Running win/loss record between a user and another account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeammateEncounter {
    pub user_id: UserId,
    pub account_id: AccountId,
    pub games_together: i64,
    pub games_won: i64,
    pub games_lost: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl TeammateEncounter {
    pub fn first(user_id: UserId, account_id: AccountId, won: bool, at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            account_id,
            games_together: 1,
            games_won: i64::from(won),
            games_lost: i64::from(!won),
            first_seen: at,
            last_seen: at,
        }
    }

    pub fn record(&mut self, won: bool, at: DateTime<Utc>) {
        self.games_together += 1;
        if won {
            self.games_won += 1;
        } else {
            self.games_lost += 1;
        }
        self.first_seen = self.first_seen.min(at);
        self.last_seen = self.last_seen.max(at);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub steam_id: i64,
    pub persona_name: String,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn account_id(&self) -> AccountId {
        steam_id_to_account_id(self.steam_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    CollectIds(CollectMode),
    FetchDetails,
}

/// What a job row was created to do. Also the set of accepted trigger kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Full,
    Incremental,
    MissingOnly,
    CollectIds,
    FetchDetails,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::Full,
        JobKind::Incremental,
        JobKind::MissingOnly,
        JobKind::CollectIds,
        JobKind::FetchDetails,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::MissingOnly => "missing_only",
            Self::CollectIds => "collect_ids",
            Self::FetchDetails => "fetch_details",
        }
    }

    pub fn phase(&self) -> JobPhase {
        match self {
            Self::Full | Self::CollectIds => JobPhase::CollectIds(CollectMode::Full),
            Self::Incremental => JobPhase::CollectIds(CollectMode::Incremental),
            Self::MissingOnly | Self::FetchDetails => JobPhase::FetchDetails,
        }
    }

    /// Job rows a trigger of this kind creates, in dispatch order.
    pub fn plan(&self) -> Vec<JobKind> {
        match self {
            Self::Full => vec![Self::Full, Self::FetchDetails],
            Self::Incremental => vec![Self::Incremental, Self::FetchDetails],
            other => vec![*other],
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| CoreError::UnknownJobKind(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(CoreError::UnknownJobStatus(other.to_string())),
        }
    }
}

/// Pollable execution record of one orchestrated unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: JobId,
    pub user_id: UserId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub total: i64,
    pub processed: i64,
    pub new_matches: i64,
    pub execution_handle: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SyncJob {
    pub fn progress_percent(&self) -> f64 {
        if self.total <= 0 {
            return 0.0;
        }
        (self.processed as f64 / self.total as f64) * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Valve,
    OpenDota,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valve => "valve",
            Self::OpenDota => "opendota",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "valve" => Ok(Self::Valve),
            "opendota" => Ok(Self::OpenDota),
            _ => Err(CoreError::UnknownProvider(s.to_string())),
        }
    }
}

/// Usage row emitted for every provider call, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCallRecord {
    pub provider: ProviderKind,
    pub endpoint: String,
    pub authenticated: bool,
    pub cost: f64,
    pub status: Option<u16>,
}
