#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dsync_core::{
    account_id_to_steam_id, AccountId, JobId, MatchId, MatchSummary, ProviderKind, SyncJob, User,
    UserId,
};
use dsync_providers::{MatchProvider, PageCursor, ProviderError};
use dsync_storage::{insert_stubs, Store};
use dsync_sync::{EngineOptions, SyncOrchestrator, WorkerPool};
use serde_json::{json, Value as JsonValue};

pub const ACCOUNT: AccountId = 1001;

type DetailScript = Box<dyn Fn(MatchId, usize) -> Result<JsonValue, ProviderError> + Send + Sync>;
type HistoryPage = Result<Vec<MatchId>, ProviderError>;

/// In-process provider: history pages (or errors) are served in order,
/// details come from a script that sees the match id and the 1-based call
/// number.
pub struct ScriptedProvider {
    pages: Mutex<VecDeque<HistoryPage>>,
    history_calls: Mutex<Vec<Option<PageCursor>>>,
    details: DetailScript,
    detail_calls: AtomicUsize,
    calls_by_match: Mutex<HashMap<MatchId, usize>>,
    detail_delay: Duration,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(VecDeque::new()),
            history_calls: Mutex::new(Vec::new()),
            details: Box::new(|match_id, _| Ok(payload(match_id, 0, true, &[]))),
            detail_calls: AtomicUsize::new(0),
            calls_by_match: Mutex::new(HashMap::new()),
            detail_delay: Duration::ZERO,
        }
    }

    pub fn with_pages(self, pages: Vec<Vec<MatchId>>) -> Self {
        *self.pages.lock().unwrap() = pages.into_iter().map(Ok).collect();
        self
    }

    pub fn with_details(
        mut self,
        script: impl Fn(MatchId, usize) -> Result<JsonValue, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        self.details = Box::new(script);
        self
    }

    pub fn with_detail_delay(mut self, delay: Duration) -> Self {
        self.detail_delay = delay;
        self
    }

    pub fn push_page(&self, page: Vec<MatchId>) {
        self.pages.lock().unwrap().push_back(Ok(page));
    }

    /// The next history call fails with `err`.
    pub fn push_history_error(&self, err: ProviderError) {
        self.pages.lock().unwrap().push_back(Err(err));
    }

    pub fn history_calls(&self) -> Vec<Option<PageCursor>> {
        self.history_calls.lock().unwrap().clone()
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, match_id: MatchId) -> usize {
        self.calls_by_match
            .lock()
            .unwrap()
            .get(&match_id)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl MatchProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenDota
    }

    async fn fetch_history(
        &self,
        _account_id: AccountId,
        page_size: usize,
        cursor: Option<PageCursor>,
    ) -> Result<Vec<MatchSummary>, ProviderError> {
        self.history_calls.lock().unwrap().push(cursor);
        let page = self.pages.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()))?;
        Ok(page
            .into_iter()
            .take(page_size)
            .map(|match_id| MatchSummary {
                match_id,
                start_time: None,
            })
            .collect())
    }

    async fn fetch_details(&self, match_id: MatchId) -> Result<JsonValue, ProviderError> {
        if !self.detail_delay.is_zero() {
            tokio::time::sleep(self.detail_delay).await;
        }
        let call = self.detail_calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self
            .calls_by_match
            .lock()
            .unwrap()
            .entry(match_id)
            .or_default() += 1;
        (self.details)(match_id, call)
    }
}

/// Detail payload with the tracked account at `user_slot`; `others` are
/// `(account_id, player_slot)` pairs.
pub fn payload(
    match_id: MatchId,
    user_slot: i64,
    radiant_win: bool,
    others: &[(Option<AccountId>, i64)],
) -> JsonValue {
    let mut players = vec![json!({
        "account_id": ACCOUNT,
        "player_slot": user_slot,
        "hero_id": 14,
        "kills": 7,
        "deaths": 2,
        "assists": 11,
        "item_0": 63
    })];
    for (account_id, player_slot) in others {
        players.push(json!({
            "account_id": account_id,
            "player_slot": player_slot,
            "hero_id": 1
        }));
    }
    json!({
        "match_id": match_id,
        "start_time": 1_735_689_600 + match_id,
        "duration": 2400,
        "game_mode": 22,
        "lobby_type": 7,
        "radiant_win": radiant_win,
        "players": players
    })
}

pub async fn store_with_user() -> (Store, User) {
    let store = Store::in_memory().await.unwrap();
    let user = store
        .upsert_user(account_id_to_steam_id(ACCOUNT), "tracked")
        .await
        .unwrap();
    (store, user)
}

pub fn orchestrator(store: &Store, provider: &Arc<ScriptedProvider>) -> SyncOrchestrator {
    let provider: Arc<dyn MatchProvider> = provider.clone();
    SyncOrchestrator::new(
        store.clone(),
        provider,
        WorkerPool::new(2),
        EngineOptions::default(),
    )
}

pub async fn seed_stubs(store: &Store, user_id: UserId, ids: &[MatchId]) {
    let mut conn = store.pool().acquire().await.unwrap();
    insert_stubs(&mut conn, user_id, ids).await.unwrap();
}

pub async fn wait(orchestrator: &SyncOrchestrator, job_id: JobId) -> SyncJob {
    tokio::time::timeout(
        Duration::from_secs(20),
        orchestrator.wait_for_terminal(job_id, Duration::from_millis(10)),
    )
    .await
    .expect("job did not reach a terminal status in time")
    .unwrap()
}
