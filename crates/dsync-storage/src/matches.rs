use chrono::{DateTime, Utc};
use dsync_core::{
    FetchState, JobId, MatchId, MatchParticipant, MatchRecord, NormalizedMatch, PlayerLine,
    TeammateEncounter, TeamSide, UserId, MAX_FETCH_ATTEMPTS,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, warn};

use crate::encounters::upsert_encounters;
use crate::jobs::{update_job_progress, JobProgress};
use crate::{StorageResult, Store};

const RECORD_COLUMNS: &str =
    "id, user_id, fetch_state, retry_count, last_attempt_at, last_error, created_at";

/// Result of one detail attempt, applied at the next batch commit.
#[derive(Debug, Clone)]
pub enum DetailOutcome {
    /// `encounters` are the teammate deltas of this match alone; they are
    /// committed only if the row for `match_id` is written.
    Resolved {
        match_id: MatchId,
        normalized: Box<NormalizedMatch>,
        encounters: Vec<TeammateEncounter>,
        attempted_at: DateTime<Utc>,
    },
    /// Deferred (`Stub`) or counted (`Failed`) attempt; `state` is the row's
    /// next state.
    Unresolved {
        match_id: MatchId,
        state: FetchState,
        error: String,
        attempted_at: DateTime<Utc>,
    },
}

/// Everything a detail batch writes in one transaction.
#[derive(Debug, Clone, Default)]
pub struct DetailBatch {
    pub outcomes: Vec<DetailOutcome>,
    pub progress: JobProgress,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchCounts {
    pub stub: i64,
    pub complete: i64,
    pub failed: i64,
    /// Failed rows whose attempt budget is spent.
    pub exhausted: i64,
}

fn record_from_row(row: &SqliteRow) -> StorageResult<MatchRecord> {
    let label: String = row.try_get("fetch_state")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    Ok(MatchRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        state: FetchState::from_columns(&label, retry_count)?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
    })
}

fn participant_from_row(row: &SqliteRow) -> StorageResult<MatchParticipant> {
    let mut items = [None; 6];
    for (slot, item) in items.iter_mut().enumerate() {
        *item = row.try_get(format!("item_{slot}").as_str())?;
    }
    Ok(MatchParticipant {
        id: row.try_get("id")?,
        match_id: row.try_get("match_id")?,
        line: PlayerLine {
            account_id: row.try_get("account_id")?,
            player_slot: row.try_get("player_slot")?,
            hero_id: row.try_get("hero_id")?,
            kills: row.try_get("kills")?,
            deaths: row.try_get("deaths")?,
            assists: row.try_get("assists")?,
            last_hits: row.try_get("last_hits")?,
            denies: row.try_get("denies")?,
            gold_per_min: row.try_get("gold_per_min")?,
            xp_per_min: row.try_get("xp_per_min")?,
            hero_damage: row.try_get("hero_damage")?,
            tower_damage: row.try_get("tower_damage")?,
            hero_healing: row.try_get("hero_healing")?,
            level: row.try_get("level")?,
            net_worth: row.try_get("net_worth")?,
            items,
            ..Default::default()
        },
    })
}

/// Create a stub for every id not already stored. Existing rows, whatever
/// their state or owner, are left untouched. Returns how many were created.
pub async fn insert_stubs(
    conn: &mut SqliteConnection,
    user_id: UserId,
    match_ids: &[MatchId],
) -> StorageResult<u64> {
    let now = Utc::now();
    let mut created = 0;
    for match_id in match_ids {
        let res = sqlx::query(
            r#"
            INSERT INTO matches (id, user_id, fetch_state, retry_count, created_at, updated_at)
            VALUES (?, ?, 'stub', 0, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(match_id)
        .bind(user_id)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        created += res.rows_affected();
    }
    Ok(created)
}

/// Returns false when no stub row exists for `match_id`; nothing is written.
async fn write_resolved(
    conn: &mut SqliteConnection,
    match_id: MatchId,
    normalized: &NormalizedMatch,
    attempted_at: DateTime<Utc>,
) -> StorageResult<bool> {
    let p = &normalized.player;
    let ability_upgrades = p
        .ability_upgrades
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let raw_payload = serde_json::to_string(&normalized.raw)?;

    let res = sqlx::query(
        r#"
        UPDATE matches
           SET fetch_state = 'complete',
               last_error = NULL,
               last_attempt_at = ?,
               start_time = ?, duration = ?, game_mode = ?, lobby_type = ?, radiant_win = ?,
               hero_id = ?, player_slot = ?, is_radiant = ?,
               kills = ?, deaths = ?, assists = ?, last_hits = ?, denies = ?,
               gold_per_min = ?, xp_per_min = ?,
               hero_damage = ?, tower_damage = ?, hero_healing = ?,
               level = ?, net_worth = ?,
               item_0 = ?, item_1 = ?, item_2 = ?, item_3 = ?, item_4 = ?, item_5 = ?,
               backpack_0 = ?, backpack_1 = ?, backpack_2 = ?, item_neutral = ?,
               rank_tier = ?, ability_upgrades = ?, raw_payload = ?,
               updated_at = ?
         WHERE id = ?
        "#,
    )
    .bind(attempted_at)
    .bind(normalized.start_time)
    .bind(normalized.duration)
    .bind(normalized.game_mode)
    .bind(normalized.lobby_type)
    .bind(normalized.radiant_win)
    .bind(p.hero_id)
    .bind(p.player_slot)
    .bind(p.side() == TeamSide::Radiant)
    .bind(p.kills)
    .bind(p.deaths)
    .bind(p.assists)
    .bind(p.last_hits)
    .bind(p.denies)
    .bind(p.gold_per_min)
    .bind(p.xp_per_min)
    .bind(p.hero_damage)
    .bind(p.tower_damage)
    .bind(p.hero_healing)
    .bind(p.level)
    .bind(p.net_worth)
    .bind(p.items[0])
    .bind(p.items[1])
    .bind(p.items[2])
    .bind(p.items[3])
    .bind(p.items[4])
    .bind(p.items[5])
    .bind(p.backpack[0])
    .bind(p.backpack[1])
    .bind(p.backpack[2])
    .bind(p.item_neutral)
    .bind(p.rank_tier)
    .bind(ability_upgrades)
    .bind(raw_payload)
    .bind(Utc::now())
    .bind(match_id)
    .execute(&mut *conn)
    .await?;

    if res.rows_affected() == 0 {
        warn!(match_id, "resolved match has no stub row; skipping");
        return Ok(false);
    }

    sqlx::query("DELETE FROM match_participants WHERE match_id = ?")
        .bind(match_id)
        .execute(&mut *conn)
        .await?;

    for line in &normalized.players {
        sqlx::query(
            r#"
            INSERT INTO match_participants (
                match_id, account_id, player_slot, hero_id,
                kills, deaths, assists, last_hits, denies,
                gold_per_min, xp_per_min, hero_damage, tower_damage, hero_healing,
                level, net_worth,
                item_0, item_1, item_2, item_3, item_4, item_5
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(match_id)
        .bind(line.account_id)
        .bind(line.player_slot)
        .bind(line.hero_id)
        .bind(line.kills)
        .bind(line.deaths)
        .bind(line.assists)
        .bind(line.last_hits)
        .bind(line.denies)
        .bind(line.gold_per_min)
        .bind(line.xp_per_min)
        .bind(line.hero_damage)
        .bind(line.tower_damage)
        .bind(line.hero_healing)
        .bind(line.level)
        .bind(line.net_worth)
        .bind(line.items[0])
        .bind(line.items[1])
        .bind(line.items[2])
        .bind(line.items[3])
        .bind(line.items[4])
        .bind(line.items[5])
        .execute(&mut *conn)
        .await?;
    }
    Ok(true)
}

async fn write_unresolved(
    conn: &mut SqliteConnection,
    match_id: MatchId,
    state: FetchState,
    error: &str,
    attempted_at: DateTime<Utc>,
) -> StorageResult<()> {
    sqlx::query(
        r#"
        UPDATE matches
           SET fetch_state = ?, retry_count = ?, last_error = ?, last_attempt_at = ?, updated_at = ?
         WHERE id = ? AND fetch_state != 'complete'
        "#,
    )
    .bind(state.label())
    .bind(i64::from(state.retries()))
    .bind(error)
    .bind(attempted_at)
    .bind(Utc::now())
    .bind(match_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

impl Store {
    /// Persist one history page: its stubs and the job's running counters
    /// commit together. Returns the number of stubs created by this page.
    pub async fn record_collected_page(
        &self,
        job_id: JobId,
        user_id: UserId,
        match_ids: &[MatchId],
        ids_seen: i64,
        stubs_before: i64,
    ) -> StorageResult<u64> {
        let mut tx = self.pool.begin().await?;
        let created = insert_stubs(&mut tx, user_id, match_ids).await?;
        update_job_progress(
            &mut tx,
            job_id,
            &JobProgress {
                total: ids_seen,
                processed: ids_seen,
                new_matches: stubs_before + created as i64,
            },
        )
        .await?;
        tx.commit().await?;
        Ok(created)
    }

    /// Rows the detail fetcher should attempt, highest match id first.
    pub async fn eligible_matches(&self, user_id: UserId) -> StorageResult<Vec<MatchRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
              FROM matches
             WHERE user_id = ?
               AND (fetch_state = 'stub' OR (fetch_state = 'failed' AND retry_count < ?))
             ORDER BY id DESC
            "#
        ))
        .bind(user_id)
        .bind(i64::from(MAX_FETCH_ATTEMPTS))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Highest Complete match id for the user, if any.
    pub async fn complete_watermark(&self, user_id: UserId) -> StorageResult<Option<MatchId>> {
        let watermark: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(id) FROM matches WHERE user_id = ? AND fetch_state = 'complete'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(watermark)
    }

    pub async fn get_match(&self, match_id: MatchId) -> StorageResult<Option<MatchRecord>> {
        let row = sqlx::query(&format!("SELECT {RECORD_COLUMNS} FROM matches WHERE id = ?"))
            .bind(match_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn participants(&self, match_id: MatchId) -> StorageResult<Vec<MatchParticipant>> {
        let rows = sqlx::query(
            r#"
            SELECT id, match_id, account_id, player_slot, hero_id,
                   kills, deaths, assists, last_hits, denies,
                   gold_per_min, xp_per_min, hero_damage, tower_damage, hero_healing,
                   level, net_worth,
                   item_0, item_1, item_2, item_3, item_4, item_5
              FROM match_participants
             WHERE match_id = ?
             ORDER BY player_slot
            "#,
        )
        .bind(match_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(participant_from_row).collect()
    }

    pub async fn match_counts(&self, user_id: UserId) -> StorageResult<MatchCounts> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(fetch_state = 'stub'), 0)     AS stub,
                   COALESCE(SUM(fetch_state = 'complete'), 0) AS complete,
                   COALESCE(SUM(fetch_state = 'failed'), 0)   AS failed,
                   COALESCE(SUM(fetch_state = 'failed' AND retry_count >= ?), 0) AS exhausted
              FROM matches
             WHERE user_id = ?
            "#,
        )
        .bind(i64::from(MAX_FETCH_ATTEMPTS))
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(MatchCounts {
            stub: row.try_get("stub")?,
            complete: row.try_get("complete")?,
            failed: row.try_get("failed")?,
            exhausted: row.try_get("exhausted")?,
        })
    }

    /// Apply a batch of detail outcomes, the teammate deltas of every match
    /// actually written and the job's counters in a single transaction.
    /// Returns how many resolved outcomes were written.
    pub async fn commit_detail_batch(
        &self,
        job_id: JobId,
        batch: &DetailBatch,
    ) -> StorageResult<usize> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        let mut encounters = 0;
        for outcome in &batch.outcomes {
            match outcome {
                DetailOutcome::Resolved {
                    match_id,
                    normalized,
                    encounters: deltas,
                    attempted_at,
                } => {
                    if write_resolved(&mut tx, *match_id, normalized, *attempted_at).await? {
                        upsert_encounters(&mut tx, deltas).await?;
                        written += 1;
                        encounters += deltas.len();
                    }
                }
                DetailOutcome::Unresolved {
                    match_id,
                    state,
                    error,
                    attempted_at,
                } => write_unresolved(&mut tx, *match_id, *state, error, *attempted_at).await?,
            }
        }
        update_job_progress(&mut tx, job_id, &batch.progress).await?;
        tx.commit().await?;
        debug!(
            job_id,
            outcomes = batch.outcomes.len(),
            written,
            encounters,
            "detail batch committed"
        );
        Ok(written)
    }
}
