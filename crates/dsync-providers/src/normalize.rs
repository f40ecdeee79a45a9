//! Detail payload normalization. Both backends return the same per-match
//! shape (`match_id`, `start_time`, `radiant_win`, `players[]`), so one
//! routine serves them.

use chrono::{DateTime, Utc};
use dsync_core::{AccountId, MatchId, NormalizedMatch, PlayerLine};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("payload missing `{0}`")]
    MissingField(&'static str),
    #[error("requested match {requested} but payload describes match {returned}")]
    MatchIdMismatch {
        requested: MatchId,
        returned: MatchId,
    },
    #[error("account {account_id} not found among players of match {match_id}")]
    PlayerNotFound {
        match_id: MatchId,
        account_id: AccountId,
    },
}

fn json_i64(value: &JsonValue, key: &str) -> Option<i64> {
    value.get(key).and_then(JsonValue::as_i64)
}

fn player_line(value: &JsonValue) -> Option<PlayerLine> {
    let player_slot = json_i64(value, "player_slot")?;
    let mut items = [None; 6];
    for (slot, item) in items.iter_mut().enumerate() {
        *item = json_i64(value, &format!("item_{slot}"));
    }
    let mut backpack = [None; 3];
    for (slot, item) in backpack.iter_mut().enumerate() {
        *item = json_i64(value, &format!("backpack_{slot}"));
    }
    let ability_upgrades = value
        .get("ability_upgrades")
        .or_else(|| value.get("ability_upgrades_arr"))
        .filter(|v| !v.is_null())
        .cloned();

    Some(PlayerLine {
        account_id: json_i64(value, "account_id"),
        player_slot,
        hero_id: json_i64(value, "hero_id").unwrap_or_default(),
        kills: json_i64(value, "kills"),
        deaths: json_i64(value, "deaths"),
        assists: json_i64(value, "assists"),
        last_hits: json_i64(value, "last_hits"),
        denies: json_i64(value, "denies"),
        gold_per_min: json_i64(value, "gold_per_min"),
        xp_per_min: json_i64(value, "xp_per_min"),
        hero_damage: json_i64(value, "hero_damage"),
        tower_damage: json_i64(value, "tower_damage"),
        hero_healing: json_i64(value, "hero_healing"),
        level: json_i64(value, "level"),
        net_worth: json_i64(value, "net_worth"),
        items,
        backpack,
        item_neutral: json_i64(value, "item_neutral"),
        rank_tier: json_i64(value, "rank_tier"),
        ability_upgrades,
    })
}

/// Reduce a detail payload to the stored fields, anchored on the tracked
/// account's own player entry. The payload must describe `requested`.
pub fn normalize_match(
    payload: &JsonValue,
    requested: MatchId,
    account_id: AccountId,
) -> Result<NormalizedMatch, NormalizeError> {
    let match_id = json_i64(payload, "match_id").ok_or(NormalizeError::MissingField("match_id"))?;
    if match_id != requested {
        return Err(NormalizeError::MatchIdMismatch {
            requested,
            returned: match_id,
        });
    }
    let start_time = json_i64(payload, "start_time")
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .ok_or(NormalizeError::MissingField("start_time"))?;
    let radiant_win = payload
        .get("radiant_win")
        .and_then(JsonValue::as_bool)
        .ok_or(NormalizeError::MissingField("radiant_win"))?;
    let players: Vec<PlayerLine> = payload
        .get("players")
        .and_then(JsonValue::as_array)
        .ok_or(NormalizeError::MissingField("players"))?
        .iter()
        .filter_map(player_line)
        .collect();

    let player = players
        .iter()
        .find(|p| p.account_id == Some(account_id))
        .cloned()
        .ok_or(NormalizeError::PlayerNotFound {
            match_id,
            account_id,
        })?;

    Ok(NormalizedMatch {
        match_id,
        start_time,
        duration: json_i64(payload, "duration"),
        game_mode: json_i64(payload, "game_mode"),
        lobby_type: json_i64(payload, "lobby_type"),
        radiant_win,
        player,
        players,
        raw: payload.clone(),
    })
}
