use dsync_core::{AccountId, TeammateEncounter, UserId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::{StorageResult, Store};

fn encounter_from_row(row: &SqliteRow) -> StorageResult<TeammateEncounter> {
    Ok(TeammateEncounter {
        user_id: row.try_get("user_id")?,
        account_id: row.try_get("account_id")?,
        games_together: row.try_get("games_together")?,
        games_won: row.try_get("games_won")?,
        games_lost: row.try_get("games_lost")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
    })
}

/// Fold encounter deltas into the stored rows. Counts are added, `first_seen`
/// only moves earlier and `last_seen` only moves later.
pub async fn upsert_encounters(
    conn: &mut SqliteConnection,
    deltas: &[TeammateEncounter],
) -> StorageResult<()> {
    for delta in deltas {
        sqlx::query(
            r#"
            INSERT INTO teammate_encounters (
                user_id, account_id, games_together, games_won, games_lost, first_seen, last_seen
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, account_id) DO UPDATE SET
                games_together = games_together + excluded.games_together,
                games_won      = games_won + excluded.games_won,
                games_lost     = games_lost + excluded.games_lost,
                first_seen     = MIN(first_seen, excluded.first_seen),
                last_seen      = MAX(last_seen, excluded.last_seen)
            "#,
        )
        .bind(delta.user_id)
        .bind(delta.account_id)
        .bind(delta.games_together)
        .bind(delta.games_won)
        .bind(delta.games_lost)
        .bind(delta.first_seen)
        .bind(delta.last_seen)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

impl Store {
    /// Encounters for a user, most games together first.
    pub async fn encounters_for_user(
        &self,
        user_id: UserId,
    ) -> StorageResult<Vec<TeammateEncounter>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, account_id, games_together, games_won, games_lost, first_seen, last_seen
              FROM teammate_encounters
             WHERE user_id = ?
             ORDER BY games_together DESC, account_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(encounter_from_row).collect()
    }

    pub async fn encounter(
        &self,
        user_id: UserId,
        account_id: AccountId,
    ) -> StorageResult<Option<TeammateEncounter>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, account_id, games_together, games_won, games_lost, first_seen, last_seen
              FROM teammate_encounters
             WHERE user_id = ? AND account_id = ?
            "#,
        )
        .bind(user_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(encounter_from_row).transpose()
    }
}
