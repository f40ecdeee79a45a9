use chrono::{DateTime, Utc};
use dsync_core::{User, UserId};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::{StorageResult, Store};

fn user_from_row(row: &SqliteRow) -> StorageResult<User> {
    Ok(User {
        id: row.try_get("id")?,
        steam_id: row.try_get("steam_id")?,
        persona_name: row.try_get("persona_name")?,
        last_sync_at: row.try_get("last_sync_at")?,
        created_at: row.try_get("created_at")?,
    })
}

impl Store {
    /// Register a user, or return the existing row for the same Steam id.
    pub async fn upsert_user(&self, steam_id: i64, persona_name: &str) -> StorageResult<User> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO users (steam_id, persona_name, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(steam_id) DO UPDATE SET persona_name = excluded.persona_name
            RETURNING id, steam_id, persona_name, last_sync_at, created_at
            "#,
        )
        .bind(steam_id)
        .bind(persona_name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        user_from_row(&row)
    }

    pub async fn get_user(&self, user_id: UserId) -> StorageResult<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT id, steam_id, persona_name, last_sync_at, created_at
              FROM users
             WHERE id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn list_users(&self) -> StorageResult<Vec<User>> {
        let rows = sqlx::query(
            r#"
            SELECT id, steam_id, persona_name, last_sync_at, created_at
              FROM users
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_from_row).collect()
    }

    pub async fn touch_last_sync(&self, user_id: UserId, at: DateTime<Utc>) -> StorageResult<()> {
        sqlx::query("UPDATE users SET last_sync_at = ? WHERE id = ?")
            .bind(at)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
