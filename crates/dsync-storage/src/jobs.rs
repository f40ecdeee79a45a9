use chrono::Utc;
use dsync_core::{JobId, JobKind, JobStatus, SyncJob, UserId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::debug;
use uuid::Uuid;

use crate::{StorageResult, Store};

const JOB_COLUMNS: &str = "id, user_id, kind, status, total, processed, new_matches, \
     execution_handle, created_at, started_at, completed_at, error";

/// Absolute counter values written to a job row at a commit point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobProgress {
    pub total: i64,
    pub processed: i64,
    pub new_matches: i64,
}

fn job_from_row(row: &SqliteRow) -> StorageResult<SyncJob> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(SyncJob {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        kind: kind.parse()?,
        status: status.parse()?,
        total: row.try_get("total")?,
        processed: row.try_get("processed")?,
        new_matches: row.try_get("new_matches")?,
        execution_handle: row.try_get("execution_handle")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error: row.try_get("error")?,
    })
}

async fn fetch_job(conn: &mut SqliteConnection, job_id: JobId) -> StorageResult<Option<SyncJob>> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = ?"))
        .bind(job_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

/// Write progress counters inside the caller's transaction.
pub async fn update_job_progress(
    conn: &mut SqliteConnection,
    job_id: JobId,
    progress: &JobProgress,
) -> StorageResult<()> {
    sqlx::query(
        r#"
        UPDATE sync_jobs
           SET total = ?, processed = ?, new_matches = ?
         WHERE id = ?
        "#,
    )
    .bind(progress.total)
    .bind(progress.processed)
    .bind(progress.new_matches)
    .bind(job_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

impl Store {
    /// Insert one pending job per planned kind, unless the user already has an
    /// active job. Returns `None` when the guard rejects the trigger.
    ///
    /// The guard and the inserts share one transaction, and the first insert
    /// is itself conditional, so two racing triggers cannot both pass.
    pub async fn create_jobs(
        &self,
        user_id: UserId,
        plan: &[JobKind],
    ) -> StorageResult<Option<Vec<SyncJob>>> {
        let Some((first, rest)) = plan.split_first() else {
            return Ok(Some(Vec::new()));
        };

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let guarded = sqlx::query(
            r#"
            INSERT INTO sync_jobs (user_id, kind, status, created_at)
            SELECT ?, ?, 'pending', ?
             WHERE NOT EXISTS (
                   SELECT 1 FROM sync_jobs
                    WHERE user_id = ?
                      AND status IN ('pending', 'running'))
            "#,
        )
        .bind(user_id)
        .bind(first.as_str())
        .bind(now)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        if guarded.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(user_id, "active job exists; trigger rejected");
            return Ok(None);
        }

        let mut ids = vec![guarded.last_insert_rowid()];
        for kind in rest {
            let res = sqlx::query(
                r#"
                INSERT INTO sync_jobs (user_id, kind, status, created_at)
                VALUES (?, ?, 'pending', ?)
                "#,
            )
            .bind(user_id)
            .bind(kind.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
            ids.push(res.last_insert_rowid());
        }

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = fetch_job(&mut tx, id).await? {
                jobs.push(job);
            }
        }
        tx.commit().await?;
        Ok(Some(jobs))
    }

    pub async fn get_job(&self, job_id: JobId) -> StorageResult<Option<SyncJob>> {
        let mut conn = self.pool.acquire().await?;
        fetch_job(&mut conn, job_id).await
    }

    pub async fn job_status(&self, job_id: JobId) -> StorageResult<Option<JobStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM sync_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status.map(|s| s.parse::<JobStatus>()).transpose()?)
    }

    /// Most recent first.
    pub async fn jobs_for_user(&self, user_id: UserId, limit: u32) -> StorageResult<Vec<SyncJob>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
              FROM sync_jobs
             WHERE user_id = ?
             ORDER BY created_at DESC, id DESC
             LIMIT ?
            "#
        ))
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Pending -> Running. Returns false if the job left Pending first
    /// (typically because it was cancelled).
    pub async fn mark_job_running(&self, job_id: JobId, handle: Uuid) -> StorageResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE sync_jobs
               SET status = 'running', started_at = ?, execution_handle = ?
             WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(Utc::now())
        .bind(handle)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Move an active job to a terminal status. A job that already reached a
    /// terminal state is left alone and `false` is returned.
    pub async fn finish_job(
        &self,
        job_id: JobId,
        status: JobStatus,
        error: Option<&str>,
    ) -> StorageResult<bool> {
        debug_assert!(status.is_terminal());
        let res = sqlx::query(
            r#"
            UPDATE sync_jobs
               SET status = ?, error = ?, completed_at = ?
             WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn cancel_job(&self, job_id: JobId, message: &str) -> StorageResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE sync_jobs
               SET status = 'cancelled', error = ?, completed_at = ?
             WHERE id = ?
            "#,
        )
        .bind(message)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn set_job_total(&self, job_id: JobId, total: i64) -> StorageResult<()> {
        sqlx::query("UPDATE sync_jobs SET total = ? WHERE id = ?")
            .bind(total)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
