use super::{Repository, RepositoryError, RepositoryResult};
use crate::server::models::{Recording, UploadSession, UploadSessionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

const SESSION_COLUMNS: &str = "id, recording_id, owner_id, provider_upload_id, object_key, \
     status, parts_uploaded, created_at, expires_at";

const RECORDING_COLUMNS: &str = "id, owner_id, title, duration_seconds, object_key, byte_size, \
     share_token, is_public, view_count, created_at, expires_at";

/// Postgres-backed repository
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date
    pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Migrations completed");

        Ok(Self::new(pool))
    }

    fn row_to_session(row: PgRow) -> RepositoryResult<UploadSession> {
        let status: String = row.try_get("status")?;
        Ok(UploadSession {
            id: row.try_get("id")?,
            recording_id: row.try_get("recording_id")?,
            owner_id: row.try_get("owner_id")?,
            provider_upload_id: row.try_get("provider_upload_id")?,
            object_key: row.try_get("object_key")?,
            status: status.parse().map_err(RepositoryError::Corrupt)?,
            parts_uploaded: row.try_get("parts_uploaded")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    fn row_to_recording(row: PgRow) -> RepositoryResult<Recording> {
        Ok(Recording {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            title: row.try_get("title")?,
            duration_seconds: row.try_get("duration_seconds")?,
            object_key: row.try_get("object_key")?,
            byte_size: row.try_get("byte_size")?,
            share_token: row.try_get("share_token")?,
            is_public: row.try_get("is_public")?,
            view_count: row.try_get("view_count")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn count_recordings(&self, owner_id: &str) -> RepositoryResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM recordings WHERE owner_id = $1")
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn count_open_sessions(&self, owner_id: &str, now: DateTime<Utc>) -> RepositoryResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM upload_sessions \
             WHERE owner_id = $1 AND status = 'uploading' AND expires_at > $2",
        )
        .bind(owner_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn insert_session(&self, session: &UploadSession) -> RepositoryResult<()> {
        sqlx::query(
            r"
            INSERT INTO upload_sessions
                (id, recording_id, owner_id, provider_upload_id, object_key,
                 status, parts_uploaded, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(session.id)
        .bind(session.recording_id)
        .bind(&session.owner_id)
        .bind(&session.provider_upload_id)
        .bind(&session.object_key)
        .bind(session.status.as_str())
        .bind(session.parts_uploaded)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session_by_recording(
        &self,
        recording_id: Uuid,
    ) -> RepositoryResult<Option<UploadSession>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE recording_id = $1"
        ))
        .bind(recording_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_session).transpose()
    }

    async fn complete_session(
        &self,
        session_id: Uuid,
        parts_uploaded: i32,
        recording: &Recording,
    ) -> RepositoryResult<bool> {
        let mut tx = self.pool.begin().await?;

        // The row lock taken here serializes concurrent completions; the
        // loser re-evaluates the status predicate after the winner commits.
        let updated = sqlx::query(
            r"
            UPDATE upload_sessions
            SET status = 'completed', parts_uploaded = $2
            WHERE id = $1 AND status = 'uploading'
            ",
        )
        .bind(session_id)
        .bind(parts_uploaded)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r"
            INSERT INTO recordings
                (id, owner_id, title, duration_seconds, object_key, byte_size,
                 share_token, is_public, view_count, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ",
        )
        .bind(recording.id)
        .bind(&recording.owner_id)
        .bind(&recording.title)
        .bind(recording.duration_seconds)
        .bind(&recording.object_key)
        .bind(recording.byte_size)
        .bind(&recording.share_token)
        .bind(recording.is_public)
        .bind(recording.view_count)
        .bind(recording.created_at)
        .bind(recording.expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn set_session_status(
        &self,
        session_id: Uuid,
        from: UploadSessionStatus,
        to: UploadSessionStatus,
    ) -> RepositoryResult<bool> {
        let result = sqlx::query("UPDATE upload_sessions SET status = $3 WHERE id = $1 AND status = $2")
            .bind(session_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_expired_sessions(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<UploadSession>> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions \
             WHERE status = 'uploading' AND expires_at < $1"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_session).collect()
    }

    async fn get_recording_by_share_token(&self, token: &str) -> RepositoryResult<Option<Recording>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORDING_COLUMNS} FROM recordings WHERE share_token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_recording).transpose()
    }

    async fn increment_view_count(&self, recording_id: Uuid) -> RepositoryResult<()> {
        sqlx::query("UPDATE recordings SET view_count = view_count + 1 WHERE id = $1")
            .bind(recording_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
