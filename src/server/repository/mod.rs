//! Persistence of upload sessions and recordings

mod memory;
mod postgres;

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

use super::models::{Recording, UploadSession, UploadSessionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RepositoryError {
    /// A unique constraint rejected the write; carries the offending column
    #[error("Unique constraint violated on {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // unique_violation
            if db_err.code().as_deref() == Some("23505") {
                let field = match db_err.constraint() {
                    Some(c) if c.contains("share_token") => "share_token",
                    Some(c) if c.contains("recording_id") => "recording_id",
                    _ => "unknown",
                };
                return RepositoryError::Conflict(field.to_string());
            }
        }
        RepositoryError::Database(err)
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait Repository: Send + Sync {
    /// Recordings currently stored for an owner
    async fn count_recordings(&self, owner_id: &str) -> RepositoryResult<u64>;

    /// Sessions of an owner still `uploading` and not yet past their expiry
    async fn count_open_sessions(&self, owner_id: &str, now: DateTime<Utc>) -> RepositoryResult<u64>;

    /// Fails with `Conflict("recording_id")` if the recording already has a session
    async fn insert_session(&self, session: &UploadSession) -> RepositoryResult<()>;

    async fn get_session_by_recording(
        &self,
        recording_id: Uuid,
    ) -> RepositoryResult<Option<UploadSession>>;

    /// Atomically move `session_id` from `uploading` to `completed` and
    /// insert `recording`. Returns `false` without writing anything when the
    /// session had already left `uploading`. A share token collision fails
    /// with `Conflict("share_token")` and leaves the session untouched.
    async fn complete_session(
        &self,
        session_id: Uuid,
        parts_uploaded: i32,
        recording: &Recording,
    ) -> RepositoryResult<bool>;

    /// Compare-and-set on the session status. Returns whether it applied.
    async fn set_session_status(
        &self,
        session_id: Uuid,
        from: UploadSessionStatus,
        to: UploadSessionStatus,
    ) -> RepositoryResult<bool>;

    /// Sessions still `uploading` whose expiry is before `now`
    async fn list_expired_sessions(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<UploadSession>>;

    async fn get_recording_by_share_token(&self, token: &str) -> RepositoryResult<Option<Recording>>;

    async fn increment_view_count(&self, recording_id: Uuid) -> RepositoryResult<()>;
}
