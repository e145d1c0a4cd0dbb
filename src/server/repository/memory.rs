use super::{Repository, RepositoryError, RepositoryResult};
use crate::server::models::{Recording, UploadSession, UploadSessionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    sessions: HashMap<Uuid, UploadSession>,
    recordings: HashMap<Uuid, Recording>,
}

/// Repository kept in process memory. Used when no database is configured
/// and by tests. A single lock makes every method atomic.
#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self, session_id: Uuid) -> Option<UploadSession> {
        self.tables.lock().sessions.get(&session_id).cloned()
    }

    pub fn recording(&self, recording_id: Uuid) -> Option<Recording> {
        self.tables.lock().recordings.get(&recording_id).cloned()
    }

    pub fn recording_count(&self) -> usize {
        self.tables.lock().recordings.len()
    }

    pub fn session_count(&self) -> usize {
        self.tables.lock().sessions.len()
    }

    /// Seed a recording directly, bypassing the session flow
    pub fn insert_recording(&self, recording: Recording) {
        self.tables.lock().recordings.insert(recording.id, recording);
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn count_recordings(&self, owner_id: &str) -> RepositoryResult<u64> {
        let tables = self.tables.lock();
        Ok(tables.recordings.values().filter(|r| r.owner_id == owner_id).count() as u64)
    }

    async fn count_open_sessions(&self, owner_id: &str, now: DateTime<Utc>) -> RepositoryResult<u64> {
        let tables = self.tables.lock();
        Ok(tables
            .sessions
            .values()
            .filter(|s| {
                s.owner_id == owner_id
                    && s.status == UploadSessionStatus::Uploading
                    && s.expires_at > now
            })
            .count() as u64)
    }

    async fn insert_session(&self, session: &UploadSession) -> RepositoryResult<()> {
        let mut tables = self.tables.lock();
        if tables
            .sessions
            .values()
            .any(|s| s.recording_id == session.recording_id)
        {
            return Err(RepositoryError::Conflict("recording_id".to_string()));
        }
        tables.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session_by_recording(
        &self,
        recording_id: Uuid,
    ) -> RepositoryResult<Option<UploadSession>> {
        let tables = self.tables.lock();
        Ok(tables
            .sessions
            .values()
            .find(|s| s.recording_id == recording_id)
            .cloned())
    }

    async fn complete_session(
        &self,
        session_id: Uuid,
        parts_uploaded: i32,
        recording: &Recording,
    ) -> RepositoryResult<bool> {
        let mut tables = self.tables.lock();
        match tables.sessions.get(&session_id) {
            Some(s) if s.status == UploadSessionStatus::Uploading => {}
            _ => return Ok(false),
        }
        if tables.recordings.contains_key(&recording.id) {
            return Err(RepositoryError::Conflict("id".to_string()));
        }
        if tables
            .recordings
            .values()
            .any(|r| r.share_token == recording.share_token)
        {
            return Err(RepositoryError::Conflict("share_token".to_string()));
        }

        tables.recordings.insert(recording.id, recording.clone());
        if let Some(session) = tables.sessions.get_mut(&session_id) {
            session.status = UploadSessionStatus::Completed;
            session.parts_uploaded = parts_uploaded;
        }
        Ok(true)
    }

    async fn set_session_status(
        &self,
        session_id: Uuid,
        from: UploadSessionStatus,
        to: UploadSessionStatus,
    ) -> RepositoryResult<bool> {
        let mut tables = self.tables.lock();
        match tables.sessions.get_mut(&session_id) {
            Some(session) if session.status == from => {
                session.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_expired_sessions(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<UploadSession>> {
        let tables = self.tables.lock();
        Ok(tables
            .sessions
            .values()
            .filter(|s| s.status == UploadSessionStatus::Uploading && s.expires_at < now)
            .cloned()
            .collect())
    }

    async fn get_recording_by_share_token(&self, token: &str) -> RepositoryResult<Option<Recording>> {
        let tables = self.tables.lock();
        Ok(tables
            .recordings
            .values()
            .find(|r| r.share_token == token)
            .cloned())
    }

    async fn increment_view_count(&self, recording_id: Uuid) -> RepositoryResult<()> {
        if let Some(recording) = self.tables.lock().recordings.get_mut(&recording_id) {
            recording.view_count += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(recording_id: Uuid) -> UploadSession {
        let now = Utc::now();
        UploadSession {
            id: Uuid::new_v4(),
            recording_id,
            owner_id: "alice".to_string(),
            provider_upload_id: "upload-1".to_string(),
            object_key: format!("recordings/alice/{recording_id}.webm"),
            status: UploadSessionStatus::Uploading,
            parts_uploaded: 0,
            created_at: now,
            expires_at: now + Duration::minutes(15),
        }
    }

    fn recording(id: Uuid, token: &str) -> Recording {
        Recording {
            id,
            owner_id: "alice".to_string(),
            title: None,
            duration_seconds: 3.0,
            object_key: format!("recordings/alice/{id}.webm"),
            byte_size: 10,
            share_token: token.to_string(),
            is_public: true,
            view_count: 0,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_complete_session_applies_once() {
        let repo = MemoryRepository::new();
        let s = session(Uuid::new_v4());
        repo.insert_session(&s).await.unwrap();

        let rec = recording(s.recording_id, "AAAAAAAAAAAA");
        assert!(repo.complete_session(s.id, 1, &rec).await.unwrap());
        assert!(!repo.complete_session(s.id, 1, &rec).await.unwrap());

        assert_eq!(repo.recording_count(), 1);
        assert_eq!(repo.session(s.id).unwrap().status, UploadSessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_share_token_collision_leaves_session_uploading() {
        let repo = MemoryRepository::new();
        repo.insert_recording(recording(Uuid::new_v4(), "TAKENTAKEN12"));

        let s = session(Uuid::new_v4());
        repo.insert_session(&s).await.unwrap();
        let err = repo
            .complete_session(s.id, 1, &recording(s.recording_id, "TAKENTAKEN12"))
            .await
            .unwrap_err();

        assert!(matches!(err, RepositoryError::Conflict(field) if field == "share_token"));
        assert_eq!(repo.session(s.id).unwrap().status, UploadSessionStatus::Uploading);
    }

    #[tokio::test]
    async fn test_one_session_per_recording() {
        let repo = MemoryRepository::new();
        let recording_id = Uuid::new_v4();
        repo.insert_session(&session(recording_id)).await.unwrap();
        assert!(matches!(
            repo.insert_session(&session(recording_id)).await,
            Err(RepositoryError::Conflict(_))
        ));
    }
}
