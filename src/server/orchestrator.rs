//! Upload session lifecycle: init, complete, watch and expiry sweeps

use super::error::{ServiceError, ServiceResult};
use super::models::{object_key, Principal, Recording, Tier, UploadSession, UploadSessionStatus};
use super::repository::{Repository, RepositoryError};
use super::storage::ObjectStorage;
use crate::config::ServerConfig;
use crate::upload::types::{
    CompleteUploadRequest, CompleteUploadResponse, InitUploadRequest, InitUploadResponse,
    WatchResponse,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Most parts a single upload may declare
pub const MAX_PARTS: u32 = 100;
pub const SHARE_TOKEN_LENGTH: usize = 12;
const SHARE_TOKEN_ATTEMPTS: usize = 5;

const ALPHANUMERIC: [char; 62] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S',
    'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l',
    'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4',
    '5', '6', '7', '8', '9',
];

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;
pub type TokenGenerator = Arc<dyn Fn() -> String + Send + Sync>;

pub fn generate_share_token() -> String {
    nanoid::nanoid!(SHARE_TOKEN_LENGTH, &ALPHANUMERIC)
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub public_base_url: String,
    pub session_ttl: Duration,
    pub watch_url_ttl: Duration,
    pub free_max_recordings: Option<u64>,
    pub pro_max_recordings: Option<u64>,
    pub free_retention: chrono::Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            public_base_url: "http://localhost:8080".to_string(),
            session_ttl: Duration::from_secs(15 * 60),
            watch_url_ttl: Duration::from_secs(60 * 60),
            free_max_recordings: Some(25),
            pro_max_recordings: None,
            free_retention: chrono::Duration::days(30),
        }
    }
}

impl From<&ServerConfig> for OrchestratorSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
            session_ttl: Duration::from_secs(config.session.ttl_secs),
            free_max_recordings: config.quota.free_max_recordings,
            pro_max_recordings: config.quota.pro_max_recordings,
            free_retention: chrono::Duration::days(config.retention.free_days),
            ..Self::default()
        }
    }
}

impl OrchestratorSettings {
    fn quota(&self, tier: Tier) -> Option<u64> {
        match tier {
            Tier::Free => self.free_max_recordings,
            Tier::Pro => self.pro_max_recordings,
        }
    }

    fn expiry(&self, tier: Tier, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match tier {
            Tier::Free => Some(created_at + self.free_retention),
            Tier::Pro => None,
        }
    }

    pub fn share_url(&self, token: &str) -> String {
        format!("{}/watch/{}", self.public_base_url.trim_end_matches('/'), token)
    }
}

/// Server-side owner of upload sessions and published recordings
pub struct UploadOrchestrator {
    repository: Arc<dyn Repository>,
    storage: Arc<dyn ObjectStorage>,
    settings: OrchestratorSettings,
    clock: Clock,
    tokens: TokenGenerator,
    /// Serializes completion per recording within this process
    completions: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
}

impl UploadOrchestrator {
    pub fn new(
        repository: Arc<dyn Repository>,
        storage: Arc<dyn ObjectStorage>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            repository,
            storage,
            settings,
            clock: Arc::new(Utc::now),
            tokens: Arc::new(generate_share_token),
            completions: DashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_token_generator(mut self, tokens: TokenGenerator) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Open an upload session and sign one URL per part
    pub async fn init(
        &self,
        principal: &Principal,
        request: &InitUploadRequest,
    ) -> ServiceResult<InitUploadResponse> {
        if request.part_count == 0 || request.part_count > MAX_PARTS {
            return Err(ServiceError::InvalidInput(format!(
                "partCount must be between 1 and {MAX_PARTS}, got {}",
                request.part_count
            )));
        }

        // Uploads still in flight count against the quota
        if let Some(limit) = self.settings.quota(principal.tier) {
            let stored = self.repository.count_recordings(&principal.owner_id).await?;
            let open = self
                .repository
                .count_open_sessions(&principal.owner_id, self.now())
                .await?;
            if stored + open >= limit {
                info!(
                    "Owner {} hit the recording quota ({} stored, {} uploading, limit {})",
                    principal.owner_id, stored, open, limit
                );
                return Err(ServiceError::QuotaExceeded { limit });
            }
        }

        let recording_id = Uuid::new_v4();
        let key = object_key(&principal.owner_id, recording_id);
        let upload_id = self.storage.create_multipart(&key).await?;

        let created_at = self.now();
        let ttl = chrono::Duration::from_std(self.settings.session_ttl)
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        let session = UploadSession {
            id: Uuid::new_v4(),
            recording_id,
            owner_id: principal.owner_id.clone(),
            provider_upload_id: upload_id.clone(),
            object_key: key.clone(),
            status: UploadSessionStatus::Uploading,
            parts_uploaded: 0,
            created_at,
            expires_at: created_at + ttl,
        };

        if let Err(e) = self.repository.insert_session(&session).await {
            self.abort_quietly(&key, &upload_id).await;
            return Err(e.into());
        }

        let upload_urls = (1..=request.part_count)
            .map(|n| {
                self.storage
                    .presign_upload_part(&key, &upload_id, n, self.settings.session_ttl)
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            "Opened upload session {} for recording {} ({} parts, ~{} bytes)",
            session.id, recording_id, request.part_count, request.estimated_size
        );

        Ok(InitUploadResponse {
            recording_id,
            upload_id,
            upload_urls,
        })
    }

    /// Assemble the uploaded parts and publish the recording
    pub async fn complete(
        &self,
        principal: &Principal,
        request: &CompleteUploadRequest,
    ) -> ServiceResult<CompleteUploadResponse> {
        let lock = self
            .completions
            .entry(request.recording_id)
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.complete_locked(principal, request).await
        };
        drop(lock);
        self.completions
            .remove_if(&request.recording_id, |_, m| Arc::strong_count(m) == 1);
        result
    }

    async fn complete_locked(
        &self,
        principal: &Principal,
        request: &CompleteUploadRequest,
    ) -> ServiceResult<CompleteUploadResponse> {
        let session = self
            .repository
            .get_session_by_recording(request.recording_id)
            .await?
            .ok_or(ServiceError::SessionNotFound)?;

        if session.owner_id != principal.owner_id {
            warn!(
                "Owner {} tried to complete recording {} of another user",
                principal.owner_id, request.recording_id
            );
            return Err(ServiceError::SessionForbidden);
        }
        // A swept session reports the same error as one still awaiting the sweep
        let now = self.now();
        match session.status {
            UploadSessionStatus::Uploading if now > session.expires_at => {
                return Err(ServiceError::SessionExpired)
            }
            UploadSessionStatus::Uploading => {}
            UploadSessionStatus::Expired => return Err(ServiceError::SessionExpired),
            UploadSessionStatus::Completed | UploadSessionStatus::Failed => {
                return Err(ServiceError::SessionInactive)
            }
        }
        if !request.duration.is_finite() || request.duration < 0.0 {
            return Err(ServiceError::InvalidInput(format!(
                "duration must be a non-negative number, got {}",
                request.duration
            )));
        }

        if let Err(e) = self
            .storage
            .complete_multipart(&session.object_key, &session.provider_upload_id, &request.parts)
            .await
        {
            error!("Assembly of recording {} failed: {}", session.recording_id, e);
            self.repository
                .set_session_status(
                    session.id,
                    UploadSessionStatus::Uploading,
                    UploadSessionStatus::Failed,
                )
                .await?;
            self.abort_quietly(&session.object_key, &session.provider_upload_id)
                .await;
            return Err(ServiceError::AssemblyFailed(e.to_string()));
        }

        let byte_size = self.storage.head(&session.object_key).await?;
        let byte_size = i64::try_from(byte_size)
            .map_err(|_| ServiceError::Internal(format!("object size {byte_size} overflows")))?;

        for attempt in 1..=SHARE_TOKEN_ATTEMPTS {
            let share_token = (self.tokens)();
            let recording = Recording {
                id: session.recording_id,
                owner_id: session.owner_id.clone(),
                title: request.title.clone(),
                duration_seconds: request.duration,
                object_key: session.object_key.clone(),
                byte_size,
                share_token: share_token.clone(),
                is_public: true,
                view_count: 0,
                created_at: now,
                expires_at: self.settings.expiry(principal.tier, now),
            };

            match self
                .repository
                .complete_session(session.id, request.parts.len() as i32, &recording)
                .await
            {
                Ok(true) => {
                    info!(
                        "Published recording {} ({} bytes) as {}",
                        recording.id, byte_size, share_token
                    );
                    return Ok(CompleteUploadResponse {
                        share_url: self.settings.share_url(&share_token),
                        share_token,
                    });
                }
                Ok(false) => return Err(ServiceError::SessionInactive),
                Err(RepositoryError::Conflict(field)) if field == "share_token" => {
                    warn!("Share token collision (attempt {})", attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ServiceError::Internal(
            "could not allocate a unique share token".to_string(),
        ))
    }

    /// Resolve a share token to a time-limited download URL
    pub async fn watch(&self, share_token: &str) -> ServiceResult<WatchResponse> {
        let recording = self
            .repository
            .get_recording_by_share_token(share_token)
            .await?
            .filter(|r| r.is_public && !r.is_expired(self.now()))
            .ok_or(ServiceError::RecordingNotFound)?;

        let video_url = self
            .storage
            .presign_get(&recording.object_key, self.settings.watch_url_ttl)?;

        let repository = Arc::clone(&self.repository);
        let recording_id = recording.id;
        tokio::spawn(async move {
            if let Err(e) = repository.increment_view_count(recording_id).await {
                warn!("Failed to count view of {}: {}", recording_id, e);
            }
        });

        Ok(WatchResponse {
            title: recording.title,
            duration: recording.duration_seconds,
            video_url,
            created_at: recording.created_at,
        })
    }

    /// Expire sessions left in `uploading` past their deadline. Returns how
    /// many were expired.
    pub async fn sweep_expired(&self) -> ServiceResult<usize> {
        let expired = self.repository.list_expired_sessions(self.now()).await?;
        let mut count = 0;
        for session in expired {
            let applied = self
                .repository
                .set_session_status(
                    session.id,
                    UploadSessionStatus::Uploading,
                    UploadSessionStatus::Expired,
                )
                .await?;
            if applied {
                count += 1;
                self.abort_quietly(&session.object_key, &session.provider_upload_id)
                    .await;
            }
        }
        if count > 0 {
            info!("Expired {} stale upload sessions", count);
        }
        Ok(count)
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = orchestrator.sweep_expired().await {
                            error!("Session sweep failed: {}", e);
                        }
                    }
                }
            }
            debug!("Session sweeper stopped");
        })
    }

    async fn abort_quietly(&self, key: &str, upload_id: &str) {
        if let Err(e) = self.storage.abort_multipart(key, upload_id).await {
            warn!("Failed to abort multipart upload {}: {}", upload_id, e);
        }
    }
}
