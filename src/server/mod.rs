//! Upload orchestrator service behind `screenlink-server`

pub mod auth;
pub mod error;
pub mod http;
pub mod models;
pub mod orchestrator;
pub mod repository;
pub mod storage;

pub use auth::{AuthUser, JwtService};
pub use error::{ServiceError, ServiceResult};
pub use orchestrator::{OrchestratorSettings, UploadOrchestrator};

use crate::config::{ServerConfig, StorageBackend};
use repository::{MemoryRepository, PgRepository, Repository};
use std::sync::Arc;
use storage::{LocalStorage, ObjectStorage, S3Storage};
use tracing::{info, warn};

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<UploadOrchestrator>,
    pub jwt: Arc<JwtService>,
}

/// A wired service: handler state plus the local store when it serves its
/// own routes
pub struct Service {
    pub state: AppState,
    pub local_storage: Option<Arc<LocalStorage>>,
}

impl Service {
    pub async fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        let repository: Arc<dyn Repository> = match &config.database.url {
            Some(url) => {
                info!("Using Postgres repository");
                Arc::new(PgRepository::connect(url, config.database.max_connections).await?)
            }
            None => {
                warn!("No database configured, recordings are kept in memory");
                Arc::new(MemoryRepository::new())
            }
        };

        let mut local_storage = None;
        let storage: Arc<dyn ObjectStorage> = match config.storage.backend {
            StorageBackend::S3 => {
                info!("Using S3 bucket {}", config.storage.s3.bucket);
                Arc::new(S3Storage::new(&config.storage.s3)?)
            }
            StorageBackend::Local => {
                info!("Using in-process object storage");
                let local = Arc::new(LocalStorage::new(
                    &config.public_base_url,
                    &config.storage.local_signing_secret,
                )?);
                local_storage = Some(Arc::clone(&local));
                local
            }
        };

        let orchestrator =
            UploadOrchestrator::new(repository, storage, OrchestratorSettings::from(config));

        Ok(Self {
            state: AppState {
                orchestrator: Arc::new(orchestrator),
                jwt: Arc::new(JwtService::new(&config.auth.jwt_secret)),
            },
            local_storage,
        })
    }

    pub fn router(&self) -> axum::Router {
        http::router(self.state.clone(), self.local_storage.clone())
    }
}
