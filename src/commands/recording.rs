//! Recording request handlers
//!
//! Every mutating request takes the coordinator lock; status reads go through
//! the lock-free `StatusReader` so they answer even while a stop is flushing.

use crate::recorder::{
    CoordinatorHandle, RecordingConfig, StatusReader, StatusSnapshot, StoredArtifact,
};
use crate::utils::ErrorResponse;

/// Coordinator state shared by all IPC connections
#[derive(Clone)]
pub struct RecorderState {
    pub coordinator: CoordinatorHandle,
    pub status: StatusReader,
    /// Configuration used when a start request carries none
    pub defaults: RecordingConfig,
}

impl RecorderState {
    pub async fn new(coordinator: CoordinatorHandle, defaults: RecordingConfig) -> Self {
        let status = coordinator.lock().await.status_reader();
        Self {
            coordinator,
            status,
            defaults,
        }
    }
}

/// Start recording
pub async fn start_recording(
    state: &RecorderState,
    config: Option<RecordingConfig>,
) -> Result<StatusSnapshot, ErrorResponse> {
    let config = config.unwrap_or_else(|| state.defaults.clone());
    let mut coordinator = state.coordinator.lock().await;
    coordinator.start(config).await.map_err(ErrorResponse::from)
}

/// Stop recording
pub async fn stop_recording(state: &RecorderState) -> Result<StoredArtifact, ErrorResponse> {
    let mut coordinator = state.coordinator.lock().await;
    coordinator.stop().await.map_err(ErrorResponse::from)
}

/// Pause recording
pub async fn pause_recording(state: &RecorderState) -> Result<StatusSnapshot, ErrorResponse> {
    let mut coordinator = state.coordinator.lock().await;
    coordinator.pause().map_err(ErrorResponse::from)
}

/// Resume recording
pub async fn resume_recording(state: &RecorderState) -> Result<StatusSnapshot, ErrorResponse> {
    let mut coordinator = state.coordinator.lock().await;
    coordinator.resume().map_err(ErrorResponse::from)
}

/// Get current recording status
pub fn get_recording_status(state: &RecorderState) -> StatusSnapshot {
    state.status.snapshot()
}

/// Retry the last failed upload
pub async fn retry_upload(state: &RecorderState) -> Result<(), ErrorResponse> {
    let mut coordinator = state.coordinator.lock().await;
    coordinator.retry_upload().map_err(ErrorResponse::from)
}
