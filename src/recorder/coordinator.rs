//! Recording coordinator
//!
//! The long-lived owner of the capture session. Every start/pause/resume/stop
//! request funnels through one `RecordingCoordinator` behind a single async
//! mutex, so at most one recording can ever be active. Status is mirrored into
//! a lock-free reader so a reattaching UI never waits on a stop in progress.

use super::controller::{CaptureController, ControllerSettings, RecordingArtifact, StopRequest};
use super::encoder::EncoderFactory;
use super::error::{RecordingError, RecordingResult};
use super::state::{
    CaptureSession, RecordingConfig, RecordingState, StatusSnapshot, StoredArtifact, UploadStatus,
};
use crate::capture::SourceProvider;
use crate::upload::{ArtifactUploader, ProgressFn};
use bytes::Bytes;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Events emitted during recording
#[derive(Debug, Clone)]
pub enum RecordingEvent {
    /// Recording started
    Started,
    /// Recording stopped and the artifact was stored
    Stopped(StoredArtifact),
    /// Recording paused
    Paused,
    /// Recording resumed
    Resumed,
    /// Error occurred
    Error(String),
    /// Upload progress (percent)
    Progress(f64),
    /// Upload finished
    Uploaded { share_url: String },
}

/// Where artifacts go and whether they are uploaded automatically
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub artifact_dir: PathBuf,
    pub auto_upload: bool,
}

#[derive(Debug, Default)]
struct CoordinatorStatus {
    state: RecordingState,
    session: Option<CaptureSession>,
    last_error: Option<String>,
    last_artifact: Option<StoredArtifact>,
    upload: UploadStatus,
    /// Bumped whenever `upload` is handed to a new artifact; upload tasks
    /// only write while their generation is current
    upload_generation: u64,
}

impl CoordinatorStatus {
    fn snapshot(&self) -> StatusSnapshot {
        let session = self.session.as_ref();
        StatusSnapshot {
            status: self.state,
            is_recording: matches!(
                self.state,
                RecordingState::Recording | RecordingState::Paused | RecordingState::Finalizing
            ),
            is_paused: self.state == RecordingState::Paused,
            start_time: session.map(|s| s.started_at),
            accumulated_pause_seconds: session
                .map(|s| s.accumulated_pause().as_secs_f64())
                .unwrap_or(0.0),
            elapsed_seconds: session.map(|s| s.elapsed().as_secs_f64()).unwrap_or(0.0),
            sources: session.map(|s| s.source_flags),
            last_error: self.last_error.clone(),
            last_artifact: self.last_artifact.clone(),
            upload: self.upload.clone(),
        }
    }
}

/// Read-only view of the coordinator's status that never blocks on the
/// coordinator lock
#[derive(Clone)]
pub struct StatusReader(Arc<RwLock<CoordinatorStatus>>);

impl StatusReader {
    pub fn snapshot(&self) -> StatusSnapshot {
        self.0.read().snapshot()
    }
}

/// Shared handle the request handlers use
pub type CoordinatorHandle = Arc<tokio::sync::Mutex<RecordingCoordinator>>;

/// Owns the capture controller and the upload of finished artifacts
pub struct RecordingCoordinator {
    controller: CaptureController,
    status: Arc<RwLock<CoordinatorStatus>>,
    uploader: Option<Arc<dyn ArtifactUploader>>,
    settings: CoordinatorSettings,
    event_tx: broadcast::Sender<RecordingEvent>,
    upload_tasks: Vec<JoinHandle<()>>,
}

impl RecordingCoordinator {
    /// Create a coordinator. The returned receiver carries the controller's
    /// stop requests and should be handed to [`spawn_supervisor`].
    pub fn new(
        provider: Arc<dyn SourceProvider>,
        encoders: Arc<dyn EncoderFactory>,
        controller_settings: ControllerSettings,
        settings: CoordinatorSettings,
        uploader: Option<Arc<dyn ArtifactUploader>>,
    ) -> (Self, mpsc::UnboundedReceiver<StopRequest>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(100);
        let coordinator = Self {
            controller: CaptureController::new(provider, encoders, controller_settings, signal_tx),
            status: Arc::new(RwLock::new(CoordinatorStatus::default())),
            uploader,
            settings,
            event_tx,
            upload_tasks: Vec::new(),
        };
        (coordinator, signal_rx)
    }

    /// Wrap into the shared handle
    pub fn into_handle(self) -> CoordinatorHandle {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    pub fn status_reader(&self) -> StatusReader {
        StatusReader(self.status.clone())
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.read().snapshot()
    }

    pub fn state(&self) -> RecordingState {
        self.controller.state()
    }

    pub fn capture_id(&self) -> Option<u64> {
        self.controller.capture_id()
    }

    /// Subscribe to recording events
    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.event_tx.subscribe()
    }

    fn publish(&self) {
        let mut status = self.status.write();
        status.state = self.controller.state();
        status.session = self.controller.session();
    }

    /// Start recording. Rejected while another recording is active.
    pub async fn start(&mut self, config: RecordingConfig) -> RecordingResult<StatusSnapshot> {
        if self.controller.state().is_active() {
            return Err(RecordingError::AlreadyRecording);
        }
        {
            let mut status = self.status.write();
            status.state = RecordingState::Requesting;
            status.last_error = None;
        }

        match self.controller.start(&config).await {
            Ok(_) => {
                self.publish();
                let _ = self.event_tx.send(RecordingEvent::Started);
                tracing::info!("Recording started");
                Ok(self.snapshot())
            }
            Err(e) => {
                self.publish();
                self.status.write().last_error = Some(e.to_string());
                let _ = self.event_tx.send(RecordingEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Pause; a no-op when already paused
    pub fn pause(&mut self) -> RecordingResult<StatusSnapshot> {
        if self.controller.pause()? {
            let _ = self.event_tx.send(RecordingEvent::Paused);
        }
        self.publish();
        Ok(self.snapshot())
    }

    /// Resume; a no-op when not paused
    pub fn resume(&mut self) -> RecordingResult<StatusSnapshot> {
        if self.controller.resume()? {
            let _ = self.event_tx.send(RecordingEvent::Resumed);
        }
        self.publish();
        Ok(self.snapshot())
    }

    /// Stop, store the artifact locally and (optionally) start the upload
    pub async fn stop(&mut self) -> RecordingResult<StoredArtifact> {
        self.controller.begin_finalizing()?;
        self.publish();

        let artifact = match self.controller.stop().await {
            Ok(artifact) => artifact,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        let started_at = self
            .status
            .read()
            .session
            .as_ref()
            .map(|s| s.started_at)
            .unwrap_or_else(chrono::Utc::now);
        let stored = match self.store_artifact(&artifact, started_at).await {
            Ok(stored) => stored,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        {
            let mut status = self.status.write();
            status.state = self.controller.state();
            status.session = None;
            status.last_artifact = Some(stored.clone());
            status.upload = UploadStatus::Idle;
            status.upload_generation += 1;
        }
        let _ = self.event_tx.send(RecordingEvent::Stopped(stored.clone()));

        if self.settings.auto_upload && self.uploader.is_some() {
            self.spawn_upload(stored.clone(), Some(artifact.data));
        }
        Ok(stored)
    }

    fn fail(&mut self, error: &RecordingError) {
        let mut status = self.status.write();
        status.state = self.controller.state();
        status.session = None;
        status.last_error = Some(error.to_string());
        drop(status);
        let _ = self.event_tx.send(RecordingEvent::Error(error.to_string()));
    }

    async fn store_artifact(
        &self,
        artifact: &RecordingArtifact,
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> RecordingResult<StoredArtifact> {
        tokio::fs::create_dir_all(&self.settings.artifact_dir).await?;
        let path = self
            .settings
            .artifact_dir
            .join(format!("recording-{}.webm", started_at.timestamp_millis()));
        tokio::fs::write(&path, &artifact.data).await?;
        tracing::info!("Artifact written to {:?}", path);

        Ok(StoredArtifact {
            path,
            byte_size: artifact.data.len() as u64,
            duration_seconds: artifact.duration.as_secs_f64(),
            chunk_count: artifact.chunk_count,
            title: artifact.title.clone(),
        })
    }

    /// Re-run the whole upload for the artifact whose upload failed
    pub fn retry_upload(&mut self) -> RecordingResult<()> {
        if self.uploader.is_none() {
            return Err(RecordingError::ConfigurationError(
                "uploads are not configured".to_string(),
            ));
        }
        let artifact = {
            let status = self.status.read();
            match (&status.upload, &status.last_artifact) {
                (UploadStatus::Failed { .. }, Some(artifact)) => artifact.clone(),
                _ => return Err(RecordingError::NoPendingUpload),
            }
        };
        tracing::info!("Retrying upload of {:?}", artifact.path);
        self.spawn_upload(artifact, None);
        Ok(())
    }

    /// Wait for every upload still running, superseded ones included
    pub async fn wait_for_upload(&mut self) {
        for task in self.upload_tasks.drain(..) {
            let _ = task.await;
        }
    }

    fn spawn_upload(&mut self, artifact: StoredArtifact, data: Option<Bytes>) {
        let Some(uploader) = self.uploader.clone() else {
            return;
        };
        let generation = {
            let mut status = self.status.write();
            status.upload_generation += 1;
            status.upload = UploadStatus::Uploading { percent: 0.0 };
            status.upload_generation
        };

        let status = self.status.clone();
        let events = self.event_tx.clone();
        let task = tokio::spawn(async move {
            let data = match data {
                Some(data) => data,
                None => match tokio::fs::read(&artifact.path).await {
                    Ok(bytes) => Bytes::from(bytes),
                    Err(e) => {
                        let message = format!("Failed to read {:?}: {}", artifact.path, e);
                        tracing::error!("{}", message);
                        if set_upload(&status, generation, UploadStatus::Failed {
                            message: message.clone(),
                            artifact_path: artifact.path.clone(),
                        }) {
                            let _ = events.send(RecordingEvent::Error(message));
                        }
                        return;
                    }
                },
            };

            let progress: ProgressFn = {
                let status = status.clone();
                let events = events.clone();
                Arc::new(move |percent: f64| {
                    if set_upload(&status, generation, UploadStatus::Uploading { percent }) {
                        let _ = events.send(RecordingEvent::Progress(percent));
                    }
                })
            };

            match uploader
                .upload(data, artifact.duration_seconds, artifact.title.clone(), progress)
                .await
            {
                Ok(outcome) => {
                    if let Err(e) = tokio::fs::remove_file(&artifact.path).await {
                        tracing::warn!("Failed to remove uploaded artifact {:?}: {}", artifact.path, e);
                    }
                    let mut guard = status.write();
                    if guard.upload_generation != generation {
                        tracing::info!(
                            "Upload of {:?} finished after a newer recording took over",
                            artifact.path
                        );
                        return;
                    }
                    guard.upload = UploadStatus::Uploaded {
                        share_url: outcome.share_url.clone(),
                        share_token: outcome.share_token,
                    };
                    guard.last_artifact = None;
                    drop(guard);
                    let _ = events.send(RecordingEvent::Uploaded {
                        share_url: outcome.share_url,
                    });
                }
                Err(e) => {
                    tracing::error!("Upload failed, keeping {:?}: {}", artifact.path, e);
                    if set_upload(&status, generation, UploadStatus::Failed {
                        message: e.to_string(),
                        artifact_path: artifact.path.clone(),
                    }) {
                        let _ = events.send(RecordingEvent::Error(e.to_string()));
                    }
                }
            }
        });
        self.upload_tasks.retain(|task| !task.is_finished());
        self.upload_tasks.push(task);
    }
}

/// Write the upload status if `generation` still owns it
fn set_upload(status: &RwLock<CoordinatorStatus>, generation: u64, upload: UploadStatus) -> bool {
    let mut guard = status.write();
    if guard.upload_generation != generation {
        tracing::debug!("Dropping status from superseded upload {}", generation);
        return false;
    }
    guard.upload = upload;
    true
}

/// Act on the controller's stop requests (auto-stop at the duration ceiling,
/// screen share ended by the user).
pub fn spawn_supervisor(
    handle: CoordinatorHandle,
    mut requests: mpsc::UnboundedReceiver<StopRequest>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let mut coordinator = handle.lock().await;
            if coordinator.capture_id() != Some(request.capture_id) {
                tracing::debug!("Ignoring stale stop request {:?}", request);
                continue;
            }
            tracing::info!("Stopping recording: {:?}", request.reason);
            if let Err(e) = coordinator.stop().await {
                tracing::warn!("Automatic stop failed: {}", e);
            }
        }
    })
}
