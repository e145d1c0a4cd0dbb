#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use screenlink::capture::synthetic::{SyntheticDevices, SyntheticSourceProvider};
use screenlink::capture::{AudioChunk, Resolution, VideoFrame};
use screenlink::recorder::{
    spawn_supervisor, ControllerSettings, CoordinatorHandle, CoordinatorSettings, EncoderFactory,
    EncoderSettings, MediaEncoder, RecordingConfig, RecordingCoordinator, RecordingError,
    RecordingResult, RecordingState, StatusSnapshot,
};
use screenlink::upload::ArtifactUploader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Bytes the double "encodes" per accepted frame
pub const BYTES_PER_FRAME: usize = 16;

#[derive(Debug, Default, Clone)]
pub struct EncoderStats {
    pub created: usize,
    pub frames: usize,
    pub audio_samples: usize,
    pub finished: usize,
    pub last_settings: Option<EncoderSettings>,
}

/// Encoder double that turns every frame into a fixed number of bytes
#[derive(Default)]
pub struct RecordingEncoderFactory {
    pub stats: Arc<Mutex<EncoderStats>>,
    /// Produce no output at all
    pub silent: bool,
    pub unsupported: bool,
}

impl RecordingEncoderFactory {
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }

    pub fn stats(&self) -> EncoderStats {
        self.stats.lock().clone()
    }
}

struct RecordingEncoder {
    stats: Arc<Mutex<EncoderStats>>,
    buffer: BytesMut,
    silent: bool,
}

impl MediaEncoder for RecordingEncoder {
    fn mime_type(&self) -> &str {
        "video/webm"
    }

    fn write_video(&mut self, frame: Arc<VideoFrame>) -> RecordingResult<()> {
        self.stats.lock().frames += 1;
        if !self.silent {
            let marker = frame.data.first().copied().unwrap_or(0);
            self.buffer.extend_from_slice(&[marker; BYTES_PER_FRAME]);
        }
        Ok(())
    }

    fn write_audio(&mut self, chunk: AudioChunk) -> RecordingResult<()> {
        self.stats.lock().audio_samples += chunk.samples.len();
        Ok(())
    }

    fn request_data(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    fn finish(self: Box<Self>) -> RecordingResult<Bytes> {
        self.stats.lock().finished += 1;
        Ok(self.buffer.freeze())
    }
}

impl EncoderFactory for RecordingEncoderFactory {
    fn create(&self, settings: &EncoderSettings) -> RecordingResult<Box<dyn MediaEncoder>> {
        if self.unsupported {
            return Err(RecordingError::EncodingUnsupported(
                "no WebM encoder available".to_string(),
            ));
        }
        let mut stats = self.stats.lock();
        stats.created += 1;
        stats.last_settings = Some(*settings);
        Ok(Box::new(RecordingEncoder {
            stats: self.stats.clone(),
            buffer: BytesMut::new(),
            silent: self.silent,
        }))
    }
}

pub const SCREEN: Resolution = Resolution::new(64, 36);

pub fn provider(devices: SyntheticDevices) -> Arc<SyntheticSourceProvider> {
    Arc::new(SyntheticSourceProvider::new(devices, SCREEN))
}

pub fn screen_and_mic() -> SyntheticDevices {
    SyntheticDevices {
        screen_permitted: true,
        webcam: false,
        microphone: true,
        system_audio: false,
    }
}

pub fn fast_settings() -> ControllerSettings {
    ControllerSettings {
        max_duration: Duration::from_secs(60),
        timeslice: Duration::from_millis(100),
        flush_timeout: Duration::from_millis(500),
    }
}

pub fn recording_config() -> RecordingConfig {
    RecordingConfig {
        frame_rate: 20,
        capture_system_audio: false,
        capture_microphone: true,
        capture_webcam: false,
        title: Some("Demo".to_string()),
        ..RecordingConfig::default()
    }
}

pub struct Harness {
    pub handle: CoordinatorHandle,
    pub supervisor: JoinHandle<()>,
}

pub fn coordinator(
    provider: Arc<SyntheticSourceProvider>,
    encoders: Arc<RecordingEncoderFactory>,
    settings: ControllerSettings,
    artifact_dir: &Path,
    uploader: Option<Arc<dyn ArtifactUploader>>,
) -> Harness {
    let (coordinator, requests) = RecordingCoordinator::new(
        provider,
        encoders,
        settings,
        CoordinatorSettings {
            artifact_dir: artifact_dir.to_path_buf(),
            auto_upload: true,
        },
        uploader,
    );
    let handle = coordinator.into_handle();
    let supervisor = spawn_supervisor(handle.clone(), requests);
    Harness { handle, supervisor }
}

/// Poll the status mirror until `done` holds or `timeout` passes
pub async fn wait_for(
    handle: &CoordinatorHandle,
    timeout: Duration,
    done: impl Fn(&StatusSnapshot) -> bool,
) -> StatusSnapshot {
    let reader = handle.lock().await.status_reader();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let snapshot = reader.snapshot();
        if done(&snapshot) || tokio::time::Instant::now() >= deadline {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn is_idle_with_artifact(snapshot: &StatusSnapshot) -> bool {
    snapshot.status == RecordingState::Idle && snapshot.last_artifact.is_some()
}
