//! Recording state management
//!
//! Defines the recording state machine and session tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

/// Current state of the recording system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    /// No recording in progress
    #[default]
    Idle,
    /// Acquiring sources and starting the encoder
    Requesting,
    /// Currently recording
    Recording,
    /// Recording is paused
    Paused,
    /// Flushing the encoder and assembling the artifact
    Finalizing,
    /// The last start or stop failed
    Error,
}

impl RecordingState {
    /// Whether a capture is in flight (a new start must be rejected)
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RecordingState::Requesting
                | RecordingState::Recording
                | RecordingState::Paused
                | RecordingState::Finalizing
        )
    }
}

/// Which sources a session was started with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFlags {
    /// Always true; the screen is required
    pub screen: bool,
    pub webcam: bool,
    pub microphone: bool,
    pub system_audio: bool,
}

/// Configuration for starting a recording
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordingConfig {
    /// Display to capture (X11 display name, avfoundation screen index, ...)
    pub display: Option<String>,

    /// Override for the screen size when the platform cannot report it
    pub screen_width: Option<u32>,
    pub screen_height: Option<u32>,

    /// Output frame rate of the composed stream
    pub frame_rate: u32,

    /// Whether to capture system audio
    pub capture_system_audio: bool,

    /// System audio device (loopback/monitor) to use
    pub system_audio_device_id: Option<String>,

    /// Whether to capture microphone
    pub capture_microphone: bool,

    /// Microphone device ID (if capturing)
    pub microphone_device_id: Option<String>,

    /// Whether to capture webcam
    pub capture_webcam: bool,

    /// Webcam device ID (if capturing)
    pub webcam_device_id: Option<String>,

    /// Title attached to the shared recording
    pub title: Option<String>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            display: None,
            screen_width: None,
            screen_height: None,
            frame_rate: 30,
            capture_system_audio: true,
            system_audio_device_id: None,
            capture_microphone: true,
            microphone_device_id: None,
            capture_webcam: false,
            webcam_device_id: None,
            title: None,
        }
    }
}

/// The live capture session, owned by the coordinator.
///
/// Created on a start request, dropped on finalize or abort.
#[derive(Debug, Clone)]
pub struct CaptureSession {
    pub source_flags: SourceFlags,
    pub status: RecordingState,
    pub started_at: DateTime<Utc>,
    pub title: Option<String>,
    started: Instant,
    accumulated_pause: Duration,
    paused_since: Option<Instant>,
}

impl CaptureSession {
    /// Create a new session starting now
    pub fn new(source_flags: SourceFlags, title: Option<String>) -> Self {
        Self {
            source_flags,
            status: RecordingState::Requesting,
            started_at: Utc::now(),
            title,
            started: Instant::now(),
            accumulated_pause: Duration::ZERO,
            paused_since: None,
        }
    }

    /// Mark the moment the encoder actually started
    pub fn begin_recording(&mut self) {
        self.started = Instant::now();
        self.started_at = Utc::now();
        self.status = RecordingState::Recording;
    }

    /// Enter the paused sub-state. Returns false if already paused.
    pub fn pause(&mut self) -> bool {
        if self.paused_since.is_some() {
            return false;
        }
        self.paused_since = Some(Instant::now());
        self.status = RecordingState::Paused;
        true
    }

    /// Leave the paused sub-state. Returns false if not paused.
    pub fn resume(&mut self) -> bool {
        let Some(since) = self.paused_since.take() else {
            return false;
        };
        self.accumulated_pause += since.elapsed();
        self.status = RecordingState::Recording;
        true
    }

    /// Time paused so far, including an ongoing pause
    pub fn paused_duration(&self) -> Duration {
        self.accumulated_pause
            + self
                .paused_since
                .map(|since| since.elapsed())
                .unwrap_or(Duration::ZERO)
    }

    /// Completed pauses only
    pub fn accumulated_pause(&self) -> Duration {
        self.accumulated_pause
    }

    /// Recording time, excluding paused intervals
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed().saturating_sub(self.paused_duration())
    }

    pub fn is_paused(&self) -> bool {
        self.paused_since.is_some()
    }
}

/// A finalized artifact kept on local disk until its upload succeeds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub byte_size: u64,
    pub duration_seconds: f64,
    pub chunk_count: usize,
    pub title: Option<String>,
}

/// Upload progress of the last artifact
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum UploadStatus {
    #[default]
    Idle,
    Uploading {
        percent: f64,
    },
    #[serde(rename_all = "camelCase")]
    Uploaded {
        share_url: String,
        share_token: String,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        message: String,
        artifact_path: PathBuf,
    },
}

/// What the UI needs to rebuild its view after reattaching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub status: RecordingState,
    pub is_recording: bool,
    pub is_paused: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub accumulated_pause_seconds: f64,
    pub elapsed_seconds: f64,
    pub sources: Option<SourceFlags>,
    pub last_error: Option<String>,
    pub last_artifact: Option<StoredArtifact>,
    pub upload: UploadStatus,
}

impl StatusSnapshot {
    /// Elapsed time as a UI would derive it from the coordinator's start time,
    /// given the current wall clock.
    pub fn derived_elapsed(&self, now: DateTime<Utc>) -> Duration {
        let Some(start) = self.start_time else {
            return Duration::ZERO;
        };
        let wall = (now - start).to_std().unwrap_or(Duration::ZERO);
        let paused = if self.is_paused {
            // The coordinator's view already includes the ongoing pause.
            Duration::from_secs_f64((wall.as_secs_f64() - self.elapsed_seconds).max(0.0))
        } else {
            Duration::from_secs_f64(self.accumulated_pause_seconds)
        };
        wall.saturating_sub(paused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags() -> SourceFlags {
        SourceFlags {
            screen: true,
            webcam: false,
            microphone: true,
            system_audio: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_excludes_pauses() {
        let mut session = CaptureSession::new(flags(), None);
        session.begin_recording();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(session.pause());
        assert!(!session.pause());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(session.elapsed(), Duration::from_secs(10));

        assert!(session.resume());
        assert!(!session.resume());
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(session.elapsed(), Duration::from_secs(13));
        assert_eq!(session.accumulated_pause(), Duration::from_secs(5));
        assert_eq!(session.status, RecordingState::Recording);
    }

    #[test]
    fn test_active_states() {
        assert!(!RecordingState::Idle.is_active());
        assert!(!RecordingState::Error.is_active());
        assert!(RecordingState::Recording.is_active());
        assert!(RecordingState::Finalizing.is_active());
    }

    #[test]
    fn test_derived_elapsed_subtracts_pause() {
        let now = Utc::now();
        let snapshot = StatusSnapshot {
            status: RecordingState::Recording,
            is_recording: true,
            is_paused: false,
            start_time: Some(now - chrono::Duration::seconds(60)),
            accumulated_pause_seconds: 15.0,
            elapsed_seconds: 45.0,
            sources: Some(flags()),
            last_error: None,
            last_artifact: None,
            upload: UploadStatus::Idle,
        };
        assert_eq!(snapshot.derived_elapsed(now).as_secs(), 45);
    }
}
