//! Recording system module
//!
//! - `controller`: capture/encode state machine over one recording
//! - `coordinator`: long-lived owner of the session, artifact storage and upload
//! - `encoder`: the `MediaEncoder` seam and its FFmpeg WebM implementation

pub mod controller;
pub mod coordinator;
pub mod encoder;
pub mod error;
pub mod state;

pub use controller::{CaptureController, ControllerSettings, ControllerSignal, RecordingArtifact, StopRequest};
pub use coordinator::{
    spawn_supervisor, CoordinatorHandle, CoordinatorSettings, RecordingCoordinator, RecordingEvent,
    StatusReader,
};
pub use encoder::{EncoderFactory, EncoderSettings, FfmpegEncoderFactory, MediaEncoder};
pub use error::{RecordingError, RecordingResult};
pub use state::{RecordingConfig, RecordingState, StatusSnapshot, StoredArtifact, UploadStatus};
