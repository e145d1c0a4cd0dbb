//! Media source adapters
//!
//! Acquires screen video (plus optional system audio), webcam video and
//! microphone audio. Only the screen is required; the other sources degrade
//! to absent when they cannot be opened.

pub mod ffmpeg;
pub mod synthetic;
pub mod traits;

pub use traits::{
    AudioChunk, AudioFormat, AudioSource, Resolution, VideoFrame, VideoSource, FALLBACK_RESOLUTION,
};

use crate::recorder::error::{RecordingError, RecordingResult};
use crate::recorder::state::{RecordingConfig, SourceFlags};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// The screen source, with system audio when it could be captured alongside
pub struct ScreenCapture {
    pub video: Arc<dyn VideoSource>,
    pub system_audio: Option<Arc<dyn AudioSource>>,
}

/// Acquires the individual sources for a recording
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Fails with `PermissionDenied` when the screen cannot be captured
    async fn acquire_screen(&self, config: &RecordingConfig) -> RecordingResult<ScreenCapture>;

    async fn acquire_webcam(&self, config: &RecordingConfig) -> RecordingResult<Arc<dyn VideoSource>>;

    async fn acquire_microphone(&self, config: &RecordingConfig) -> RecordingResult<Arc<dyn AudioSource>>;
}

/// Every source handle held for one recording
pub struct AcquiredSources {
    pub screen: Arc<dyn VideoSource>,
    pub system_audio: Option<Arc<dyn AudioSource>>,
    pub webcam: Option<Arc<dyn VideoSource>>,
    pub microphone: Option<Arc<dyn AudioSource>>,
}

impl AcquiredSources {
    pub fn flags(&self) -> SourceFlags {
        SourceFlags {
            screen: true,
            webcam: self.webcam.is_some(),
            microphone: self.microphone.is_some(),
            system_audio: self.system_audio.is_some(),
        }
    }

    /// Stop every live track
    pub fn release_all(&self) {
        self.screen.stop();
        if let Some(webcam) = &self.webcam {
            webcam.stop();
        }
        if let Some(mic) = &self.microphone {
            mic.stop();
        }
        if let Some(system) = &self.system_audio {
            system.stop();
        }
        tracing::debug!("Released all capture sources");
    }
}

/// Acquire the sources a recording asks for.
///
/// Screen failure is fatal. Webcam and microphone failures are logged and the
/// recording proceeds without them.
pub async fn acquire_sources(
    provider: &dyn SourceProvider,
    config: &RecordingConfig,
) -> RecordingResult<AcquiredSources> {
    let screen = provider.acquire_screen(config).await?;

    let webcam = if config.capture_webcam {
        match provider.acquire_webcam(config).await {
            Ok(source) => Some(source),
            Err(e) => {
                tracing::warn!("Webcam unavailable, continuing without it: {}", e);
                None
            }
        }
    } else {
        None
    };

    let microphone = if config.capture_microphone {
        match provider.acquire_microphone(config).await {
            Ok(source) => Some(source),
            Err(e) => {
                tracing::warn!("Microphone unavailable, continuing without it: {}", e);
                None
            }
        }
    } else {
        None
    };

    let sources = AcquiredSources {
        screen: screen.video,
        system_audio: screen.system_audio,
        webcam,
        microphone,
    };

    tracing::info!("Acquired sources: {:?}", sources.flags());
    Ok(sources)
}

/// How long a device may take to produce its first frame or sample block
const FIRST_DATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Source provider that opens real devices through FFmpeg
pub struct FfmpegSourceProvider {
    ffmpeg: String,
    audio_format: AudioFormat,
}

impl FfmpegSourceProvider {
    pub fn new(ffmpeg: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            audio_format: AudioFormat::default(),
        }
    }

    async fn open_audio(
        &self,
        id: &str,
        input: Option<ffmpeg::DeviceInput>,
    ) -> RecordingResult<Arc<dyn AudioSource>> {
        let input = input.ok_or_else(|| {
            RecordingError::SourceUnavailable(format!("No {id} device configured"))
        })?;
        let source = ffmpeg::FfmpegAudioSource::open(&self.ffmpeg, id, &input, self.audio_format)
            .map_err(|e| RecordingError::SourceUnavailable(format!("Failed to open {id}: {e}")))?;
        if !source.wait_first_block(FIRST_DATA_TIMEOUT).await {
            source.stop();
            return Err(RecordingError::SourceUnavailable(format!(
                "{id} produced no audio"
            )));
        }
        Ok(Arc::new(source))
    }
}

#[async_trait]
impl SourceProvider for FfmpegSourceProvider {
    async fn acquire_screen(&self, config: &RecordingConfig) -> RecordingResult<ScreenCapture> {
        let input = ffmpeg::screen_input(config.display.as_deref(), config.frame_rate);
        let resolution = match (config.screen_width, config.screen_height) {
            (Some(width), Some(height)) => Resolution::new(width, height),
            _ => match ffmpeg::probe_resolution(&self.ffmpeg, &input, FIRST_DATA_TIMEOUT).await {
                Some(native) => {
                    tracing::info!("Screen reports {}x{}", native.width, native.height);
                    native
                }
                None => {
                    tracing::warn!(
                        "Could not determine the screen size, capturing at {}x{}",
                        FALLBACK_RESOLUTION.width,
                        FALLBACK_RESOLUTION.height
                    );
                    FALLBACK_RESOLUTION
                }
            },
        };

        let video = ffmpeg::FfmpegVideoSource::open(&self.ffmpeg, "screen", &input, resolution)
            .map_err(|e| RecordingError::PermissionDenied(format!("Failed to start screen capture: {e}")))?;
        if !video.wait_first_frame(FIRST_DATA_TIMEOUT).await {
            video.stop();
            return Err(RecordingError::PermissionDenied(
                "Screen capture was refused or produced no frames".to_string(),
            ));
        }

        let system_audio = if config.capture_system_audio {
            let input = ffmpeg::system_audio_input(config.system_audio_device_id.as_deref());
            match self.open_audio("system-audio", input).await {
                Ok(source) => Some(source),
                Err(e) => {
                    tracing::warn!("System audio unavailable, continuing without it: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(ScreenCapture {
            video: Arc::new(video),
            system_audio,
        })
    }

    async fn acquire_webcam(&self, config: &RecordingConfig) -> RecordingResult<Arc<dyn VideoSource>> {
        let input = ffmpeg::webcam_input(config.webcam_device_id.as_deref())
            .ok_or_else(|| RecordingError::SourceUnavailable("No webcam device configured".to_string()))?;
        // Default to 640x480 for the webcam; the inset is far smaller
        let video = ffmpeg::FfmpegVideoSource::open(&self.ffmpeg, "webcam", &input, Resolution::new(640, 480))
            .map_err(|e| RecordingError::SourceUnavailable(format!("Failed to open webcam: {e}")))?;
        if !video.wait_first_frame(FIRST_DATA_TIMEOUT).await {
            video.stop();
            return Err(RecordingError::SourceUnavailable(
                "Webcam produced no frames".to_string(),
            ));
        }
        Ok(Arc::new(video))
    }

    async fn acquire_microphone(&self, config: &RecordingConfig) -> RecordingResult<Arc<dyn AudioSource>> {
        let input = ffmpeg::microphone_input(config.microphone_device_id.as_deref());
        self.open_audio("microphone", input).await
    }
}

#[cfg(test)]
mod tests {
    use super::synthetic::{SyntheticDevices, SyntheticSourceProvider};
    use super::*;

    fn config(webcam: bool, mic: bool) -> RecordingConfig {
        RecordingConfig {
            capture_webcam: webcam,
            capture_microphone: mic,
            capture_system_audio: false,
            ..RecordingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_screen_refusal_is_fatal() {
        let provider = SyntheticSourceProvider::new(
            SyntheticDevices {
                screen_permitted: false,
                ..SyntheticDevices::default()
            },
            Resolution::new(64, 36),
        );
        let result = acquire_sources(&provider, &config(true, true)).await;
        assert!(matches!(result, Err(RecordingError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_optional_sources_degrade() {
        let provider = SyntheticSourceProvider::new(
            SyntheticDevices {
                webcam: false,
                microphone: false,
                ..SyntheticDevices::default()
            },
            Resolution::new(64, 36),
        );
        let sources = acquire_sources(&provider, &config(true, true)).await.unwrap();
        let flags = sources.flags();
        assert!(flags.screen);
        assert!(!flags.webcam);
        assert!(!flags.microphone);
        sources.release_all();
        assert!(!sources.screen.is_active());
    }

    #[tokio::test]
    async fn test_unrequested_sources_are_not_opened() {
        let provider = SyntheticSourceProvider::default();
        let sources = acquire_sources(&provider, &config(false, false)).await.unwrap();
        assert!(sources.webcam.is_none());
        assert!(sources.microphone.is_none());
        assert!(sources.system_audio.is_none());
        sources.release_all();
    }
}
