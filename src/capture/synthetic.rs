//! Synthetic capture sources
//!
//! Test-pattern video and tone audio, used for dry runs of the daemon
//! (`capture.backend = "synthetic"`) and by the test suite.

use super::traits::{AudioChunk, AudioFormat, AudioSource, Resolution, VideoFrame, VideoSource};
use super::{ScreenCapture, SourceProvider};
use crate::recorder::error::{RecordingError, RecordingResult};
use crate::recorder::state::RecordingConfig;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A video source that renders a moving gradient
pub struct SyntheticVideoSource {
    id: String,
    resolution: Resolution,
    latest: Arc<RwLock<Option<Arc<VideoFrame>>>>,
    active: Arc<AtomicBool>,
    ended: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyntheticVideoSource {
    /// Start producing frames with a base colour. Must be called inside a
    /// Tokio runtime.
    pub fn start(id: &str, resolution: Resolution, frame_rate: u32, base: [u8; 3]) -> Arc<Self> {
        let latest = Arc::new(RwLock::new(None));
        let active = Arc::new(AtomicBool::new(true));

        let frame_slot = latest.clone();
        let running = active.clone();
        let interval = Duration::from_secs_f64(1.0 / frame_rate.max(1) as f64);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut n: u64 = 0;
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let frame = render_pattern(resolution, base, n, interval);
                *frame_slot.write() = Some(Arc::new(frame));
                n += 1;
            }
        });

        Arc::new(Self {
            id: id.to_string(),
            resolution,
            latest,
            active,
            ended: CancellationToken::new(),
            task: Mutex::new(Some(task)),
        })
    }

    /// Simulate the user revoking the share out-of-band
    pub fn end_share(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.ended.cancel();
    }
}

fn render_pattern(resolution: Resolution, base: [u8; 3], n: u64, interval: Duration) -> VideoFrame {
    let mut frame = VideoFrame::black(resolution);
    let shift = (n % 256) as u32;
    for y in 0..resolution.height {
        for x in 0..resolution.width {
            let idx = ((y * resolution.width + x) * 4) as usize;
            frame.data[idx] = base[0].wrapping_add(((x + shift) % 256) as u8);
            frame.data[idx + 1] = base[1].wrapping_add((y % 256) as u8);
            frame.data[idx + 2] = base[2];
        }
    }
    frame.timestamp_ms = n as f64 * interval.as_secs_f64() * 1000.0;
    frame
}

impl VideoSource for SyntheticVideoSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn resolution(&self) -> Option<Resolution> {
        Some(self.resolution)
    }

    fn latest_frame(&self) -> Option<Arc<VideoFrame>> {
        self.latest.read().clone()
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn ended(&self) -> CancellationToken {
        self.ended.clone()
    }

    fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// An audio source producing a constant-amplitude square tone
pub struct SyntheticAudioSource {
    id: String,
    format: AudioFormat,
    stream: Mutex<Option<mpsc::UnboundedReceiver<AudioChunk>>>,
    active: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyntheticAudioSource {
    pub fn start(id: &str, format: AudioFormat, amplitude: f32) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        let running = active.clone();

        let block = (format.sample_rate / 50) as usize * format.channels as usize;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(20));
            let mut phase = false;
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                phase = !phase;
                let value = if phase { amplitude } else { -amplitude };
                if tx.send(AudioChunk::new(vec![value; block])).is_err() {
                    break;
                }
            }
        });

        Arc::new(Self {
            id: id.to_string(),
            format,
            stream: Mutex::new(Some(rx)),
            active,
            task: Mutex::new(Some(task)),
        })
    }
}

impl AudioSource for SyntheticAudioSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn format(&self) -> AudioFormat {
        self.format
    }

    fn take_stream(&self) -> Option<mpsc::UnboundedReceiver<AudioChunk>> {
        self.stream.lock().take()
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// Which synthetic devices are "present"
#[derive(Debug, Clone, Copy)]
pub struct SyntheticDevices {
    pub screen_permitted: bool,
    pub webcam: bool,
    pub microphone: bool,
    pub system_audio: bool,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self {
            screen_permitted: true,
            webcam: true,
            microphone: true,
            system_audio: true,
        }
    }
}

/// Source provider backed by synthetic devices
pub struct SyntheticSourceProvider {
    devices: SyntheticDevices,
    screen_size: Resolution,
    last_screen: Mutex<Option<Arc<SyntheticVideoSource>>>,
}

impl SyntheticSourceProvider {
    pub fn new(devices: SyntheticDevices, screen_size: Resolution) -> Self {
        Self {
            devices,
            screen_size,
            last_screen: Mutex::new(None),
        }
    }

    /// The most recently acquired screen, for simulating share revocation
    pub fn last_screen(&self) -> Option<Arc<SyntheticVideoSource>> {
        self.last_screen.lock().clone()
    }
}

impl Default for SyntheticSourceProvider {
    fn default() -> Self {
        Self::new(SyntheticDevices::default(), Resolution::new(320, 180))
    }
}

#[async_trait]
impl SourceProvider for SyntheticSourceProvider {
    async fn acquire_screen(&self, config: &RecordingConfig) -> RecordingResult<ScreenCapture> {
        if !self.devices.screen_permitted {
            return Err(RecordingError::PermissionDenied(
                "Screen sharing was refused".to_string(),
            ));
        }
        let video = SyntheticVideoSource::start("screen", self.screen_size, config.frame_rate, [16, 32, 64]);
        *self.last_screen.lock() = Some(video.clone());

        let system_audio: Option<Arc<dyn AudioSource>> =
            if config.capture_system_audio && self.devices.system_audio {
                Some(SyntheticAudioSource::start("system-audio", AudioFormat::default(), 0.25))
            } else {
                None
            };

        Ok(ScreenCapture {
            video,
            system_audio,
        })
    }

    async fn acquire_webcam(&self, config: &RecordingConfig) -> RecordingResult<Arc<dyn VideoSource>> {
        if !self.devices.webcam {
            return Err(RecordingError::SourceUnavailable("No camera present".to_string()));
        }
        Ok(SyntheticVideoSource::start(
            "webcam",
            Resolution::new(160, 120),
            config.frame_rate,
            [200, 100, 50],
        ))
    }

    async fn acquire_microphone(&self, _config: &RecordingConfig) -> RecordingResult<Arc<dyn AudioSource>> {
        if !self.devices.microphone {
            return Err(RecordingError::SourceUnavailable(
                "Microphone access denied".to_string(),
            ));
        }
        Ok(SyntheticAudioSource::start("microphone", AudioFormat::default(), 0.5))
    }
}
