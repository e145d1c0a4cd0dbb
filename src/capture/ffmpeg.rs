//! FFmpeg-backed capture devices
//!
//! Screen, webcam and audio devices are opened through FFmpeg's platform
//! input devices (x11grab/v4l2/pulse on Linux, avfoundation on macOS,
//! gdigrab/dshow on Windows). Each device runs as a child process that
//! writes raw RGBA frames or f32le samples to stdout; a reader thread keeps
//! the latest frame (video) or forwards sample blocks (audio).

use super::traits::{AudioChunk, AudioFormat, AudioSource, Resolution, VideoFrame, VideoSource};
use parking_lot::{Mutex, RwLock};
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Audio block length delivered by audio devices
const AUDIO_BLOCK_MS: u32 = 20;

/// An FFmpeg input device specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInput {
    /// FFmpeg demuxer (`-f`)
    pub format: String,
    /// Options placed before `-i`
    pub options: Vec<String>,
    /// The `-i` argument
    pub input: String,
}

impl DeviceInput {
    fn new(format: &str, options: &[String], input: impl Into<String>) -> Self {
        Self {
            format: format.to_string(),
            options: options.to_vec(),
            input: input.into(),
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-f".to_string(),
            self.format.clone(),
        ];
        args.extend(self.options.iter().cloned());
        args.push("-i".to_string());
        args.push(self.input.clone());
        args
    }
}

/// Screen grabbing input for the current platform
pub fn screen_input(display: Option<&str>, frame_rate: u32) -> DeviceInput {
    let fps = vec!["-framerate".to_string(), frame_rate.to_string()];

    #[cfg(target_os = "macos")]
    {
        let mut options = fps;
        options.extend(["-capture_cursor".to_string(), "1".to_string()]);
        DeviceInput::new("avfoundation", &options, format!("{}:none", display.unwrap_or("1")))
    }

    #[cfg(target_os = "windows")]
    {
        DeviceInput::new("gdigrab", &fps, display.unwrap_or("desktop"))
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        let display = display
            .map(str::to_string)
            .or_else(|| std::env::var("DISPLAY").ok())
            .unwrap_or_else(|| ":0.0".to_string());
        DeviceInput::new("x11grab", &fps, display)
    }
}

/// Webcam input for the current platform
pub fn webcam_input(device: Option<&str>) -> Option<DeviceInput> {
    #[cfg(target_os = "macos")]
    {
        let options = vec!["-framerate".to_string(), "30".to_string()];
        Some(DeviceInput::new("avfoundation", &options, format!("{}:none", device.unwrap_or("0"))))
    }

    #[cfg(target_os = "windows")]
    {
        // dshow needs a device name; there is no portable default
        device.map(|name| DeviceInput::new("dshow", &[], format!("video={name}")))
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        Some(DeviceInput::new("v4l2", &[], device.unwrap_or("/dev/video0")))
    }
}

/// Microphone input for the current platform
pub fn microphone_input(device: Option<&str>) -> Option<DeviceInput> {
    #[cfg(target_os = "macos")]
    {
        Some(DeviceInput::new("avfoundation", &[], format!(":{}", device.unwrap_or("0"))))
    }

    #[cfg(target_os = "windows")]
    {
        device.map(|name| DeviceInput::new("dshow", &[], format!("audio={name}")))
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        Some(DeviceInput::new("pulse", &[], device.unwrap_or("default")))
    }
}

/// System audio (loopback) input for the current platform
///
/// Only PulseAudio/PipeWire exposes a default monitor source; elsewhere a
/// loopback device must be configured explicitly.
pub fn system_audio_input(device: Option<&str>) -> Option<DeviceInput> {
    #[cfg(target_os = "macos")]
    {
        device.map(|name| DeviceInput::new("avfoundation", &[], format!(":{name}")))
    }

    #[cfg(target_os = "windows")]
    {
        device.map(|name| DeviceInput::new("dshow", &[], format!("audio={name}")))
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        Some(DeviceInput::new("pulse", &[], device.unwrap_or("@DEFAULT_MONITOR@")))
    }
}

/// A running FFmpeg device process
struct DeviceProcess {
    child: Mutex<Option<Child>>,
    stopping: Arc<AtomicBool>,
}

impl DeviceProcess {
    fn spawn(ffmpeg: &str, input: &DeviceInput, output_args: &[String]) -> std::io::Result<(Self, ChildStdout)> {
        let mut args = input.args();
        args.extend(output_args.iter().cloned());

        tracing::debug!("Spawning capture device: {} {}", ffmpeg, args.join(" "));

        let mut child = Command::new(ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("Failed to capture FFmpeg stdout"))?;

        Ok((
            Self {
                child: Mutex::new(Some(child)),
                stopping: Arc::new(AtomicBool::new(false)),
            },
            stdout,
        ))
    }

    fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Video device (screen or webcam) read through FFmpeg
pub struct FfmpegVideoSource {
    id: String,
    resolution: Resolution,
    latest: Arc<RwLock<Option<Arc<VideoFrame>>>>,
    active: Arc<AtomicBool>,
    ended: CancellationToken,
    process: DeviceProcess,
}

impl FfmpegVideoSource {
    /// Open the device, scaling its output to `resolution`
    pub fn open(
        ffmpeg: &str,
        id: &str,
        input: &DeviceInput,
        resolution: Resolution,
    ) -> std::io::Result<Self> {
        let output_args = vec![
            "-vf".to_string(),
            format!("scale={}:{}", resolution.width, resolution.height),
            "-pix_fmt".to_string(),
            "rgba".to_string(),
            "-f".to_string(),
            "rawvideo".to_string(),
            "-".to_string(),
        ];
        let (process, stdout) = DeviceProcess::spawn(ffmpeg, input, &output_args)?;

        let latest = Arc::new(RwLock::new(None));
        let active = Arc::new(AtomicBool::new(true));
        let ended = CancellationToken::new();

        let reader = VideoReader {
            id: id.to_string(),
            resolution,
            latest: latest.clone(),
            active: active.clone(),
            ended: ended.clone(),
            stopping: process.stopping.clone(),
        };
        std::thread::Builder::new()
            .name(format!("{id}-reader"))
            .spawn(move || reader.run(stdout))?;

        tracing::info!(
            "Opened {} capture via {} ({}x{})",
            id,
            input.format,
            resolution.width,
            resolution.height
        );

        Ok(Self {
            id: id.to_string(),
            resolution,
            latest,
            active,
            ended,
            process,
        })
    }

    /// Wait until the first frame arrives. A device that never produces a
    /// frame was refused or does not exist.
    pub async fn wait_first_frame(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.latest.read().is_some() {
                return true;
            }
            if !self.active.load(Ordering::SeqCst) {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.latest.read().is_some()
    }
}

struct VideoReader {
    id: String,
    resolution: Resolution,
    latest: Arc<RwLock<Option<Arc<VideoFrame>>>>,
    active: Arc<AtomicBool>,
    ended: CancellationToken,
    stopping: Arc<AtomicBool>,
}

impl VideoReader {
    fn run(self, mut stdout: ChildStdout) {
        let frame_len = self.resolution.rgba_frame_len();
        let started = Instant::now();
        let mut frames = 0u64;

        loop {
            let mut data = vec![0u8; frame_len];
            if stdout.read_exact(&mut data).is_err() {
                break;
            }
            frames += 1;
            *self.latest.write() = Some(Arc::new(VideoFrame {
                data,
                width: self.resolution.width,
                height: self.resolution.height,
                timestamp_ms: started.elapsed().as_secs_f64() * 1000.0,
            }));
        }

        self.active.store(false, Ordering::SeqCst);
        if self.stopping.load(Ordering::SeqCst) {
            tracing::debug!("{} reader finished after {} frames", self.id, frames);
        } else {
            tracing::warn!("{} capture ended unexpectedly after {} frames", self.id, frames);
            self.ended.cancel();
        }
    }
}

impl VideoSource for FfmpegVideoSource {
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
        self.process.stop();
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Audio device read through FFmpeg as interleaved f32le
pub struct FfmpegAudioSource {
    id: String,
    format: AudioFormat,
    stream: Mutex<Option<mpsc::UnboundedReceiver<AudioChunk>>>,
    active: Arc<AtomicBool>,
    first_block: Arc<AtomicBool>,
    process: DeviceProcess,
}

impl FfmpegAudioSource {
    pub fn open(ffmpeg: &str, id: &str, input: &DeviceInput, format: AudioFormat) -> std::io::Result<Self> {
        let output_args = vec![
            "-ac".to_string(),
            format.channels.to_string(),
            "-ar".to_string(),
            format.sample_rate.to_string(),
            "-f".to_string(),
            "f32le".to_string(),
            "-".to_string(),
        ];
        let (process, mut stdout) = DeviceProcess::spawn(ffmpeg, input, &output_args)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        let first_block = Arc::new(AtomicBool::new(false));

        let block_samples =
            (format.sample_rate * AUDIO_BLOCK_MS / 1000) as usize * format.channels as usize;
        let thread_active = active.clone();
        let thread_first = first_block.clone();
        let thread_id = id.to_string();
        std::thread::Builder::new()
            .name(format!("{id}-reader"))
            .spawn(move || {
                let mut buf = vec![0u8; block_samples * 4];
                while stdout.read_exact(&mut buf).is_ok() {
                    thread_first.store(true, Ordering::SeqCst);
                    let samples = buf
                        .chunks_exact(4)
                        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                        .collect();
                    if tx.send(AudioChunk::new(samples)).is_err() {
                        break;
                    }
                }
                thread_active.store(false, Ordering::SeqCst);
                tracing::debug!("{} audio reader finished", thread_id);
            })?;

        tracing::info!(
            "Opened {} capture via {} ({}Hz, {}ch)",
            id,
            input.format,
            format.sample_rate,
            format.channels
        );

        Ok(Self {
            id: id.to_string(),
            format,
            stream: Mutex::new(Some(rx)),
            active,
            first_block,
            process,
        })
    }

    /// Wait until the device delivers its first block of samples
    pub async fn wait_first_block(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.first_block.load(Ordering::SeqCst) {
                return true;
            }
            if !self.active.load(Ordering::SeqCst) {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.first_block.load(Ordering::SeqCst)
    }
}

impl AudioSource for FfmpegAudioSource {
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
        self.process.stop();
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Ask FFmpeg for the native frame size of `input` by decoding a single
/// frame into the null muxer and reading the stream banner.
pub async fn probe_resolution(ffmpeg: &str, input: &DeviceInput, timeout: Duration) -> Option<Resolution> {
    let mut args = vec!["-hide_banner".to_string(), "-f".to_string(), input.format.clone()];
    args.extend(input.options.iter().cloned());
    args.extend(
        ["-i", input.input.as_str(), "-frames:v", "1", "-f", "null", "-"]
            .iter()
            .map(|a| a.to_string()),
    );

    let output = tokio::process::Command::new(ffmpeg)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(timeout, output).await {
        Ok(Ok(output)) => parse_stream_resolution(&String::from_utf8_lossy(&output.stderr)),
        Ok(Err(e)) => {
            tracing::warn!("Failed to probe {} input: {}", input.format, e);
            None
        }
        Err(_) => {
            tracing::warn!("Probing {} input timed out", input.format);
            None
        }
    }
}

/// First `WxH` size announced on a `Video:` stream line of FFmpeg's log
pub fn parse_stream_resolution(stderr: &str) -> Option<Resolution> {
    stderr
        .lines()
        .filter_map(|line| line.split_once("Video:").map(|(_, rest)| rest))
        .flat_map(|rest| rest.split([',', ' ']))
        .find_map(|token| {
            let (width, height) = token.trim().split_once('x')?;
            let width: u32 = width.parse().ok()?;
            let height: u32 = height.parse().ok()?;
            (width > 0 && height > 0).then(|| Resolution::new(width, height))
        })
}
