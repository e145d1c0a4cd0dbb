//! Media encoder
//!
//! The controller feeds composed frames and mixed audio into a `MediaEncoder`
//! and periodically pulls whatever encoded bytes are ready. The production
//! encoder is an FFmpeg subprocess producing WebM: raw RGBA frames go in on
//! stdin, interleaved f32 PCM over a loopback TCP socket, and the muxed
//! stream comes back on stdout.

use crate::capture::{AudioChunk, AudioFormat, Resolution, VideoFrame};
use crate::recorder::error::{RecordingError, RecordingResult};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Media type of every artifact this crate produces
pub const WEBM_MIME_TYPE: &str = "video/webm";

/// Frames buffered between the pump and the FFmpeg writer
const VIDEO_QUEUE_DEPTH: usize = 8;
/// Audio blocks buffered between the pump and the socket writer
const AUDIO_QUEUE_DEPTH: usize = 256;
const AUDIO_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// What the encoder is asked to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub resolution: Resolution,
    pub frame_rate: u32,
    /// `None` when the combined stream carries no audio track
    pub audio: Option<AudioFormat>,
}

/// An encoder instance bound to one recording
pub trait MediaEncoder: Send {
    fn mime_type(&self) -> &str;

    /// Queue a frame. Must not block; a frame may be dropped under load.
    fn write_video(&mut self, frame: Arc<VideoFrame>) -> RecordingResult<()>;

    /// Queue interleaved samples. Must not block.
    fn write_audio(&mut self, chunk: AudioChunk) -> RecordingResult<()>;

    /// Encoded bytes produced since the previous call (may be empty)
    fn request_data(&mut self) -> Bytes;

    /// Close the inputs and wait for the encoder to drain. Returns the bytes
    /// not yet handed out by `request_data`. Blocking.
    fn finish(self: Box<Self>) -> RecordingResult<Bytes>;
}

/// Creates encoders for new recordings
pub trait EncoderFactory: Send + Sync {
    fn create(&self, settings: &EncoderSettings) -> RecordingResult<Box<dyn MediaEncoder>>;
}

/// Codec pair chosen for the WebM container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecChoice {
    pub video: &'static str,
    pub audio: &'static str,
}

/// Pick VP9 (falling back to VP8) with Opus (falling back to Vorbis) from the
/// output of `ffmpeg -encoders`.
pub fn select_codecs(encoders: &str) -> RecordingResult<CodecChoice> {
    let available: Vec<&str> = encoders
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .collect();
    let has = |name: &str| available.contains(&name);

    let video = ["libvpx-vp9", "libvpx"]
        .into_iter()
        .find(|c| has(c))
        .ok_or_else(|| RecordingError::EncodingUnsupported("neither VP9 nor VP8 is available".to_string()))?;
    let audio = ["libopus", "libvorbis"]
        .into_iter()
        .find(|c| has(c))
        .ok_or_else(|| RecordingError::EncodingUnsupported("neither Opus nor Vorbis is available".to_string()))?;

    Ok(CodecChoice { video, audio })
}

/// Build the FFmpeg argument list for one recording
pub fn encoder_args(settings: &EncoderSettings, codecs: &CodecChoice, audio_port: Option<u16>) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgba".into(),
        "-s".into(),
        format!("{}x{}", settings.resolution.width, settings.resolution.height),
        "-r".into(),
        settings.frame_rate.to_string(),
        "-i".into(),
        "pipe:0".into(),
    ];

    if let (Some(format), Some(port)) = (settings.audio, audio_port) {
        args.extend([
            "-f".into(),
            "f32le".into(),
            "-ar".into(),
            format.sample_rate.to_string(),
            "-ac".into(),
            format.channels.to_string(),
            "-i".into(),
            format!("tcp://127.0.0.1:{port}"),
        ]);
    }

    args.extend([
        "-c:v".into(),
        codecs.video.to_string(),
        "-deadline".into(),
        "realtime".into(),
        "-cpu-used".into(),
        "8".into(),
        "-b:v".into(),
        "2500k".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
    ]);

    if settings.audio.is_some() && audio_port.is_some() {
        args.extend([
            "-c:a".into(),
            codecs.audio.to_string(),
            "-b:a".into(),
            "128k".into(),
        ]);
    } else {
        args.push("-an".into());
    }

    args.extend(["-f".into(), "webm".into(), "pipe:1".into()]);
    args
}

/// Factory for FFmpeg WebM encoders. Codec support is probed once.
pub struct FfmpegEncoderFactory {
    ffmpeg: String,
    codecs: Mutex<Option<CodecChoice>>,
}

impl FfmpegEncoderFactory {
    pub fn new(ffmpeg: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            codecs: Mutex::new(None),
        }
    }

    fn codecs(&self) -> RecordingResult<CodecChoice> {
        let mut cached = self.codecs.lock();
        if let Some(codecs) = cached.as_ref() {
            return Ok(codecs.clone());
        }

        let output = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-encoders"])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                RecordingError::EncodingUnsupported(format!("Failed to run {}: {}", self.ffmpeg, e))
            })?;
        let codecs = select_codecs(&String::from_utf8_lossy(&output.stdout))?;
        tracing::info!("Using {} + {} in WebM", codecs.video, codecs.audio);
        *cached = Some(codecs.clone());
        Ok(codecs)
    }
}

impl EncoderFactory for FfmpegEncoderFactory {
    fn create(&self, settings: &EncoderSettings) -> RecordingResult<Box<dyn MediaEncoder>> {
        let codecs = self.codecs()?;
        Ok(Box::new(FfmpegEncoder::spawn(&self.ffmpeg, settings, &codecs)?))
    }
}

/// A running FFmpeg WebM encoder
pub struct FfmpegEncoder {
    process: Child,
    video_tx: Option<SyncSender<Arc<VideoFrame>>>,
    audio_tx: Option<SyncSender<AudioChunk>>,
    video_writer: Option<JoinHandle<()>>,
    audio_writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    output: Arc<Mutex<BytesMut>>,
    dropped_frames: u64,
}

impl FfmpegEncoder {
    pub fn spawn(ffmpeg: &str, settings: &EncoderSettings, codecs: &CodecChoice) -> RecordingResult<Self> {
        let audio_listener = match settings.audio {
            Some(_) => Some(TcpListener::bind("127.0.0.1:0")?),
            None => None,
        };
        let audio_port = match &audio_listener {
            Some(listener) => Some(listener.local_addr()?.port()),
            None => None,
        };

        let args = encoder_args(settings, codecs, audio_port);
        tracing::info!("Starting FFmpeg encoder: {:?}", args);

        let mut process = Command::new(ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RecordingError::EncodingError(format!("Failed to start FFmpeg encoder: {}", e)))?;

        let mut stdin = process
            .stdin
            .take()
            .ok_or_else(|| RecordingError::EncodingError("Failed to capture FFmpeg stdin".to_string()))?;
        let mut stdout = process
            .stdout
            .take()
            .ok_or_else(|| RecordingError::EncodingError("Failed to capture FFmpeg stdout".to_string()))?;

        let (video_tx, video_rx) = sync_channel::<Arc<VideoFrame>>(VIDEO_QUEUE_DEPTH);
        let video_writer = std::thread::Builder::new()
            .name("encoder-video".into())
            .spawn(move || {
                for frame in video_rx {
                    if let Err(e) = stdin.write_all(&frame.data) {
                        tracing::error!("Failed to write frame to encoder: {}", e);
                        break;
                    }
                }
                // stdin dropped here; FFmpeg sees EOF on the video input
            })?;

        let (audio_tx, audio_writer) = match audio_listener {
            Some(listener) => {
                let (tx, rx) = sync_channel::<AudioChunk>(AUDIO_QUEUE_DEPTH);
                let handle = std::thread::Builder::new()
                    .name("encoder-audio".into())
                    .spawn(move || write_audio_socket(listener, rx))?;
                (Some(tx), Some(handle))
            }
            None => (None, None),
        };

        let output = Arc::new(Mutex::new(BytesMut::new()));
        let sink = output.clone();
        let reader = std::thread::Builder::new()
            .name("encoder-output".into())
            .spawn(move || {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match stdout.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => sink.lock().extend_from_slice(&buf[..n]),
                        Err(e) => {
                            tracing::error!("Failed to read encoder output: {}", e);
                            break;
                        }
                    }
                }
            })?;

        Ok(Self {
            process,
            video_tx: Some(video_tx),
            audio_tx,
            video_writer: Some(video_writer),
            audio_writer,
            reader: Some(reader),
            output,
            dropped_frames: 0,
        })
    }
}

fn write_audio_socket(listener: TcpListener, rx: Receiver<AudioChunk>) {
    let mut socket = match accept_with_timeout(&listener, AUDIO_CONNECT_TIMEOUT) {
        Ok(socket) => socket,
        Err(e) => {
            tracing::error!("Encoder never connected to the audio input: {}", e);
            return;
        }
    };
    for chunk in rx {
        if let Err(e) = socket.write_all(&chunk.to_le_bytes()) {
            tracing::error!("Failed to write audio to encoder: {}", e);
            break;
        }
    }
}

fn accept_with_timeout(listener: &TcpListener, timeout: Duration) -> std::io::Result<TcpStream> {
    listener.set_nonblocking(true)?;
    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((socket, _)) => {
                socket.set_nonblocking(false)?;
                return Ok(socket);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "accept timed out"));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(e),
        }
    }
}

impl MediaEncoder for FfmpegEncoder {
    fn mime_type(&self) -> &str {
        WEBM_MIME_TYPE
    }

    fn write_video(&mut self, frame: Arc<VideoFrame>) -> RecordingResult<()> {
        let Some(tx) = &self.video_tx else {
            return Err(RecordingError::EncodingError("Encoder already finished".to_string()));
        };
        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped_frames += 1;
                if self.dropped_frames % 30 == 1 {
                    tracing::warn!("Encoder falling behind, {} frames dropped", self.dropped_frames);
                }
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(RecordingError::EncodingError("Encoder video input closed".to_string()))
            }
        }
    }

    fn write_audio(&mut self, chunk: AudioChunk) -> RecordingResult<()> {
        let Some(tx) = &self.audio_tx else {
            return Ok(());
        };
        match tx.try_send(chunk) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Disconnected(_)) => {
                Err(RecordingError::EncodingError("Encoder audio input closed".to_string()))
            }
        }
    }

    fn request_data(&mut self) -> Bytes {
        self.output.lock().split().freeze()
    }

    fn finish(mut self: Box<Self>) -> RecordingResult<Bytes> {
        self.video_tx.take();
        self.audio_tx.take();
        for handle in [self.video_writer.take(), self.audio_writer.take()].into_iter().flatten() {
            let _ = handle.join();
        }

        let status = self.process.wait()?;
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }

        let remaining = self.output.lock().split().freeze();
        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut pipe) = self.process.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            tracing::error!("FFmpeg encoder exited with {}: {}", status, stderr.trim());
            if remaining.is_empty() {
                return Err(RecordingError::EncodingError(format!(
                    "FFmpeg exited with {}: {}",
                    status,
                    stderr.trim()
                )));
            }
        }

        tracing::info!("Encoder finished ({} frames dropped)", self.dropped_frames);
        Ok(remaining)
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        if self.video_tx.is_some() {
            let _ = self.process.kill();
        }
    }
}
