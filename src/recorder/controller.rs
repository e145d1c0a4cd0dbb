//! Capture/encode controller
//!
//! Drives one encoder over the composed video and mixed audio, collects the
//! encoded output in timeslice chunks and assembles the final artifact.
//!
//! State machine: `Idle -> Requesting -> Recording <-> Paused -> Finalizing
//! -> Idle | Error`.

use super::encoder::{EncoderFactory, EncoderSettings, MediaEncoder};
use super::error::{RecordingError, RecordingResult};
use super::state::{CaptureSession, RecordingConfig, RecordingState};
use crate::audio;
use crate::capture::{
    acquire_sources, AcquiredSources, AudioSource, Resolution, SourceProvider, VideoFrame,
    VideoSource, FALLBACK_RESOLUTION,
};
use crate::compositor::{overlay, Compositor, DEFAULT_DRAW_RATE};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Tunables for the controller
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Recording time (excluding pauses) after which the controller asks to stop
    pub max_duration: Duration,
    /// Period at which encoded output is collected into a chunk
    pub timeslice: Duration,
    /// Upper bound on waiting for the encoder to drain on stop
    pub flush_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(420),
            timeslice: Duration::from_millis(1000),
            flush_timeout: Duration::from_millis(2000),
        }
    }
}

/// Conditions under which the controller wants to be stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerSignal {
    /// Elapsed recording time reached the ceiling
    MaxDurationReached,
    /// The user revoked screen sharing out-of-band
    ScreenShareEnded,
}

/// A stop the controller asks its owner to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopRequest {
    /// Capture the request belongs to; stale requests must be ignored
    pub capture_id: u64,
    pub reason: ControllerSignal,
}

/// The finalized recording
#[derive(Debug, Clone)]
pub struct RecordingArtifact {
    pub data: Bytes,
    pub mime_type: String,
    pub duration: Duration,
    pub chunk_count: usize,
    pub title: Option<String>,
}

type SharedEncoder = Arc<Mutex<Option<Box<dyn MediaEncoder>>>>;

/// Everything held while a capture is running. Dropping it releases every
/// device handle.
struct ActiveCapture {
    id: u64,
    session: Arc<Mutex<CaptureSession>>,
    sources: AcquiredSources,
    compositor: Option<Compositor>,
    audio: Option<Arc<dyn AudioSource>>,
    encoder: SharedEncoder,
    mime_type: String,
    chunks: Arc<Mutex<Vec<Bytes>>>,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveCapture {
    fn halt_tasks(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn release(&mut self) {
        self.halt_tasks();
        if let Some(compositor) = self.compositor.as_mut() {
            compositor.stop();
        }
        if let Some(audio) = &self.audio {
            audio.stop();
        }
        self.sources.release_all();
    }
}

impl Drop for ActiveCapture {
    fn drop(&mut self) {
        self.release();
    }
}

/// Owns the capture pipeline for at most one recording at a time
pub struct CaptureController {
    provider: Arc<dyn SourceProvider>,
    encoders: Arc<dyn EncoderFactory>,
    settings: ControllerSettings,
    signals: mpsc::UnboundedSender<StopRequest>,
    state: RecordingState,
    active: Option<ActiveCapture>,
    next_capture_id: u64,
}

impl CaptureController {
    pub fn new(
        provider: Arc<dyn SourceProvider>,
        encoders: Arc<dyn EncoderFactory>,
        settings: ControllerSettings,
        signals: mpsc::UnboundedSender<StopRequest>,
    ) -> Self {
        Self {
            provider,
            encoders,
            settings,
            signals,
            state: RecordingState::Idle,
            active: None,
            next_capture_id: 1,
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    /// Identifier of the running capture
    pub fn capture_id(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.id)
    }

    /// Copy of the live session, if any
    pub fn session(&self) -> Option<CaptureSession> {
        self.active.as_ref().map(|a| a.session.lock().clone())
    }

    /// Acquire sources, build the composed stream and start encoding
    pub async fn start(&mut self, config: &RecordingConfig) -> RecordingResult<CaptureSession> {
        if self.state.is_active() {
            return Err(RecordingError::AlreadyRecording);
        }
        self.state = RecordingState::Requesting;
        tracing::info!("Starting capture");

        match self.start_inner(config).await {
            Ok(session) => {
                self.state = RecordingState::Recording;
                Ok(session)
            }
            Err(e) => {
                tracing::error!("Failed to start capture: {}", e);
                self.state = RecordingState::Error;
                Err(e)
            }
        }
    }

    async fn start_inner(&mut self, config: &RecordingConfig) -> RecordingResult<CaptureSession> {
        let sources = acquire_sources(self.provider.as_ref(), config).await?;
        let flags = sources.flags();
        let frame_rate = config.frame_rate.max(1);

        // From here on every early return drops `active`, releasing the sources
        let id = self.next_capture_id;
        self.next_capture_id += 1;
        let mut active = ActiveCapture {
            id,
            session: Arc::new(Mutex::new(CaptureSession::new(flags, config.title.clone()))),
            sources,
            compositor: None,
            audio: None,
            encoder: Arc::new(Mutex::new(None)),
            mime_type: String::new(),
            chunks: Arc::new(Mutex::new(Vec::new())),
            paused: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        };

        let (video, resolution): (Arc<dyn VideoSource>, Resolution) = match &active.sources.webcam {
            Some(webcam) => {
                let mut compositor = Compositor::new(DEFAULT_DRAW_RATE.max(frame_rate));
                let surface = compositor.initialize(active.sources.screen.clone(), Some(webcam.clone()));
                compositor.start()?;
                let stream = compositor.output_stream(frame_rate);
                active.compositor = Some(compositor);
                (stream, surface)
            }
            None => {
                let screen = active.sources.screen.clone();
                let resolution = screen.resolution().unwrap_or(FALLBACK_RESOLUTION);
                (screen, resolution)
            }
        };

        active.audio = audio::mix(
            active.sources.system_audio.clone(),
            active.sources.microphone.clone(),
        );

        let encoder_settings = EncoderSettings {
            resolution,
            frame_rate,
            audio: active.audio.as_ref().map(|a| a.format()),
        };
        let encoder = self.encoders.create(&encoder_settings)?;
        active.mime_type = encoder.mime_type().to_string();
        *active.encoder.lock() = Some(encoder);

        active.tasks.push(spawn_video_pump(
            video,
            resolution,
            frame_rate,
            active.encoder.clone(),
            active.paused.clone(),
            active.cancel.clone(),
        ));
        if let Some(audio) = &active.audio {
            if let Some(rx) = audio.take_stream() {
                active.tasks.push(spawn_audio_pump(
                    rx,
                    active.encoder.clone(),
                    active.paused.clone(),
                    active.cancel.clone(),
                ));
            }
        }
        active.tasks.push(spawn_chunk_collector(
            self.settings.timeslice,
            active.encoder.clone(),
            active.chunks.clone(),
            active.paused.clone(),
            active.cancel.clone(),
        ));
        active.tasks.push(spawn_watchdog(
            id,
            active.session.clone(),
            active.sources.screen.ended(),
            self.settings.max_duration,
            self.signals.clone(),
            active.cancel.clone(),
        ));

        let session = {
            let mut session = active.session.lock();
            session.begin_recording();
            session.clone()
        };
        tracing::info!(
            "Recording started at {}x{} @ {}fps (sources: {:?})",
            resolution.width,
            resolution.height,
            frame_rate,
            flags
        );
        self.active = Some(active);
        Ok(session)
    }

    /// Pause. Returns false when already paused.
    pub fn pause(&mut self) -> RecordingResult<bool> {
        let active = self.active.as_ref().ok_or(RecordingError::NotRecording)?;
        if self.state == RecordingState::Finalizing {
            return Err(RecordingError::NotRecording);
        }
        if !active.session.lock().pause() {
            return Ok(false);
        }
        active.paused.store(true, Ordering::SeqCst);
        self.state = RecordingState::Paused;
        tracing::info!("Recording paused");
        Ok(true)
    }

    /// Resume. Returns false when not paused.
    pub fn resume(&mut self) -> RecordingResult<bool> {
        let active = self.active.as_ref().ok_or(RecordingError::NotRecording)?;
        if self.state == RecordingState::Finalizing {
            return Err(RecordingError::NotRecording);
        }
        if !active.session.lock().resume() {
            return Ok(false);
        }
        active.paused.store(false, Ordering::SeqCst);
        self.state = RecordingState::Recording;
        tracing::info!("Recording resumed");
        Ok(true)
    }

    /// Mark the controller as finalizing ahead of `stop()`, so observers see
    /// the transition before the flush wait starts.
    pub fn begin_finalizing(&mut self) -> RecordingResult<()> {
        if self.active.is_none() {
            return Err(RecordingError::NotRecording);
        }
        self.state = RecordingState::Finalizing;
        Ok(())
    }

    /// Flush the encoder, assemble the artifact and release every source.
    pub async fn stop(&mut self) -> RecordingResult<RecordingArtifact> {
        let mut active = self.active.take().ok_or(RecordingError::NotRecording)?;
        self.state = RecordingState::Finalizing;
        tracing::info!("Stopping capture");

        let result = self.finalize(&mut active).await;
        // Release on every exit path
        active.release();
        drop(active);

        match result {
            Ok(artifact) => {
                self.state = RecordingState::Idle;
                tracing::info!(
                    "Recording finalized: {} bytes in {} chunks, {:.1}s",
                    artifact.data.len(),
                    artifact.chunk_count,
                    artifact.duration.as_secs_f64()
                );
                Ok(artifact)
            }
            Err(e) => {
                self.state = RecordingState::Error;
                tracing::error!("Failed to finalize recording: {}", e);
                Err(e)
            }
        }
    }

    async fn finalize(&self, active: &mut ActiveCapture) -> RecordingResult<RecordingArtifact> {
        let (duration, title) = {
            let mut session = active.session.lock();
            session.resume();
            session.status = RecordingState::Finalizing;
            (session.elapsed(), session.title.clone())
        };

        // Stop feeding the encoder before draining it
        active.halt_tasks();

        // 1. force-flush buffered output, 2. wait (bounded) for the drain
        let encoder = active.encoder.lock().take();
        if let Some(mut encoder) = encoder {
            let pending = encoder.request_data();
            if !pending.is_empty() {
                active.chunks.lock().push(pending);
            }

            let drain = tokio::task::spawn_blocking(move || encoder.finish());
            match tokio::time::timeout(self.settings.flush_timeout, drain).await {
                Ok(Ok(Ok(tail))) => {
                    if !tail.is_empty() {
                        active.chunks.lock().push(tail);
                    }
                }
                Ok(Ok(Err(e))) => {
                    tracing::warn!("Encoder reported an error while draining: {}", e);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Encoder drain task failed: {}", e);
                }
                Err(_) => {
                    tracing::warn!(
                        "Encoder did not drain within {:?}; the tail may be missing",
                        self.settings.flush_timeout
                    );
                }
            }
        }

        // 3. halt the compositor
        if let Some(compositor) = active.compositor.as_mut() {
            compositor.stop();
        }

        // 4. concatenate chunks in arrival order
        let chunks = std::mem::take(&mut *active.chunks.lock());
        let chunk_count = chunks.len();
        let total: usize = chunks.iter().map(Bytes::len).sum();
        let mut data = BytesMut::with_capacity(total);
        for chunk in &chunks {
            data.extend_from_slice(chunk);
        }

        if data.is_empty() {
            return Err(RecordingError::NoDataCaptured);
        }

        Ok(RecordingArtifact {
            data: data.freeze(),
            mime_type: active.mime_type.clone(),
            duration,
            chunk_count,
            title,
        })
    }
}

fn spawn_video_pump(
    video: Arc<dyn VideoSource>,
    resolution: Resolution,
    frame_rate: u32,
    encoder: SharedEncoder,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let period = Duration::from_secs_f64(1.0 / frame_rate as f64);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let black = Arc::new(VideoFrame::black(resolution));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if paused.load(Ordering::SeqCst) {
                continue;
            }

            let frame = match video.latest_frame() {
                Some(frame) if frame.resolution() == resolution => frame,
                Some(frame) => Arc::new(overlay::compose_frame(resolution, Some(&frame), None)),
                None => black.clone(),
            };

            let mut guard = encoder.lock();
            let Some(sink) = guard.as_mut() else { break };
            if let Err(e) = sink.write_video(frame) {
                tracing::error!("Video pump stopped: {}", e);
                break;
            }
        }
    })
}

fn spawn_audio_pump(
    mut rx: mpsc::UnboundedReceiver<crate::capture::AudioChunk>,
    encoder: SharedEncoder,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = rx.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
            };
            // Samples captured while paused are discarded
            if paused.load(Ordering::SeqCst) {
                continue;
            }
            let mut guard = encoder.lock();
            let Some(sink) = guard.as_mut() else { break };
            if let Err(e) = sink.write_audio(chunk) {
                tracing::error!("Audio pump stopped: {}", e);
                break;
            }
        }
    })
}

fn spawn_chunk_collector(
    timeslice: Duration,
    encoder: SharedEncoder,
    chunks: Arc<Mutex<Vec<Bytes>>>,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + timeslice, timeslice);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if paused.load(Ordering::SeqCst) {
                continue;
            }
            let data = match encoder.lock().as_mut() {
                Some(sink) => sink.request_data(),
                None => break,
            };
            if !data.is_empty() {
                let mut chunks = chunks.lock();
                chunks.push(data);
                tracing::debug!("Collected chunk {} ({} bytes)", chunks.len(), chunks[chunks.len() - 1].len());
            }
        }
    })
}

fn spawn_watchdog(
    capture_id: u64,
    session: Arc<Mutex<CaptureSession>>,
    screen_ended: CancellationToken,
    max_duration: Duration,
    signals: mpsc::UnboundedSender<StopRequest>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let remaining = max_duration.saturating_sub(session.lock().elapsed());
            if remaining.is_zero() {
                tracing::info!("Maximum duration of {:?} reached", max_duration);
                let _ = signals.send(StopRequest {
                    capture_id,
                    reason: ControllerSignal::MaxDurationReached,
                });
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = screen_ended.cancelled() => {
                    tracing::info!("Screen sharing ended by the user");
                    let _ = signals.send(StopRequest {
                        capture_id,
                        reason: ControllerSignal::ScreenShareEnded,
                    });
                    break;
                }
                // Re-evaluate at least every 250ms; pauses push the deadline out
                _ = tokio::time::sleep(remaining.min(Duration::from_millis(250))) => {}
            }
        }
    })
}
