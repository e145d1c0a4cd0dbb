//! Screen + webcam compositor
//!
//! Merges the screen source and an optional webcam inset into one surface
//! redrawn at a fixed rate. The draw loop is a cancellable Tokio task; the
//! handle is kept so `stop()` deterministically prevents further ticks.

pub mod overlay;

use crate::capture::{Resolution, VideoFrame, VideoSource, FALLBACK_RESOLUTION};
use crate::recorder::error::{RecordingError, RecordingResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default rate of the draw loop
pub const DEFAULT_DRAW_RATE: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositorState {
    Stopped,
    Running,
}

struct Inputs {
    screen: Arc<dyn VideoSource>,
    webcam: Option<Arc<dyn VideoSource>>,
}

/// Composes the screen and webcam sources onto one surface
pub struct Compositor {
    draw_rate: u32,
    surface: Resolution,
    inputs: Option<Inputs>,
    frames: watch::Sender<Option<Arc<VideoFrame>>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
    state: CompositorState,
}

impl Compositor {
    pub fn new(draw_rate: u32) -> Self {
        let (frames, _) = watch::channel(None);
        Self {
            draw_rate: draw_rate.max(1),
            surface: FALLBACK_RESOLUTION,
            inputs: None,
            frames,
            cancel: None,
            task: None,
            state: CompositorState::Stopped,
        }
    }

    pub fn state(&self) -> CompositorState {
        self.state
    }

    /// Attach the sources and size the surface to the screen's native
    /// resolution (1920x1080 when unknown).
    pub fn initialize(
        &mut self,
        screen: Arc<dyn VideoSource>,
        webcam: Option<Arc<dyn VideoSource>>,
    ) -> Resolution {
        self.surface = screen
            .resolution()
            .filter(|r| r.width > 0 && r.height > 0)
            .unwrap_or(FALLBACK_RESOLUTION);
        self.inputs = Some(Inputs { screen, webcam });
        tracing::info!(
            "Compositor surface {}x{}",
            self.surface.width,
            self.surface.height
        );
        self.surface
    }

    pub fn surface(&self) -> Resolution {
        self.surface
    }

    /// Begin the draw loop
    pub fn start(&mut self) -> RecordingResult<()> {
        if self.state == CompositorState::Running {
            return Ok(());
        }
        let inputs = self.inputs.as_ref().ok_or_else(|| {
            RecordingError::CaptureError("Compositor started before initialize".to_string())
        })?;

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let screen = inputs.screen.clone();
        let webcam = inputs.webcam.clone();
        let surface = self.surface;
        let frames = self.frames.clone();
        let period = Duration::from_secs_f64(1.0 / self.draw_rate as f64);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut webcam_dropped = false;
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let screen_frame = screen.latest_frame();
                let webcam_frame = match &webcam {
                    Some(cam) if cam.is_active() => cam.latest_frame(),
                    Some(_) => {
                        if !webcam_dropped {
                            tracing::debug!("Webcam inactive, omitting inset");
                            webcam_dropped = true;
                        }
                        None
                    }
                    None => None,
                };

                let frame = overlay::compose_frame(
                    surface,
                    screen_frame.as_deref(),
                    webcam_frame.as_deref(),
                );

                // A frame drawn while stop() was running is discarded
                if loop_cancel.is_cancelled() {
                    break;
                }
                frames.send_replace(Some(Arc::new(frame)));
            }
            tracing::debug!("Compositor loop exited");
        });

        self.cancel = Some(cancel);
        self.task = Some(task);
        self.state = CompositorState::Running;
        Ok(())
    }

    /// Halt the draw loop. Pending ticks are cancelled, not ignored.
    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.state = CompositorState::Stopped;
    }

    /// The composed surface as a video source
    pub fn output_stream(&self, frame_rate: u32) -> Arc<dyn VideoSource> {
        Arc::new(CompositeStream {
            surface: self.surface,
            frame_rate,
            frames: self.frames.subscribe(),
            active: Arc::new(AtomicBool::new(true)),
            ended: CancellationToken::new(),
        })
    }
}

impl Drop for Compositor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read side of the composed surface
pub struct CompositeStream {
    surface: Resolution,
    frame_rate: u32,
    frames: watch::Receiver<Option<Arc<VideoFrame>>>,
    active: Arc<AtomicBool>,
    ended: CancellationToken,
}

impl CompositeStream {
    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }
}

impl VideoSource for CompositeStream {
    fn id(&self) -> &str {
        "composite"
    }

    fn resolution(&self) -> Option<Resolution> {
        Some(self.surface)
    }

    fn latest_frame(&self) -> Option<Arc<VideoFrame>> {
        self.frames.borrow().clone()
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn ended(&self) -> CancellationToken {
        self.ended.clone()
    }

    fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::SyntheticVideoSource;

    #[tokio::test]
    async fn test_surface_follows_screen_resolution() {
        let screen = SyntheticVideoSource::start("screen", Resolution::new(320, 180), 30, [0, 0, 0]);
        let mut compositor = Compositor::new(30);
        let surface = compositor.initialize(screen.clone(), None);
        assert_eq!(surface, Resolution::new(320, 180));
        screen.stop();
    }

    #[tokio::test]
    async fn test_start_requires_initialize() {
        let mut compositor = Compositor::new(30);
        assert!(compositor.start().is_err());
        assert_eq!(compositor.state(), CompositorState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_halts_frame_production() {
        let screen = SyntheticVideoSource::start("screen", Resolution::new(64, 36), 60, [0, 0, 0]);
        let webcam = SyntheticVideoSource::start("webcam", Resolution::new(16, 12), 60, [200, 0, 0]);
        let mut compositor = Compositor::new(60);
        compositor.initialize(screen.clone(), Some(webcam.clone()));
        let output = compositor.output_stream(30);

        compositor.start().unwrap();
        assert_eq!(compositor.state(), CompositorState::Running);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(output.latest_frame().is_some());

        compositor.stop();
        assert_eq!(compositor.state(), CompositorState::Stopped);
        let last = output.latest_frame().map(|f| Arc::as_ptr(&f));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(output.latest_frame().map(|f| Arc::as_ptr(&f)), last);

        screen.stop();
        webcam.stop();
    }

    #[tokio::test]
    async fn test_inactive_webcam_is_omitted() {
        let screen = SyntheticVideoSource::start("screen", Resolution::new(200, 150), 60, [0, 0, 0]);
        let webcam = SyntheticVideoSource::start("webcam", Resolution::new(16, 12), 60, [250, 250, 250]);
        webcam.stop();

        let mut compositor = Compositor::new(60);
        compositor.initialize(screen.clone(), Some(webcam));
        let output = compositor.output_stream(30);
        compositor.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let frame = output.latest_frame().unwrap();
        let rect = overlay::InsetRect::for_surface(Resolution::new(200, 150)).unwrap();
        let centre = frame.pixel(rect.x + rect.width / 2, rect.y + rect.height / 2);
        // Synthetic screen leaves the blue channel at its base of zero
        assert_eq!(centre[2], 0);

        compositor.stop();
        screen.stop();
    }
}
