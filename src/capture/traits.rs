//! Capture trait definitions
//!
//! Platform-agnostic traits and frame types for capture sources.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Size of one RGBA frame at this resolution
    pub fn rgba_frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// Resolution used when a screen source cannot report its native size
pub const FALLBACK_RESOLUTION: Resolution = Resolution::new(1920, 1080);

/// A single RGBA video frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Raw pixel data, RGBA, tightly packed
    pub data: Vec<u8>,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Capture timestamp in milliseconds since the source started
    pub timestamp_ms: f64,
}

impl VideoFrame {
    /// Create an opaque black frame
    pub fn black(resolution: Resolution) -> Self {
        let mut data = vec![0u8; resolution.rgba_frame_len()];
        for px in data.chunks_exact_mut(4) {
            px[3] = 255;
        }
        Self {
            data,
            width: resolution.width,
            height: resolution.height,
            timestamp_ms: 0.0,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Read the RGBA pixel at (x, y)
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let idx = ((y * self.width + x) * 4) as usize;
        [
            self.data[idx],
            self.data[idx + 1],
            self.data[idx + 2],
            self.data[idx + 3],
        ]
    }
}

/// PCM layout shared by every audio source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

/// A block of interleaved f32 samples
#[derive(Debug, Clone, Default)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    /// Little-endian f32 byte representation, as fed to the encoder
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

/// A live video source (screen, webcam, or the composited surface)
pub trait VideoSource: Send + Sync {
    /// Source identifier (e.g., "screen", "webcam")
    fn id(&self) -> &str;

    /// Native resolution, if the source knows it
    fn resolution(&self) -> Option<Resolution>;

    /// Most recent frame produced by the source
    fn latest_frame(&self) -> Option<Arc<VideoFrame>>;

    /// Whether the source is still delivering frames
    fn is_active(&self) -> bool;

    /// Token cancelled when the source ends out-of-band (e.g. the user
    /// revoked screen sharing). Not cancelled by `stop()`.
    fn ended(&self) -> CancellationToken;

    /// Release the underlying device
    fn stop(&self);
}

/// A live audio source (system audio, microphone, or a mix)
pub trait AudioSource: Send + Sync {
    fn id(&self) -> &str;

    fn format(&self) -> AudioFormat;

    /// Take the sample stream. Only the first caller receives it.
    fn take_stream(&self) -> Option<mpsc::UnboundedReceiver<AudioChunk>>;

    fn is_active(&self) -> bool;

    /// Release the underlying device
    fn stop(&self);
}
