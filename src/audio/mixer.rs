//! Summing mixer for two audio sources

use crate::capture::{AudioChunk, AudioFormat, AudioSource};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Tick of the mixing graph
const MIX_INTERVAL: Duration = Duration::from_millis(10);

/// How far one input may run ahead before the other is treated as silent
const MAX_SKEW: Duration = Duration::from_millis(100);

/// Two sources summed sample-by-sample into one track
pub struct MixedAudioSource {
    format: AudioFormat,
    inputs: Vec<Arc<dyn AudioSource>>,
    stream: Mutex<Option<mpsc::UnboundedReceiver<AudioChunk>>>,
    active: Arc<AtomicBool>,
    graph: Mutex<Option<JoinHandle<()>>>,
}

struct Input {
    rx: Option<mpsc::UnboundedReceiver<AudioChunk>>,
    queue: VecDeque<f32>,
}

impl Input {
    /// Pull everything currently available. Returns false once the input
    /// has closed and its queue is empty.
    fn drain(&mut self) -> bool {
        if let Some(rx) = &mut self.rx {
            loop {
                match rx.try_recv() {
                    Ok(chunk) => self.queue.extend(chunk.samples),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        self.rx = None;
                        break;
                    }
                }
            }
        }
        self.rx.is_some() || !self.queue.is_empty()
    }

    fn take(&mut self, n: usize) -> impl Iterator<Item = f32> + '_ {
        let available = n.min(self.queue.len());
        self.queue
            .drain(..available)
            .chain(std::iter::repeat(0.0).take(n - available))
    }
}

impl MixedAudioSource {
    /// Build the graph over two sources. Both must share a format; the
    /// first input's format is used.
    pub fn new(a: Arc<dyn AudioSource>, b: Arc<dyn AudioSource>) -> Self {
        let format = a.format();
        if b.format() != format {
            tracing::warn!(
                "Mixing {} ({:?}) with {} ({:?}); using the former",
                a.id(),
                format,
                b.id(),
                b.format()
            );
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        let mut left = Input {
            rx: a.take_stream(),
            queue: VecDeque::new(),
        };
        let mut right = Input {
            rx: b.take_stream(),
            queue: VecDeque::new(),
        };
        let skew = (format.sample_rate as f64 * MAX_SKEW.as_secs_f64()) as usize
            * format.channels as usize;
        let running = active.clone();

        let graph = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MIX_INTERVAL);
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let left_open = left.drain();
                let right_open = right.drain();
                if !left_open && !right_open {
                    break;
                }

                let n = mixable_len(&left, left_open, &right, right_open, skew);
                if n == 0 {
                    continue;
                }
                // Summed without normalization
                let samples: Vec<f32> = left
                    .take(n)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .zip(right.take(n))
                    .map(|(l, r)| l + r)
                    .collect();
                if tx.send(AudioChunk::new(samples)).is_err() {
                    break;
                }
            }
            tracing::debug!("Audio mix graph closed");
        });

        Self {
            format,
            inputs: vec![a, b],
            stream: Mutex::new(Some(rx)),
            active,
            graph: Mutex::new(Some(graph)),
        }
    }
}

/// Number of samples that can be emitted this tick. Normally the overlap of
/// both queues; a closed or lagging input is padded with silence.
fn mixable_len(left: &Input, left_open: bool, right: &Input, right_open: bool, skew: usize) -> usize {
    let (l, r) = (left.queue.len(), right.queue.len());
    match (left_open, right_open) {
        (true, false) => l,
        (false, true) => r,
        _ => {
            let longest = l.max(r);
            if longest > skew {
                longest
            } else {
                l.min(r)
            }
        }
    }
}

impl AudioSource for MixedAudioSource {
    fn id(&self) -> &str {
        "mix"
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

    /// Close the graph and stop both inputs
    fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(graph) = self.graph.lock().take() {
            graph.abort();
        }
        for input in &self.inputs {
            input.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource {
        stream: Mutex<Option<mpsc::UnboundedReceiver<AudioChunk>>>,
        stopped: AtomicBool,
    }

    impl FixedSource {
        fn new(blocks: Vec<Vec<f32>>) -> Arc<Self> {
            let (tx, rx) = mpsc::unbounded_channel();
            for block in blocks {
                tx.send(AudioChunk::new(block)).unwrap();
            }
            Arc::new(Self {
                stream: Mutex::new(Some(rx)),
                stopped: AtomicBool::new(false),
            })
        }
    }

    impl AudioSource for FixedSource {
        fn id(&self) -> &str {
            "fixed"
        }
        fn format(&self) -> AudioFormat {
            AudioFormat::default()
        }
        fn take_stream(&self) -> Option<mpsc::UnboundedReceiver<AudioChunk>> {
            self.stream.lock().take()
        }
        fn is_active(&self) -> bool {
            !self.stopped.load(Ordering::SeqCst)
        }
        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    async fn collect(source: &dyn AudioSource) -> Vec<f32> {
        let mut rx = source.take_stream().unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend(chunk.samples);
        }
        out
    }

    #[tokio::test]
    async fn test_sums_without_normalization() {
        let a = FixedSource::new(vec![vec![0.5; 4], vec![0.25; 2]]);
        let b = FixedSource::new(vec![vec![0.5; 6]]);
        let mix = MixedAudioSource::new(a, b);
        let samples = collect(&mix).await;
        assert_eq!(samples, vec![1.0, 1.0, 1.0, 1.0, 0.75, 0.75]);
    }

    #[tokio::test]
    async fn test_closed_input_passes_other_through() {
        let a = FixedSource::new(vec![vec![0.1; 2]]);
        let b = FixedSource::new(vec![vec![0.2; 5]]);
        let mix = MixedAudioSource::new(a, b);
        let samples = collect(&mix).await;
        assert_eq!(samples.len(), 5);
        assert!((samples[0] - 0.3).abs() < 1e-6);
        assert!((samples[4] - 0.2).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_stop_stops_inputs() {
        let a = FixedSource::new(vec![]);
        let b = FixedSource::new(vec![]);
        let mix = MixedAudioSource::new(a.clone(), b.clone());
        mix.stop();
        assert!(!mix.is_active());
        assert!(!a.is_active());
        assert!(!b.is_active());
    }
}
