//! Audio mixing
//!
//! Combines system audio and microphone audio into the single track handed
//! to the encoder. Inputs are summed as-is, so two loud sources can clip;
//! there is no gain normalization.

pub mod mixer;

pub use mixer::MixedAudioSource;

use crate::capture::AudioSource;
use std::sync::Arc;

/// Mix the optional inputs into one track.
///
/// Two inputs are summed, one is passed through, none yields no track.
pub fn mix(
    system_audio: Option<Arc<dyn AudioSource>>,
    microphone: Option<Arc<dyn AudioSource>>,
) -> Option<Arc<dyn AudioSource>> {
    match (system_audio, microphone) {
        (Some(system), Some(mic)) => {
            tracing::debug!("Mixing {} and {}", system.id(), mic.id());
            Some(Arc::new(MixedAudioSource::new(system, mic)))
        }
        (Some(only), None) | (None, Some(only)) => Some(only),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::SyntheticAudioSource;
    use crate::capture::AudioFormat;

    #[tokio::test]
    async fn test_mix_shapes() {
        assert!(mix(None, None).is_none());

        let mic: Arc<dyn AudioSource> = SyntheticAudioSource::start("microphone", AudioFormat::default(), 0.5);
        let passed = mix(None, Some(mic.clone())).unwrap();
        assert_eq!(passed.id(), "microphone");

        let system: Arc<dyn AudioSource> =
            SyntheticAudioSource::start("system-audio", AudioFormat::default(), 0.25);
        let other_mic: Arc<dyn AudioSource> =
            SyntheticAudioSource::start("microphone", AudioFormat::default(), 0.5);
        let mixed = mix(Some(system), Some(other_mic)).unwrap();
        assert_eq!(mixed.id(), "mix");

        let mut rx = mixed.take_stream().unwrap();
        let chunk = rx.recv().await.unwrap();
        // 0.25 + 0.5 in either phase of the square wave
        assert!(chunk.samples.iter().all(|s| (s.abs() - 0.75).abs() < 1e-6));

        mixed.stop();
        mic.stop();
    }
}
