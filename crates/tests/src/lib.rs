//! Shared fixtures for the integration tests
//!
//! Signal helpers drive a [`SoftwareRuntime`] the way an output device would:
//! the player pushes one render quantum, the device pulls one.

use ethereal_core::domain::{EqualizerController, EtherealConfig, MemoryPresetStore, PlaybackSlot};
use ethereal_infra::audio::{ElementRegistry, MediaElement, SoftwareRuntime, RENDER_QUANTUM_FRAMES};
use std::f32::consts::TAU;
use std::sync::Arc;

pub const SAMPLE_RATE: u32 = 48000;

/// Phase-continuous stereo sine generator
#[derive(Debug, Clone)]
pub struct Tone {
    step: f32,
    amplitude: f32,
    phase: f32,
}

impl Tone {
    pub fn new(freq: f32, amplitude: f32) -> Self {
        Self {
            step: freq / SAMPLE_RATE as f32,
            amplitude,
            phase: 0.0,
        }
    }

    /// Next `frames` interleaved stereo frames
    pub fn block(&mut self, frames: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(frames * 2);
        for _ in 0..frames {
            let s = (TAU * self.phase).sin() * self.amplitude;
            out.extend_from_slice(&[s, s]);
            self.phase = (self.phase + self.step).fract();
        }
        out
    }
}

/// Feed `tone` into `element` and render the same amount, quantum by quantum.
///
/// Returns the rendered interleaved output.
pub fn play(
    runtime: &SoftwareRuntime,
    element: &MediaElement,
    tone: &mut Tone,
    frames: usize,
) -> Vec<f32> {
    let mut output = vec![0.0; frames * 2];
    for chunk in output.chunks_mut(RENDER_QUANTUM_FRAMES * 2) {
        let pushed = element.push_samples(tone.block(chunk.len() / 2));
        assert!(pushed, "media element queue overflowed");
        runtime.render(chunk);
    }
    output
}

/// Root mean square of a buffer
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

/// Software runtime, one registered element and a controller wired to both
pub struct SoftwareRig {
    pub elements: Arc<ElementRegistry>,
    pub runtime: Arc<SoftwareRuntime>,
    pub element: Arc<MediaElement>,
    pub slot: Arc<PlaybackSlot>,
    pub store: Arc<MemoryPresetStore>,
    pub controller: EqualizerController,
}

impl SoftwareRig {
    pub fn new() -> Self {
        Self::with_config(&small_analyser_config())
    }

    pub fn with_config(config: &EtherealConfig) -> Self {
        let elements = Arc::new(ElementRegistry::new());
        let runtime = Arc::new(SoftwareRuntime::new(SAMPLE_RATE, Arc::clone(&elements)));
        let element = elements.create("audio");
        let slot = Arc::new(PlaybackSlot::with_handle(element.handle()));
        let store = Arc::new(MemoryPresetStore::new());
        let controller = match EqualizerController::from_config(
            runtime.clone(),
            config,
            slot.clone(),
            store.clone(),
        ) {
            Ok(controller) => controller,
            Err(e) => panic!("controller from valid config: {e}"),
        };
        Self {
            elements,
            runtime,
            element,
            slot,
            store,
            controller,
        }
    }

    /// Play `frames` of `tone` through the rig
    pub fn play(&self, tone: &mut Tone, frames: usize) -> Vec<f32> {
        play(&self.runtime, &self.element, tone, frames)
    }
}

impl Default for SoftwareRig {
    fn default() -> Self {
        Self::new()
    }
}

/// Factory configuration with a 512-point analyser
pub fn small_analyser_config() -> EtherealConfig {
    let mut config = EtherealConfig::factory_default();
    config.analyser.fft_size = 512;
    config.analyser.smoothing = 0.0;
    config
}
