//! Ethereal core: the audio signal-processing graph behind the player's
//! equalizer, compressor and spectrum visualizer.
//!
//! Everything here is platform-agnostic. The processing nodes themselves are
//! created through the [`domain::audio::AudioRuntime`] port, implemented in
//! the `ethereal-infra` crate.

pub mod domain;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;
