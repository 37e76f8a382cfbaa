//! Realtime output through CPAL
//!
//! The device callback is the render thread: it pulls stereo audio from a
//! [`SoftwareRuntime`] and folds it onto the device's channel layout.
//! Platform backends behind CPAL:
//! - Windows: WASAPI
//! - Linux: ALSA/PulseAudio
//! - macOS: CoreAudio

use super::render_graph::CHANNELS;
use super::software_runtime::SoftwareRuntime;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use ethereal_core::domain::config::AudioConfig;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("No default output device")]
    NoDevice,

    #[error("Device configuration error: {0}")]
    Config(String),

    #[error("Failed to build stream: {0}")]
    Build(String),

    #[error("Failed to start stream: {0}")]
    Play(String),
}

/// A running output stream; audio stops when it is dropped
pub struct OutputStream {
    _stream: Stream,
    device_name: String,
    channels: u16,
    sample_rate: u32,
}

impl OutputStream {
    /// Open the default output device and start rendering `runtime` into it
    pub fn open(runtime: Arc<SoftwareRuntime>, config: &AudioConfig) -> Result<Self, OutputError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(OutputError::NoDevice)?;

        #[allow(deprecated)]
        let device_name = device
            .name()
            .unwrap_or_else(|_| "Unknown Device".to_string());

        let default_config = device
            .default_output_config()
            .map_err(|e| OutputError::Config(e.to_string()))?;
        let channels = default_config.channels();
        let sample_rate = runtime.sample_rate();

        let stream_config = StreamConfig {
            channels,
            sample_rate,
            buffer_size: if config.buffer_size == 0 {
                cpal::BufferSize::Default
            } else {
                cpal::BufferSize::Fixed(config.buffer_size)
            },
        };

        info!(
            device = %device_name,
            channels,
            sample_rate,
            buffer_size = config.buffer_size,
            "Opening output stream"
        );

        let mut scratch: Vec<f32> = Vec::with_capacity(config.buffer_size as usize * CHANNELS);
        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels as usize;
                    // Grows only if the device asks for more than the configured buffer
                    scratch.resize(frames * CHANNELS, 0.0);
                    runtime.render(&mut scratch);
                    fold_channels(&scratch, data, channels as usize);
                },
                |err| error!("Output stream error: {}", err),
                None,
            )
            .map_err(|e| OutputError::Build(e.to_string()))?;

        stream
            .play()
            .map_err(|e| OutputError::Play(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            device_name,
            channels,
            sample_rate,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Map interleaved stereo onto `channels` output channels.
///
/// Mono devices get the average of both sides; extra channels beyond the
/// first two are silent.
pub fn fold_channels(stereo: &[f32], out: &mut [f32], channels: usize) {
    if channels == 0 {
        return;
    }
    for (frame, pair) in out.chunks_exact_mut(channels).zip(stereo.chunks_exact(CHANNELS)) {
        if channels == 1 {
            frame[0] = 0.5 * (pair[0] + pair[1]);
        } else {
            frame[0] = pair[0];
            frame[1] = pair[1];
            frame[2..].fill(0.0);
        }
    }
}
