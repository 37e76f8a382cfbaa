//! Spectrum analyser node state
//!
//! The render thread feeds mono samples into a history window; control-side
//! reads turn that window into byte magnitudes the way a Web Audio
//! `AnalyserNode` does: Blackman window, FFT, time smoothing against the
//! previous frame, dB conversion and linear scaling into `0..=255`.

use ethereal_core::domain::audio::AnalyserOptions;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

pub struct Analyser {
    options: AnalyserOptions,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    history: Vec<f32>,
    write_pos: usize,
    smoothed: Vec<f32>,
    scratch: Vec<Complex<f32>>,
}

impl Analyser {
    /// `options` must already be validated (power-of-two FFT size in range,
    /// `min_decibels < max_decibels`)
    pub fn new(options: AnalyserOptions) -> Self {
        let size = options.fft_size;
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(size);

        Self {
            options,
            fft,
            window: blackman(size),
            history: vec![0.0; size],
            write_pos: 0,
            smoothed: vec![0.0; options.frequency_bin_count()],
            scratch: vec![Complex::new(0.0, 0.0); size],
        }
    }

    pub fn options(&self) -> &AnalyserOptions {
        &self.options
    }

    pub fn bin_count(&self) -> usize {
        self.smoothed.len()
    }

    /// Append interleaved stereo frames, downmixed to mono
    pub fn push_stereo(&mut self, frames: &[f32]) {
        let len = self.history.len();
        for frame in frames.chunks_exact(2) {
            self.history[self.write_pos] = 0.5 * (frame[0] + frame[1]);
            self.write_pos = (self.write_pos + 1) % len;
        }
    }

    /// Compute the current spectrum into `out` (truncated to its length)
    pub fn byte_frequency_data(&mut self, out: &mut [u8]) {
        let size = self.history.len();
        for i in 0..size {
            let sample = self.history[(self.write_pos + i) % size];
            self.scratch[i] = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let tau = self.options.smoothing_time_constant;
        let scale = 1.0 / size as f32;
        for (k, smoothed) in self.smoothed.iter_mut().enumerate() {
            let magnitude = self.scratch[k].norm() * scale;
            let next = tau * *smoothed + (1.0 - tau) * magnitude;
            *smoothed = if next.is_finite() { next } else { 0.0 };
        }

        let min_db = self.options.min_decibels;
        let range = self.options.max_decibels - min_db;
        for (byte, &magnitude) in out.iter_mut().zip(self.smoothed.iter()) {
            let db = if magnitude > 0.0 {
                20.0 * magnitude.log10()
            } else {
                f32::NEG_INFINITY
            };
            let scaled = 255.0 * (db - min_db) / range;
            *byte = scaled.clamp(0.0, 255.0) as u8;
        }
        if out.len() > self.smoothed.len() {
            out[self.smoothed.len()..].fill(0);
        }
    }

    pub fn reset(&mut self) {
        self.history.fill(0.0);
        self.smoothed.fill(0.0);
        self.write_pos = 0;
    }
}

impl std::fmt::Debug for Analyser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analyser")
            .field("options", &self.options)
            .field("write_pos", &self.write_pos)
            .finish()
    }
}

fn blackman(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            let x = 2.0 * PI * i as f32 / size as f32;
            0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
        })
        .collect()
}
