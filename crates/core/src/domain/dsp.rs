//! Digital Signal Processing primitives for the equalizer chain
//!
//! This module provides the math behind the runtime's processing nodes:
//! - Biquad filters (low shelf, high shelf, peaking) from the RBJ cookbook
//! - A soft-knee dynamics compressor
//! - Parameter smoothing for click-free automation
//!
//! All processors work in-place on interleaved stereo `f32` buffers
//! normalized to [-1.0, 1.0] and never allocate while processing.

use crate::domain::audio::FilterType;
use serde::{Deserialize, Serialize};

/// Parameter constraints for equalizer and compressor stages
///
/// All parameters are clamped to these ranges on write.
pub mod params {
    /// Gain range for bands and shelves (dB)
    pub const GAIN_DB_MIN: f32 = -12.0;
    pub const GAIN_DB_MAX: f32 = 12.0;

    /// Bass shelf corner frequency range (Hz)
    pub const BASS_FREQ_MIN: f32 = 50.0;
    pub const BASS_FREQ_MAX: f32 = 400.0;

    /// Treble shelf corner frequency range (Hz)
    pub const TREBLE_FREQ_MIN: f32 = 1000.0;
    pub const TREBLE_FREQ_MAX: f32 = 10000.0;

    /// Fixed quality factors per stage role
    pub const SHELF_Q: f32 = 0.707;
    pub const PEAKING_Q: f32 = 1.0;

    /// Compressor threshold range (dB)
    pub const THRESHOLD_MIN: f32 = -100.0;
    pub const THRESHOLD_MAX: f32 = 0.0;

    /// Compressor knee width range (dB)
    pub const KNEE_MIN: f32 = 0.0;
    pub const KNEE_MAX: f32 = 40.0;

    /// Compressor ratio range (1:1 to 20:1)
    pub const RATIO_MIN: f32 = 1.0;
    pub const RATIO_MAX: f32 = 20.0;

    /// Attack/release time range (seconds)
    pub const TIME_MIN: f32 = 0.0;
    pub const TIME_MAX: f32 = 1.0;

    /// Preamp range (dB)
    pub const PREAMP_DB_MIN: f32 = -12.0;
    pub const PREAMP_DB_MAX: f32 = 12.0;

    /// Floor used when converting silence to decibels
    pub const SILENCE_DB: f32 = -120.0;
}

/// Clamp a gain in dB to the band range; NaN becomes 0 dB
#[inline]
pub fn clamp_gain_db(db: f32) -> f32 {
    if db.is_nan() {
        0.0
    } else {
        db.clamp(params::GAIN_DB_MIN, params::GAIN_DB_MAX)
    }
}

/// Convert decibels to a linear amplitude factor
#[inline]
pub fn db_to_gain(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Convert a linear amplitude to decibels, floored at [`params::SILENCE_DB`]
#[inline]
pub fn gain_to_db(level: f32) -> f32 {
    if level <= 1e-6 {
        params::SILENCE_DB
    } else {
        (20.0 * level.log10()).max(params::SILENCE_DB)
    }
}

/// Core trait for the processors behind runtime nodes
pub trait Effect: Send {
    /// Process an interleaved stereo buffer in-place
    fn process(&mut self, buffer: &mut [f32]);

    /// Clear internal state (filter memory, envelopes)
    fn reset(&mut self);

    /// Effect name for debugging/display
    fn name(&self) -> &str;
}

// ============================================================================
// BIQUAD FILTER
// ============================================================================

/// Biquad filter coefficients, normalized so that a0 == 1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiquadCoeffs {
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
    pub a1: f32,
    pub a2: f32,
}

impl Default for BiquadCoeffs {
    fn default() -> Self {
        // Unity gain (no filtering)
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }
}

impl BiquadCoeffs {
    /// Coefficients for the given response
    #[must_use]
    pub fn for_type(filter: FilterType, sample_rate: f32, freq: f32, gain_db: f32, q: f32) -> Self {
        match filter {
            FilterType::LowShelf => Self::low_shelf(sample_rate, freq, gain_db, q),
            FilterType::HighShelf => Self::high_shelf(sample_rate, freq, gain_db, q),
            FilterType::Peaking => Self::peaking(sample_rate, freq, gain_db, q),
        }
    }

    /// Low shelf: boosts or cuts frequencies below `freq`
    #[must_use]
    pub fn low_shelf(sample_rate: f32, freq: f32, gain_db: f32, q: f32) -> Self {
        let (a, cos_w0, alpha) = Self::prewarp(sample_rate, freq, gain_db, q);
        let sqrt_a = a.sqrt();

        let b0 = a * ((a + 1.0) - (a - 1.0) * cos_w0 + 2.0 * sqrt_a * alpha);
        let b1 = 2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w0);
        let b2 = a * ((a + 1.0) - (a - 1.0) * cos_w0 - 2.0 * sqrt_a * alpha);

        let a0 = (a + 1.0) + (a - 1.0) * cos_w0 + 2.0 * sqrt_a * alpha;
        let a1 = -2.0 * ((a - 1.0) + (a + 1.0) * cos_w0);
        let a2 = (a + 1.0) + (a - 1.0) * cos_w0 - 2.0 * sqrt_a * alpha;

        Self::normalized(b0, b1, b2, a0, a1, a2)
    }

    /// High shelf: boosts or cuts frequencies above `freq`
    #[must_use]
    pub fn high_shelf(sample_rate: f32, freq: f32, gain_db: f32, q: f32) -> Self {
        let (a, cos_w0, alpha) = Self::prewarp(sample_rate, freq, gain_db, q);
        let sqrt_a = a.sqrt();

        let b0 = a * ((a + 1.0) + (a - 1.0) * cos_w0 + 2.0 * sqrt_a * alpha);
        let b1 = -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w0);
        let b2 = a * ((a + 1.0) + (a - 1.0) * cos_w0 - 2.0 * sqrt_a * alpha);

        let a0 = (a + 1.0) - (a - 1.0) * cos_w0 + 2.0 * sqrt_a * alpha;
        let a1 = 2.0 * ((a - 1.0) - (a + 1.0) * cos_w0);
        let a2 = (a + 1.0) - (a - 1.0) * cos_w0 - 2.0 * sqrt_a * alpha;

        Self::normalized(b0, b1, b2, a0, a1, a2)
    }

    /// Peaking: boosts or cuts a region around `freq`
    #[must_use]
    pub fn peaking(sample_rate: f32, freq: f32, gain_db: f32, q: f32) -> Self {
        let (a, cos_w0, alpha) = Self::prewarp(sample_rate, freq, gain_db, q);

        let b0 = 1.0 + alpha * a;
        let b1 = -2.0 * cos_w0;
        let b2 = 1.0 - alpha * a;

        let a0 = 1.0 + alpha / a;
        let a1 = -2.0 * cos_w0;
        let a2 = 1.0 - alpha / a;

        Self::normalized(b0, b1, b2, a0, a1, a2)
    }

    /// Shared intermediates: (A, cos w0, alpha).
    /// The frequency is kept strictly below Nyquist.
    fn prewarp(sample_rate: f32, freq: f32, gain_db: f32, q: f32) -> (f32, f32, f32) {
        let nyquist = sample_rate / 2.0;
        let freq = freq.clamp(1.0, nyquist * 0.999);
        let a = 10.0_f32.powf(clamp_gain_db(gain_db) / 40.0);
        let w0 = 2.0 * std::f32::consts::PI * freq / sample_rate;
        let alpha = w0.sin() / (2.0 * q.max(1e-3));
        (a, w0.cos(), alpha)
    }

    fn normalized(b0: f32, b1: f32, b2: f32, a0: f32, a1: f32, a2: f32) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// Magnitude response at `freq`, in dB
    pub fn magnitude_db(&self, sample_rate: f32, freq: f32) -> f32 {
        let w = 2.0 * std::f32::consts::PI * freq / sample_rate;
        let (cos1, sin1) = (w.cos(), w.sin());
        let (cos2, sin2) = ((2.0 * w).cos(), (2.0 * w).sin());

        let num_re = self.b0 + self.b1 * cos1 + self.b2 * cos2;
        let num_im = -(self.b1 * sin1 + self.b2 * sin2);
        let den_re = 1.0 + self.a1 * cos1 + self.a2 * cos2;
        let den_im = -(self.a1 * sin1 + self.a2 * sin2);

        let num = (num_re * num_re + num_im * num_im).sqrt();
        let den = (den_re * den_re + den_im * den_im).sqrt();
        gain_to_db(num / den)
    }
}

/// Stateful biquad filter using Direct Form I
///
/// Direct Form I keeps coefficient swaps free of state discontinuities,
/// which matters when parameters are automated during playback.
#[derive(Debug, Clone, PartialEq)]
pub struct BiquadFilter {
    coeffs: BiquadCoeffs,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl BiquadFilter {
    pub fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    /// Unity-gain filter
    pub fn bypass() -> Self {
        Self::new(BiquadCoeffs::default())
    }

    /// Swap coefficients without touching the filter memory
    pub fn set_coeffs(&mut self, coeffs: BiquadCoeffs) {
        self.coeffs = coeffs;
    }

    pub fn coeffs(&self) -> BiquadCoeffs {
        self.coeffs
    }

    #[inline]
    pub fn process_sample(&mut self, x: f32) -> f32 {
        let y = self.coeffs.b0 * x + self.coeffs.b1 * self.x1 + self.coeffs.b2 * self.x2
            - self.coeffs.a1 * self.y1
            - self.coeffs.a2 * self.y2;

        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        // Flush denormals so long silences stay cheap
        self.y1 = if y.abs() < 1e-20 { 0.0 } else { y };

        self.y1
    }

    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }
}

/// One biquad per channel sharing the same coefficients
#[derive(Debug, Clone)]
pub struct StereoBiquad {
    left: BiquadFilter,
    right: BiquadFilter,
}

impl StereoBiquad {
    pub fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            left: BiquadFilter::new(coeffs),
            right: BiquadFilter::new(coeffs),
        }
    }

    pub fn set_coeffs(&mut self, coeffs: BiquadCoeffs) {
        self.left.set_coeffs(coeffs);
        self.right.set_coeffs(coeffs);
    }
}

impl Effect for StereoBiquad {
    fn process(&mut self, buffer: &mut [f32]) {
        for frame in buffer.chunks_exact_mut(2) {
            frame[0] = self.left.process_sample(frame[0]);
            frame[1] = self.right.process_sample(frame[1]);
        }
    }

    fn reset(&mut self) {
        self.left.reset();
        self.right.reset();
    }

    fn name(&self) -> &str {
        "Biquad"
    }
}

// ============================================================================
// PARAMETER SMOOTHING
// ============================================================================

/// One-pole smoothed parameter, advanced once per render quantum
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothedValue {
    current: f32,
    target: f32,
    coeff: f32,
}

impl SmoothedValue {
    /// `coeff` is the fraction of the remaining distance kept per step
    pub fn new(value: f32, coeff: f32) -> Self {
        Self {
            current: value,
            target: value,
            coeff: coeff.clamp(0.0, 0.999),
        }
    }

    pub fn set_target(&mut self, target: f32) {
        self.target = target;
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    pub fn is_settled(&self) -> bool {
        self.current == self.target
    }

    /// Move toward the target; returns true if the value changed
    pub fn step(&mut self) -> bool {
        if self.is_settled() {
            return false;
        }
        let next = self.target + (self.current - self.target) * self.coeff;
        let span = self.target.abs().max(1.0);
        self.current = if (next - self.target).abs() <= span * 1e-4 {
            self.target
        } else {
            next
        };
        true
    }

    /// Jump to the target immediately
    pub fn settle(&mut self) {
        self.current = self.target;
    }
}

// ============================================================================
// DYNAMICS COMPRESSOR
// ============================================================================

/// Compressor settings with fixed per-field ranges (see [`params`])
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressorParams {
    pub threshold_db: f32,
    pub knee_db: f32,
    pub ratio: f32,
    pub attack_sec: f32,
    pub release_sec: f32,
}

impl Default for CompressorParams {
    fn default() -> Self {
        Self {
            threshold_db: -24.0,
            knee_db: 30.0,
            ratio: 12.0,
            attack_sec: 0.003,
            release_sec: 0.25,
        }
    }
}

impl CompressorParams {
    /// Copy with every field clamped into its valid range.
    /// Non-finite fields fall back to their defaults.
    #[must_use]
    pub fn clamped(self) -> Self {
        let defaults = Self::default();
        let pick = |value: f32, fallback: f32, min: f32, max: f32| {
            if value.is_finite() {
                value.clamp(min, max)
            } else {
                fallback
            }
        };
        Self {
            threshold_db: pick(
                self.threshold_db,
                defaults.threshold_db,
                params::THRESHOLD_MIN,
                params::THRESHOLD_MAX,
            ),
            knee_db: pick(self.knee_db, defaults.knee_db, params::KNEE_MIN, params::KNEE_MAX),
            ratio: pick(self.ratio, defaults.ratio, params::RATIO_MIN, params::RATIO_MAX),
            attack_sec: pick(self.attack_sec, defaults.attack_sec, params::TIME_MIN, params::TIME_MAX),
            release_sec: pick(
                self.release_sec,
                defaults.release_sec,
                params::TIME_MIN,
                params::TIME_MAX,
            ),
        }
    }
}

/// Feed-forward compressor with a soft knee and stereo-linked detection
#[derive(Debug, Clone)]
pub struct Compressor {
    params: CompressorParams,
    sample_rate: f32,
    attack_coeff: f32,
    release_coeff: f32,
    // Smoothed gain reduction in dB (<= 0)
    reduction_db: f32,
}

impl Compressor {
    pub fn new(sample_rate: u32) -> Self {
        let mut comp = Self {
            params: CompressorParams::default(),
            sample_rate: sample_rate as f32,
            attack_coeff: 0.0,
            release_coeff: 0.0,
            reduction_db: 0.0,
        };
        comp.update_coefficients();
        comp
    }

    pub fn params(&self) -> CompressorParams {
        self.params
    }

    pub fn set_params(&mut self, params: CompressorParams) {
        self.params = params.clamped();
        self.update_coefficients();
    }

    /// Current gain reduction in dB (0 or negative)
    pub fn reduction_db(&self) -> f32 {
        self.reduction_db
    }

    fn update_coefficients(&mut self) {
        self.attack_coeff = Self::time_coeff(self.params.attack_sec, self.sample_rate);
        self.release_coeff = Self::time_coeff(self.params.release_sec, self.sample_rate);
    }

    fn time_coeff(time_sec: f32, sample_rate: f32) -> f32 {
        if time_sec <= 0.0 {
            0.0
        } else {
            (-1.0 / (time_sec * sample_rate)).exp()
        }
    }

    /// Static curve: output level for a given input level (both dB)
    #[inline]
    pub fn gain_computer(&self, input_db: f32) -> f32 {
        let threshold = self.params.threshold_db;
        let knee = self.params.knee_db;
        let slope = 1.0 / self.params.ratio;
        let over = input_db - threshold;

        if 2.0 * over < -knee {
            input_db
        } else if knee > 0.0 && 2.0 * over.abs() <= knee {
            let x = over + knee / 2.0;
            input_db + (slope - 1.0) * x * x / (2.0 * knee)
        } else {
            threshold + over * slope
        }
    }

    #[inline]
    fn process_frame(&mut self, left: f32, right: f32) -> (f32, f32) {
        let level_db = gain_to_db(left.abs().max(right.abs()));
        let target = self.gain_computer(level_db) - level_db;

        // More reduction = attack, recovering = release
        let coeff = if target < self.reduction_db {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.reduction_db = coeff * self.reduction_db + (1.0 - coeff) * target;

        let gain = db_to_gain(self.reduction_db);
        (left * gain, right * gain)
    }
}

impl Effect for Compressor {
    fn process(&mut self, buffer: &mut [f32]) {
        for frame in buffer.chunks_exact_mut(2) {
            let (l, r) = self.process_frame(frame[0], frame[1]);
            frame[0] = l;
            frame[1] = r;
        }
    }

    fn reset(&mut self) {
        self.reduction_db = 0.0;
    }

    fn name(&self) -> &str {
        "Compressor"
    }
}
