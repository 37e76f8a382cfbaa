//! Equalizer filter parameters
//!
//! A [`FilterChain`] is the ordered set of filter stages in front of the gain
//! stage: bass shelf, treble shelf, then the peaking bands in ascending
//! frequency. The order is fixed when the chain is built; only gains and
//! shelf frequencies change afterwards. Nothing here touches a runtime: the
//! signal graph reads [`FilterChainState`] snapshots and pushes them into
//! live nodes.

use crate::domain::audio::FilterType;
use crate::domain::config::ConfigError;
use crate::domain::dsp::{clamp_gain_db, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

/// Errors from band-level mutations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
    #[error("Band index {index} out of range (band count {bands})")]
    IndexOutOfRange { index: usize, bands: usize },
}

pub type Result<T> = std::result::Result<T, FilterError>;

/// Position of a stage in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterRole {
    BassShelf,
    TrebleShelf,
    PeakingBand,
}

impl FilterRole {
    pub fn filter_type(&self) -> FilterType {
        match self {
            FilterRole::BassShelf => FilterType::LowShelf,
            FilterRole::TrebleShelf => FilterType::HighShelf,
            FilterRole::PeakingBand => FilterType::Peaking,
        }
    }

    /// Quality factor, fixed per role
    pub fn quality_factor(&self) -> f32 {
        match self {
            FilterRole::BassShelf | FilterRole::TrebleShelf => params::SHELF_Q,
            FilterRole::PeakingBand => params::PEAKING_Q,
        }
    }
}

/// One processing stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterStageSpec {
    pub role: FilterRole,
    pub frequency_hz: f32,
    pub gain_db: f32,
    pub quality_factor: f32,
}

/// Frequency and gain of a shelf stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShelfSettings {
    pub frequency_hz: f32,
    pub gain_db: f32,
}

impl ShelfSettings {
    pub fn new(frequency_hz: f32, gain_db: f32) -> Self {
        Self {
            frequency_hz,
            gain_db,
        }
    }
}

/// Value copy of a chain, for the graph, persistence and the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterChainState {
    pub band_frequencies: Vec<f32>,
    pub bands: Vec<f32>,
    pub bass: ShelfSettings,
    pub treble: ShelfSettings,
}

impl FilterChainState {
    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// All stages in graph order: bass, treble, then bands ascending
    pub fn stages(&self) -> Vec<FilterStageSpec> {
        let mut stages = Vec::with_capacity(self.bands.len() + 2);
        stages.push(FilterStageSpec {
            role: FilterRole::BassShelf,
            frequency_hz: self.bass.frequency_hz,
            gain_db: self.bass.gain_db,
            quality_factor: FilterRole::BassShelf.quality_factor(),
        });
        stages.push(FilterStageSpec {
            role: FilterRole::TrebleShelf,
            frequency_hz: self.treble.frequency_hz,
            gain_db: self.treble.gain_db,
            quality_factor: FilterRole::TrebleShelf.quality_factor(),
        });
        stages.extend(
            self.band_frequencies
                .iter()
                .zip(self.bands.iter())
                .map(|(&frequency_hz, &gain_db)| FilterStageSpec {
                    role: FilterRole::PeakingBand,
                    frequency_hz,
                    gain_db,
                    quality_factor: FilterRole::PeakingBand.quality_factor(),
                }),
        );
        stages
    }

    /// Same frequencies with every gain at 0 dB (acoustically transparent)
    #[must_use]
    pub fn flattened(&self) -> Self {
        Self {
            band_frequencies: self.band_frequencies.clone(),
            bands: vec![0.0; self.bands.len()],
            bass: ShelfSettings::new(self.bass.frequency_hz, 0.0),
            treble: ShelfSettings::new(self.treble.frequency_hz, 0.0),
        }
    }
}

/// Adapt `values` to `count` entries: zero-pad when short, truncate when long.
///
/// This is the lossy adaptation applied to presets saved with a different
/// band layout.
pub fn fit_to_band_count(values: &[f32], count: usize) -> Vec<f32> {
    let mut fitted: Vec<f32> = values.iter().take(count).copied().collect();
    fitted.resize(count, 0.0);
    fitted
}

/// Ordered equalizer parameters
#[derive(Debug, Clone, PartialEq)]
pub struct FilterChain {
    frequencies: Vec<f32>,
    gains: Vec<f32>,
    bass: ShelfSettings,
    treble: ShelfSettings,
}

impl FilterChain {
    /// Default band centers (Hz)
    pub const DEFAULT_BANDS: [f32; 6] = [60.0, 170.0, 350.0, 1000.0, 3500.0, 10000.0];
    pub const DEFAULT_BASS_HZ: f32 = 200.0;
    pub const DEFAULT_TREBLE_HZ: f32 = 2000.0;

    /// Build a chain with fixed band centers, all gains at 0 dB.
    ///
    /// Fails if there are no bands or the frequencies are not strictly
    /// increasing positive numbers.
    pub fn build(band_frequencies: &[f32]) -> std::result::Result<Self, ConfigError> {
        if band_frequencies.is_empty() {
            return Err(ConfigError::EmptyBands);
        }
        if let Some(index) = band_frequencies
            .iter()
            .position(|f| !f.is_finite() || *f <= 0.0)
        {
            return Err(ConfigError::Invalid(format!(
                "band {index} frequency must be a positive number"
            )));
        }
        if let Some(index) = band_frequencies
            .windows(2)
            .position(|pair| pair[1] <= pair[0])
        {
            return Err(ConfigError::NonIncreasingBands { index: index + 1 });
        }

        Ok(Self {
            frequencies: band_frequencies.to_vec(),
            gains: vec![0.0; band_frequencies.len()],
            bass: ShelfSettings::new(Self::DEFAULT_BASS_HZ, 0.0),
            treble: ShelfSettings::new(Self::DEFAULT_TREBLE_HZ, 0.0),
        })
    }

    /// Set the initial shelf corner frequencies (clamped like the setters)
    #[must_use]
    pub fn with_shelf_frequencies(mut self, bass_hz: f32, treble_hz: f32) -> Self {
        self.set_bass_shelf(ShelfSettings::new(bass_hz, 0.0));
        self.set_treble_shelf(ShelfSettings::new(treble_hz, 0.0));
        self
    }

    pub fn band_count(&self) -> usize {
        self.frequencies.len()
    }

    pub fn band_frequencies(&self) -> &[f32] {
        &self.frequencies
    }

    pub fn band_gains(&self) -> &[f32] {
        &self.gains
    }

    pub fn bass_shelf(&self) -> ShelfSettings {
        self.bass
    }

    pub fn treble_shelf(&self) -> ShelfSettings {
        self.treble
    }

    /// Set one band's gain, clamped to [-12, 12] dB
    pub fn set_band_gain(&mut self, index: usize, db: f32) -> Result<()> {
        let bands = self.gains.len();
        let gain = self
            .gains
            .get_mut(index)
            .ok_or(FilterError::IndexOutOfRange { index, bands })?;
        *gain = clamp_gain_db(db);
        trace!(index, gain_db = *gain, "Band gain set");
        Ok(())
    }

    /// Set every band at once; mismatched lengths are padded or truncated
    pub fn set_all_band_gains(&mut self, values: &[f32]) {
        self.gains = fit_to_band_count(values, self.frequencies.len())
            .into_iter()
            .map(clamp_gain_db)
            .collect();
        trace!(gains = ?self.gains, "All band gains set");
    }

    /// Frequency clamped to 50-400 Hz, gain to [-12, 12] dB
    pub fn set_bass_shelf(&mut self, settings: ShelfSettings) {
        self.bass = Self::clamp_shelf(
            settings,
            self.bass.frequency_hz,
            params::BASS_FREQ_MIN,
            params::BASS_FREQ_MAX,
        );
    }

    /// Frequency clamped to 1-10 kHz, gain to [-12, 12] dB
    pub fn set_treble_shelf(&mut self, settings: ShelfSettings) {
        self.treble = Self::clamp_shelf(
            settings,
            self.treble.frequency_hz,
            params::TREBLE_FREQ_MIN,
            params::TREBLE_FREQ_MAX,
        );
    }

    fn clamp_shelf(settings: ShelfSettings, current_hz: f32, min: f32, max: f32) -> ShelfSettings {
        let frequency_hz = if settings.frequency_hz.is_finite() {
            settings.frequency_hz.clamp(min, max)
        } else {
            current_hz
        };
        ShelfSettings::new(frequency_hz, clamp_gain_db(settings.gain_db))
    }

    /// Every band, bass and treble gain back to 0 dB; frequencies kept
    pub fn reset(&mut self) {
        self.gains.iter_mut().for_each(|g| *g = 0.0);
        self.bass.gain_db = 0.0;
        self.treble.gain_db = 0.0;
    }

    pub fn snapshot(&self) -> FilterChainState {
        FilterChainState {
            band_frequencies: self.frequencies.clone(),
            bands: self.gains.clone(),
            bass: self.bass,
            treble: self.treble,
        }
    }
}

impl Default for FilterChain {
    fn default() -> Self {
        Self {
            frequencies: Self::DEFAULT_BANDS.to_vec(),
            gains: vec![0.0; Self::DEFAULT_BANDS.len()],
            bass: ShelfSettings::new(Self::DEFAULT_BASS_HZ, 0.0),
            treble: ShelfSettings::new(Self::DEFAULT_TREBLE_HZ, 0.0),
        }
    }
}
