//! Configuration management for Ethereal
//!
//! This module provides:
//! - Configuration structs for audio output, equalizer layout, analyser and visualizer
//! - TOML serialization with async load/save
//! - A manager for the main config file with factory defaults and corrupt-file backup

use crate::domain::audio::AnalyserOptions;
use crate::domain::dsp::CompressorParams;
use crate::domain::filter_chain::FilterChain;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Equalizer needs at least one band")]
    EmptyBands,

    #[error("Band frequencies must be strictly increasing (band {index})")]
    NonIncreasingBands { index: usize },
}

/// Audio output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate of the processing context
    pub sample_rate: u32,

    /// Output buffer size in frames
    pub buffer_size: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            buffer_size: 512,
        }
    }
}

/// Equalizer layout and compressor defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EqualizerConfig {
    /// Peaking band centers in Hz, strictly increasing
    pub band_frequencies: Vec<f32>,

    pub bass_frequency_hz: f32,

    pub treble_frequency_hz: f32,

    pub compressor: CompressorParams,
}

impl Default for EqualizerConfig {
    fn default() -> Self {
        Self {
            band_frequencies: FilterChain::DEFAULT_BANDS.to_vec(),
            bass_frequency_hz: FilterChain::DEFAULT_BASS_HZ,
            treble_frequency_hz: FilterChain::DEFAULT_TREBLE_HZ,
            compressor: CompressorParams::default(),
        }
    }
}

impl EqualizerConfig {
    /// Build the filter chain this configuration describes
    pub fn build_chain(&self) -> Result<FilterChain> {
        Ok(FilterChain::build(&self.band_frequencies)?
            .with_shelf_frequencies(self.bass_frequency_hz, self.treble_frequency_hz))
    }
}

/// Spectrum analyser configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyserConfig {
    pub fft_size: usize,
    pub smoothing: f32,
    pub min_db: f32,
    pub max_db: f32,
}

impl Default for AnalyserConfig {
    fn default() -> Self {
        let options = AnalyserOptions::default();
        Self {
            fft_size: options.fft_size,
            smoothing: options.smoothing_time_constant,
            min_db: options.min_decibels,
            max_db: options.max_decibels,
        }
    }
}

impl AnalyserConfig {
    pub fn options(&self) -> AnalyserOptions {
        AnalyserOptions {
            fft_size: self.fft_size,
            smoothing_time_constant: self.smoothing,
            min_decibels: self.min_db,
            max_decibels: self.max_db,
        }
    }
}

/// Visualizer cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizerConfig {
    pub frames_per_second: u32,
}

impl Default for VisualizerConfig {
    fn default() -> Self {
        Self {
            frames_per_second: 60,
        }
    }
}

/// Preset persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file holding custom presets and the last used preset.
    /// Relative paths resolve against the config directory.
    pub preset_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            preset_file: PathBuf::from("presets.json"),
        }
    }
}

/// Complete Ethereal configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EtherealConfig {
    pub audio: AudioConfig,
    pub equalizer: EqualizerConfig,
    pub analyser: AnalyserConfig,
    pub visualizer: VisualizerConfig,
    pub storage: StorageConfig,
}

impl EtherealConfig {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    /// Factory default configuration
    pub fn factory_default() -> Self {
        Self::default()
    }

    /// Check every section for values the graph cannot be built with
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be positive".to_string()));
        }
        if self.audio.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be positive".to_string()));
        }

        FilterChain::build(&self.equalizer.band_frequencies)?;

        self.analyser.options().validate().map_err(ConfigError::Invalid)?;

        if self.visualizer.frames_per_second == 0 {
            return Err(ConfigError::Invalid(
                "frames_per_second must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Manager for the main config file at `<config dir>/ethereal/config.toml`
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("config.toml");
        Self {
            config_dir,
            config_path,
        }
    }

    /// Manager for an explicit config file path
    pub fn with_path(config_path: PathBuf) -> Self {
        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            config_dir,
            config_path,
        }
    }

    /// Default config directory
    ///
    /// `~/.config/ethereal` on Linux, the platform equivalent elsewhere.
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("ethereal"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Resolve the preset file against the config directory
    pub fn preset_path(&self, config: &EtherealConfig) -> PathBuf {
        let file = &config.storage.preset_file;
        if file.is_absolute() {
            file.clone()
        } else {
            self.config_dir.join(file)
        }
    }

    /// Load configuration from file
    ///
    /// A missing file yields (and writes) the factory default. A corrupt or
    /// invalid file is copied to `config.toml.corrupt` and the factory
    /// default is returned.
    #[instrument(skip(self))]
    pub async fn load(&self) -> EtherealConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, creating factory default"
            );

            let config = EtherealConfig::factory_default();
            if let Err(e) = config.save_to_file(&self.config_path).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save factory default config"
                );
            }
            return config;
        }

        match EtherealConfig::load_from_file(&self.config_path).await {
            Ok(config) => config,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load config, using factory default"
                );

                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt config"
                    );
                }

                EtherealConfig::factory_default()
            }
        }
    }

    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &EtherealConfig) -> Result<()> {
        config.validate()?;
        fs::create_dir_all(&self.config_dir).await?;
        config.save_to_file(&self.config_path).await
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}
