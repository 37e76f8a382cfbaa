//! Domain entities and business rules

pub mod audio;
pub mod config;
pub mod dsp;
pub mod equalizer;
pub mod filter_chain;
pub mod graph;
pub mod preset;
pub mod visualizer;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{
    AnalyserOptions, AudioParam, AudioRuntime, ConnectionState, ElementId, FilterType, NodeId,
    NodeKind, PlaybackElementProvider, PlaybackHandle, PlaybackSlot, RuntimeError,
};
pub use config::{ConfigError, ConfigManager, EtherealConfig};
pub use dsp::{BiquadCoeffs, BiquadFilter, Compressor, CompressorParams, Effect, SmoothedValue, StereoBiquad};
pub use equalizer::{CompressorSettings, EqError, EqualizerController, EqualizerView};
pub use filter_chain::{FilterChain, FilterChainState, FilterError, FilterRole, FilterStageSpec, ShelfSettings};
pub use graph::{AnalyserTap, BindError, SignalGraph};
pub use preset::{MemoryPresetStore, Preset, PresetStore, StoreError, BUILTIN_PRESETS};
pub use visualizer::{SpectrumFrame, VisualizerSampler};
