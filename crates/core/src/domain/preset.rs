//! Equalizer presets and their persistence port

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

/// Store key holding the custom preset list
pub const CUSTOM_PRESETS_KEY: &str = "customEqPresets";

/// Store key holding the last applied preset name
pub const LAST_USED_PRESET_KEY: &str = "lastUsedEqPreset";

/// Preset applied at startup and after the active custom preset is deleted
pub const DEFAULT_PRESET: &str = "Flat";

/// A named band-gain curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub band_gains: Vec<f32>,
}

impl Preset {
    pub fn new(name: impl Into<String>, band_gains: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            band_gains,
        }
    }
}

/// Compile-time preset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuiltinPreset {
    pub name: &'static str,
    pub band_gains: &'static [f32],
}

impl BuiltinPreset {
    pub fn to_preset(&self) -> Preset {
        Preset::new(self.name, self.band_gains.to_vec())
    }
}

pub const BUILTIN_PRESETS: &[BuiltinPreset] = &[
    BuiltinPreset {
        name: "Flat",
        band_gains: &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    },
    BuiltinPreset {
        name: "Bass Boost",
        band_gains: &[7.0, 5.0, 3.0, 0.0, 0.0, 0.0, 0.0],
    },
    BuiltinPreset {
        name: "Treble Boost",
        band_gains: &[0.0, 0.0, 0.0, 1.0, 3.0, 5.0, 7.0],
    },
    BuiltinPreset {
        name: "Vocal",
        band_gains: &[-3.0, -2.0, 0.0, 4.0, 2.0, -1.0, 0.0],
    },
    BuiltinPreset {
        name: "Rock",
        band_gains: &[4.0, 3.0, -1.0, -2.0, 2.0, 4.0, 5.0],
    },
];

pub fn builtin_preset(name: &str) -> Option<&'static BuiltinPreset> {
    BUILTIN_PRESETS.iter().find(|p| p.name == name)
}

pub fn is_builtin(name: &str) -> bool {
    builtin_preset(name).is_some()
}

/// Stored shape of one custom preset under [`CUSTOM_PRESETS_KEY`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomPresetRecord {
    pub name: String,
    pub values: Vec<f32>,
}

impl From<&Preset> for CustomPresetRecord {
    fn from(preset: &Preset) -> Self {
        Self {
            name: preset.name.clone(),
            values: preset.band_gains.clone(),
        }
    }
}

impl From<CustomPresetRecord> for Preset {
    fn from(record: CustomPresetRecord) -> Self {
        Preset::new(record.name, record.values)
    }
}

/// Errors from a preset store backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Key-value persistence for presets
#[async_trait]
pub trait PresetStore: Send + Sync {
    /// Value stored under `key`, `None` if absent
    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn save(&self, key: &str, value: Value) -> Result<(), StoreError>;
}

/// Session-only store; can be told to fail for tests of degraded persistence
#[derive(Debug, Default)]
pub struct MemoryPresetStore {
    values: Mutex<HashMap<String, Value>>,
    failing: AtomicBool,
}

impl MemoryPresetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every load and save fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Raw value under `key`, bypassing the failure switch
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Write a raw value, bypassing the failure switch
    pub fn insert(&self, key: &str, value: Value) {
        self.values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.to_string(), value);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Backend("store unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PresetStore for MemoryPresetStore {
    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.check()?;
        Ok(self.get(key))
    }

    async fn save(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.check()?;
        self.insert(key, value);
        Ok(())
    }
}
