//! Subcommand implementations

pub mod config;
pub mod play;
pub mod presets;

use anyhow::Context;
use ethereal_core::domain::{
    ConfigManager, EqualizerController, EtherealConfig, PlaybackSlot,
};
use ethereal_infra::audio::{ElementRegistry, SoftwareRuntime};
use ethereal_infra::storage::JsonFilePresetStore;
use std::path::PathBuf;
use std::sync::Arc;

pub fn config_manager(path: Option<PathBuf>) -> anyhow::Result<ConfigManager> {
    match path {
        Some(path) => Ok(ConfigManager::with_path(path)),
        None => {
            let dir = ConfigManager::default_config_dir()
                .context("no config directory; pass --config")?;
            Ok(ConfigManager::new(dir))
        }
    }
}

/// Everything a command needs to drive the equalizer
pub struct Session {
    pub config: EtherealConfig,
    pub elements: Arc<ElementRegistry>,
    pub runtime: Arc<SoftwareRuntime>,
    pub slot: Arc<PlaybackSlot>,
    pub controller: EqualizerController,
}

impl Session {
    pub async fn open(manager: &ConfigManager) -> anyhow::Result<Self> {
        let config = manager.load().await;
        let elements = Arc::new(ElementRegistry::new());
        let runtime = Arc::new(SoftwareRuntime::new(
            config.audio.sample_rate,
            Arc::clone(&elements),
        ));
        let slot = Arc::new(PlaybackSlot::new());
        let store = Arc::new(JsonFilePresetStore::new(manager.preset_path(&config)));

        let controller = EqualizerController::from_config(
            runtime.clone(),
            &config,
            slot.clone(),
            store,
        )
        .context("failed to build the equalizer")?;

        if let Err(e) = controller.load_presets().await {
            tracing::warn!(error = %e, "Custom presets unavailable this session");
        }

        Ok(Self {
            config,
            elements,
            runtime,
            slot,
            controller,
        })
    }
}
