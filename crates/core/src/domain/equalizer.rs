//! Equalizer controller
//!
//! [`EqualizerController`] combines a [`FilterChain`] and a [`SignalGraph`]
//! behind enable/connect semantics and manages presets.
//!
//! Enabling never rewires the filter stages. While disabled the graph stays
//! wired but receives a flat chain and unity gain, so the audible path is
//! the same single source-to-output path in both states. The compressor is
//! spliced in only while both the equalizer and the compressor are enabled.

use crate::domain::audio::{
    AudioRuntime, ConnectionState, PlaybackElementProvider, PlaybackHandle, RuntimeError,
};
use crate::domain::config::{ConfigError, EtherealConfig};
use crate::domain::dsp::{clamp_gain_db, db_to_gain, params, CompressorParams};
use crate::domain::filter_chain::{FilterChain, FilterChainState, FilterError, ShelfSettings};
use crate::domain::graph::{BindError, SignalGraph};
use crate::domain::preset::{
    builtin_preset, is_builtin, CustomPresetRecord, Preset, PresetStore, StoreError,
    BUILTIN_PRESETS, CUSTOM_PRESETS_KEY, DEFAULT_PRESET, LAST_USED_PRESET_KEY,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Errors surfaced by the controller
#[derive(Debug, Error)]
pub enum EqError {
    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Preset not found: {0}")]
    PresetNotFound(String),

    #[error("Preset name is reserved by a built-in preset: {0}")]
    ReservedPresetName(String),

    #[error("Invalid preset name: {0:?}")]
    InvalidPresetName(String),

    #[error("No playback element available")]
    NoPlaybackElement,

    #[error("Preset persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, EqError>;

/// Compressor switch plus its parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressorSettings {
    pub enabled: bool,
    #[serde(flatten)]
    pub params: CompressorParams,
}

/// Read-only snapshot of the controller for UIs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EqualizerView {
    pub enabled: bool,
    pub connected: bool,
    pub connection: ConnectionState,
    pub band_frequencies: Vec<f32>,
    pub band_gains: Vec<f32>,
    pub bass_filter: ShelfSettings,
    pub treble_filter: ShelfSettings,
    pub compressor: CompressorSettings,
    pub preamp_db: f32,
    pub active_preset: Option<String>,
    pub custom_presets: Vec<String>,
    /// Custom presets are session-only until a store write succeeds
    pub persistence_degraded: bool,
}

#[derive(Debug)]
struct ControllerState {
    chain: FilterChain,
    enabled: bool,
    connected: bool,
    compressor: CompressorSettings,
    preamp_db: f32,
    active_preset: Option<String>,
    custom: Vec<Preset>,
    /// Stored custom presets have been read and folded into `custom`
    store_loaded: bool,
    persistence_degraded: bool,
}

impl ControllerState {
    /// Chain the graph should hear: the real one when enabled, flat otherwise
    fn effective_chain(&self) -> FilterChainState {
        let snapshot = self.chain.snapshot();
        if self.enabled {
            snapshot
        } else {
            snapshot.flattened()
        }
    }

    fn effective_gain(&self) -> f32 {
        if self.enabled {
            db_to_gain(self.preamp_db)
        } else {
            1.0
        }
    }

    fn compressor_wanted(&self) -> bool {
        self.enabled && self.compressor.enabled
    }

    fn find_preset(&self, name: &str) -> Option<Vec<f32>> {
        builtin_preset(name)
            .map(|p| p.band_gains.to_vec())
            .or_else(|| {
                self.custom
                    .iter()
                    .find(|p| p.name == name)
                    .map(|p| p.band_gains.clone())
            })
    }

    fn load_gains(&mut self, name: &str, gains: &[f32]) {
        self.chain.set_all_band_gains(gains);
        let bass = self.chain.bass_shelf();
        let treble = self.chain.treble_shelf();
        self.chain
            .set_bass_shelf(ShelfSettings::new(bass.frequency_hz, 0.0));
        self.chain
            .set_treble_shelf(ShelfSettings::new(treble.frequency_hz, 0.0));
        self.active_preset = Some(name.to_string());
    }

    fn custom_records(&self) -> Vec<CustomPresetRecord> {
        self.custom.iter().map(CustomPresetRecord::from).collect()
    }
}

/// Public equalizer state machine
pub struct EqualizerController {
    graph: Arc<SignalGraph>,
    provider: Arc<dyn PlaybackElementProvider>,
    store: Arc<dyn PresetStore>,
    state: Mutex<ControllerState>,
    view_tx: watch::Sender<EqualizerView>,
    /// Serializes connect, disconnect and enable toggles
    topology: tokio::sync::Mutex<()>,
    /// Serializes store writes so they land in mutation order
    persist: tokio::sync::Mutex<()>,
}

impl EqualizerController {
    /// Controller over an existing graph; starts disabled and disconnected
    /// with the built-in default preset active.
    pub fn new(
        graph: Arc<SignalGraph>,
        chain: FilterChain,
        provider: Arc<dyn PlaybackElementProvider>,
        store: Arc<dyn PresetStore>,
    ) -> Result<Self> {
        let state = ControllerState {
            chain,
            enabled: false,
            connected: false,
            compressor: CompressorSettings {
                enabled: false,
                params: CompressorParams::default(),
            },
            preamp_db: 0.0,
            active_preset: Some(DEFAULT_PRESET.to_string()),
            custom: Vec::new(),
            store_loaded: false,
            persistence_degraded: false,
        };
        let view = Self::render_view(&state, graph.connection_state());
        let (view_tx, _) = watch::channel(view);

        let controller = Self {
            graph,
            provider,
            store,
            state: Mutex::new(state),
            view_tx,
            topology: tokio::sync::Mutex::new(()),
            persist: tokio::sync::Mutex::new(()),
        };
        {
            let state = controller.state();
            controller.sync_params(&state)?;
            controller.graph.set_compressor_params(state.compressor.params)?;
        }
        Ok(controller)
    }

    /// Build graph and controller from configuration
    pub fn from_config(
        runtime: Arc<dyn AudioRuntime>,
        config: &EtherealConfig,
        provider: Arc<dyn PlaybackElementProvider>,
        store: Arc<dyn PresetStore>,
    ) -> Result<Self> {
        config.validate()?;
        let chain = config.equalizer.build_chain()?;
        let graph = Arc::new(SignalGraph::new(
            runtime,
            chain.snapshot().flattened(),
            config.analyser.options(),
        )?);

        let controller = Self::new(graph, chain, provider, store)?;
        controller.set_compressor_params(config.equalizer.compressor)?;
        Ok(controller)
    }

    pub fn graph(&self) -> &Arc<SignalGraph> {
        &self.graph
    }

    /// Current state snapshot
    pub fn view(&self) -> EqualizerView {
        let state = self.state();
        Self::render_view(&state, self.graph.connection_state())
    }

    /// Receiver that sees every state change
    pub fn subscribe(&self) -> watch::Receiver<EqualizerView> {
        self.view_tx.subscribe()
    }

    /// Bind the graph to `handle`.
    ///
    /// Connecting while already connected re-syncs parameters and the
    /// compressor splice instead of failing.
    #[instrument(skip(self, handle), fields(element = %handle.element()))]
    pub async fn connect(&self, handle: &PlaybackHandle) -> Result<()> {
        let _topology = self.topology.lock().await;
        let result = self.connect_locked(handle).await;
        self.publish();
        result
    }

    /// Connect to whatever element the provider currently exposes
    pub async fn connect_current(&self) -> Result<()> {
        let handle = self
            .provider
            .playback_handle()
            .ok_or(EqError::NoPlaybackElement)?;
        self.connect(&handle).await
    }

    async fn connect_locked(&self, handle: &PlaybackHandle) -> Result<()> {
        let wanted = {
            let state = self.state();
            self.sync_params(&state)?;
            state.compressor_wanted()
        };
        self.graph.set_compressor_enabled(wanted).await?;

        match self.graph.bind(handle).await {
            Ok(()) => {
                self.state().connected = true;
                info!("Equalizer connected");
                Ok(())
            }
            Err(e) => {
                // A graph still wired to its first element keeps playing
                self.state().connected = self.graph.is_connected();
                warn!(error = %e, "Equalizer connection failed");
                Err(e.into())
            }
        }
    }

    /// Unwire the graph; leaves the equalizer disconnected and disabled
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<()> {
        let _topology = self.topology.lock().await;
        let result = self.graph.disconnect().await;

        {
            let mut state = self.state();
            state.connected = false;
            state.enabled = false;
            self.sync_params(&state)?;
        }
        self.graph.set_compressor_enabled(false).await?;
        self.publish();

        info!("Equalizer disconnected");
        result.map_err(EqError::from)
    }

    /// Turn the filter effect on or off.
    ///
    /// A disconnected equalizer connects to the provider's element first. If
    /// that fails the flag is still updated and the connection error is
    /// returned.
    #[instrument(skip(self))]
    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        let _topology = self.topology.lock().await;

        let connected = self.state().connected;
        let connect_error = if connected {
            None
        } else {
            debug!("Equalizer not connected, connecting first");
            match self.provider.playback_handle() {
                Some(handle) => self.connect_locked(&handle).await.err(),
                None => Some(EqError::NoPlaybackElement),
            }
        };

        let wanted = {
            let mut state = self.state();
            state.enabled = enabled;
            self.sync_params(&state)?;
            state.compressor_wanted()
        };
        self.graph.set_compressor_enabled(wanted).await?;
        self.publish();

        info!(enabled, "Equalizer toggled");
        match connect_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Compressor switch; it is only in the signal path while the
    /// equalizer is enabled too.
    #[instrument(skip(self))]
    pub async fn set_compressor_enabled(&self, enabled: bool) -> Result<()> {
        let _topology = self.topology.lock().await;
        let wanted = {
            let mut state = self.state();
            state.compressor.enabled = enabled;
            state.compressor_wanted()
        };
        let result = self.graph.set_compressor_enabled(wanted).await;
        self.publish();
        result.map_err(EqError::from)
    }

    pub fn set_compressor_params(&self, params: CompressorParams) -> Result<()> {
        let params = params.clamped();
        self.mutate(|state| {
            state.compressor.params = params;
            Ok(())
        })?;
        self.graph.set_compressor_params(params)?;
        Ok(())
    }

    /// Preamp in dB, clamped to [-12, 12]
    pub fn set_preamp(&self, db: f32) -> Result<()> {
        let db = if db.is_finite() {
            db.clamp(params::PREAMP_DB_MIN, params::PREAMP_DB_MAX)
        } else {
            0.0
        };
        self.mutate(|state| {
            state.preamp_db = db;
            Ok(())
        })
    }

    pub fn set_band_gain(&self, index: usize, db: f32) -> Result<()> {
        self.mutate(|state| {
            state.chain.set_band_gain(index, db)?;
            state.active_preset = None;
            Ok(())
        })
    }

    /// Set every band; mismatched lengths are padded or truncated
    pub fn set_all_band_gains(&self, values: &[f32]) -> Result<()> {
        self.mutate(|state| {
            state.chain.set_all_band_gains(values);
            state.active_preset = None;
            Ok(())
        })
    }

    pub fn set_bass_shelf(&self, settings: ShelfSettings) -> Result<()> {
        self.mutate(|state| {
            state.chain.set_bass_shelf(settings);
            state.active_preset = None;
            Ok(())
        })
    }

    pub fn set_treble_shelf(&self, settings: ShelfSettings) -> Result<()> {
        self.mutate(|state| {
            state.chain.set_treble_shelf(settings);
            state.active_preset = None;
            Ok(())
        })
    }

    /// All band, bass and treble gains to 0 dB
    pub fn reset(&self) -> Result<()> {
        self.mutate(|state| {
            state.chain.reset();
            state.active_preset = Some(DEFAULT_PRESET.to_string());
            Ok(())
        })
    }

    /// Apply a built-in preset, or a custom one of that name.
    ///
    /// Shelf gains return to 0 dB. The store is not touched.
    pub fn apply_preset(&self, name: &str) -> Result<()> {
        self.mutate(|state| {
            let gains = state
                .find_preset(name)
                .ok_or_else(|| EqError::PresetNotFound(name.to_string()))?;
            state.load_gains(name, &gains);
            debug!(name, "Preset applied");
            Ok(())
        })
    }

    /// All preset names: built-ins first, then custom presets in save order
    pub fn preset_names(&self) -> Vec<String> {
        let state = self.state();
        BUILTIN_PRESETS
            .iter()
            .map(|p| p.name.to_string())
            .chain(state.custom.iter().map(|p| p.name.clone()))
            .collect()
    }

    pub fn custom_presets(&self) -> Vec<Preset> {
        self.state().custom.clone()
    }

    /// Save `band_gains` under `name`, replacing a custom preset of the
    /// same name.
    ///
    /// The in-memory list is updated even when the store write fails.
    #[instrument(skip(self, band_gains))]
    pub async fn save_custom_preset(&self, name: &str, band_gains: Vec<f32>) -> Result<()> {
        Self::check_custom_name(name)?;
        let gains: Vec<f32> = band_gains.into_iter().map(clamp_gain_db).collect();

        let _persist = self.persist.lock().await;
        let merged = self.merge_stored().await;
        let records = {
            let mut state = self.state();
            match state.custom.iter_mut().find(|p| p.name == name) {
                Some(existing) => existing.band_gains = gains,
                None => state.custom.push(Preset::new(name, gains)),
            }
            state.custom_records()
        };
        self.publish();
        info!(name, "Custom preset saved");

        merged?;
        self.write_custom(records).await
    }

    /// Save the current band gains as a custom preset
    pub async fn save_current_as(&self, name: &str) -> Result<()> {
        let gains = self.state().chain.band_gains().to_vec();
        self.save_custom_preset(name, gains).await
    }

    /// Remove a custom preset; deleting the active one applies the default
    #[instrument(skip(self))]
    pub async fn delete_custom_preset(&self, name: &str) -> Result<()> {
        if is_builtin(name) {
            return Err(EqError::ReservedPresetName(name.to_string()));
        }

        let _persist = self.persist.lock().await;
        let merged = self.merge_stored().await;
        let records = {
            let mut state = self.state();
            let position = state
                .custom
                .iter()
                .position(|p| p.name == name)
                .ok_or_else(|| EqError::PresetNotFound(name.to_string()))?;
            state.custom.remove(position);

            if state.active_preset.as_deref() == Some(name) {
                let gains = state.find_preset(DEFAULT_PRESET).unwrap_or_default();
                state.load_gains(DEFAULT_PRESET, &gains);
                self.sync_params(&state)?;
                info!(name, fallback = DEFAULT_PRESET, "Active preset deleted");
            }
            state.custom_records()
        };
        self.publish();

        merged?;
        self.write_custom(records).await
    }

    /// Restore custom presets and the last used preset from the store.
    ///
    /// Malformed stored values are logged and ignored.
    #[instrument(skip(self))]
    pub async fn load_presets(&self) -> Result<()> {
        let custom = match self.store.load(CUSTOM_PRESETS_KEY).await {
            Ok(value) => Self::parse_custom(value),
            Err(e) => return Err(self.degrade(e)),
        };
        let last_used = match self.store.load(LAST_USED_PRESET_KEY).await {
            Ok(Some(Value::String(name))) => Some(name),
            Ok(Some(other)) => {
                warn!(value = %other, "Ignoring malformed last used preset");
                None
            }
            Ok(None) => None,
            Err(e) => return Err(self.degrade(e)),
        };

        {
            let mut state = self.state();
            let session_only: Vec<Preset> = std::mem::take(&mut state.custom)
                .into_iter()
                .filter(|p| !custom.iter().any(|stored| stored.name == p.name))
                .collect();
            state.custom = custom;
            state.custom.extend(session_only);
            state.store_loaded = true;
            state.persistence_degraded = false;
            if let Some(name) = last_used {
                match state.find_preset(&name) {
                    Some(gains) => {
                        state.load_gains(&name, &gains);
                        self.sync_params(&state)?;
                    }
                    None => warn!(name = %name, "Last used preset no longer exists"),
                }
            }
            info!(custom = state.custom.len(), "Presets loaded");
        }
        self.publish();
        Ok(())
    }

    /// Record the active preset as the last used one
    #[instrument(skip(self))]
    pub async fn persist_last_used(&self) -> Result<()> {
        let _persist = self.persist.lock().await;
        let Some(name) = self.state().active_preset.clone() else {
            return Ok(());
        };
        let store_loaded = self.state().store_loaded;
        if !store_loaded {
            // Presets saved while the store was unreachable go out first
            self.merge_stored().await?;
            let records = self.state().custom_records();
            self.write_custom(records).await?;
        }
        match self
            .store
            .save(LAST_USED_PRESET_KEY, Value::String(name))
            .await
        {
            Ok(()) => {
                self.recover();
                Ok(())
            }
            Err(e) => Err(self.degrade(e)),
        }
    }

    fn check_custom_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(EqError::InvalidPresetName(name.to_string()));
        }
        if is_builtin(name) {
            return Err(EqError::ReservedPresetName(name.to_string()));
        }
        Ok(())
    }

    fn parse_custom(value: Option<Value>) -> Vec<Preset> {
        let Some(value) = value else {
            return Vec::new();
        };
        let records: Vec<CustomPresetRecord> = match serde_json::from_value(value) {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed custom presets");
                return Vec::new();
            }
        };

        let mut presets: Vec<Preset> = Vec::with_capacity(records.len());
        for record in records {
            if Self::check_custom_name(&record.name).is_err() {
                warn!(name = %record.name, "Skipping stored preset with unusable name");
                continue;
            }
            let preset = Preset::from(record);
            match presets.iter_mut().find(|p| p.name == preset.name) {
                Some(existing) => *existing = preset,
                None => presets.push(preset),
            }
        }
        presets
    }

    async fn write_custom(&self, records: Vec<CustomPresetRecord>) -> Result<()> {
        let value = serde_json::to_value(records).map_err(StoreError::from)?;
        match self.store.save(CUSTOM_PRESETS_KEY, value).await {
            Ok(()) => {
                self.recover();
                Ok(())
            }
            Err(e) => Err(self.degrade(e)),
        }
    }

    /// Fold stored custom presets into the session list the first time the
    /// store can be read. Session entries win on a name clash. Until this
    /// succeeds the custom key is never written.
    async fn merge_stored(&self) -> Result<()> {
        let store_loaded = self.state().store_loaded;
        if store_loaded {
            return Ok(());
        }
        let stored = match self.store.load(CUSTOM_PRESETS_KEY).await {
            Ok(value) => Self::parse_custom(value),
            Err(e) => return Err(self.degrade(e)),
        };

        let mut state = self.state();
        let mut merged = 0usize;
        for preset in stored {
            if !state.custom.iter().any(|p| p.name == preset.name) {
                state.custom.push(preset);
                merged += 1;
            }
        }
        state.store_loaded = true;
        debug!(merged, "Stored custom presets merged into session");
        Ok(())
    }

    fn degrade(&self, error: StoreError) -> EqError {
        warn!(error = %error, "Preset store unavailable, presets are session-only");
        self.state().persistence_degraded = true;
        self.publish();
        EqError::Persistence(error)
    }

    fn recover(&self) {
        let was_degraded = {
            let mut state = self.state();
            // Without a merged list the custom presets are still session-only
            state.store_loaded && std::mem::replace(&mut state.persistence_degraded, false)
        };
        if was_degraded {
            info!("Preset store available again");
            self.publish();
        }
    }

    /// Apply `f`, then push the effective chain and gain and publish
    fn mutate(&self, f: impl FnOnce(&mut ControllerState) -> Result<()>) -> Result<()> {
        {
            let mut state = self.state();
            f(&mut *state)?;
            self.sync_params(&state)?;
        }
        self.publish();
        Ok(())
    }

    fn sync_params(&self, state: &ControllerState) -> Result<()> {
        self.graph.apply_filter_chain(&state.effective_chain())?;
        self.graph.set_output_gain(state.effective_gain())?;
        Ok(())
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.view());
    }

    fn render_view(state: &ControllerState, connection: ConnectionState) -> EqualizerView {
        let snapshot = state.chain.snapshot();
        EqualizerView {
            enabled: state.enabled,
            connected: state.connected,
            connection,
            band_frequencies: snapshot.band_frequencies,
            band_gains: snapshot.bands,
            bass_filter: snapshot.bass,
            treble_filter: snapshot.treble,
            compressor: state.compressor,
            preamp_db: state.preamp_db,
            active_preset: state.active_preset.clone(),
            custom_presets: state.custom.iter().map(|p| p.name.clone()).collect(),
            persistence_degraded: state.persistence_degraded,
        }
    }

    fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audio::{
        AnalyserOptions, AudioParam, ElementId, FilterType, NodeKind, PlaybackSlot,
    };
    use crate::domain::preset::MemoryPresetStore;
    use crate::testing::RecordingRuntime;
    use serde_json::json;

    struct Fixture {
        runtime: Arc<RecordingRuntime>,
        slot: Arc<PlaybackSlot>,
        store: Arc<MemoryPresetStore>,
        controller: EqualizerController,
    }

    fn fixture() -> Fixture {
        let runtime = Arc::new(RecordingRuntime::new());
        let slot = Arc::new(PlaybackSlot::with_handle(handle()));
        let store = Arc::new(MemoryPresetStore::new());
        let chain = FilterChain::default();
        let graph = SignalGraph::new(runtime.clone(), chain.snapshot(), AnalyserOptions::default())
            .map(Arc::new)
            .unwrap();
        let controller =
            EqualizerController::new(graph, chain, slot.clone(), store.clone()).unwrap();
        Fixture {
            runtime,
            slot,
            store,
            controller,
        }
    }

    fn handle() -> PlaybackHandle {
        PlaybackHandle::new(ElementId::new(1), "audio")
    }

    fn band_node(runtime: &RecordingRuntime, index: usize) -> crate::domain::audio::NodeId {
        runtime.nodes_of_kind(NodeKind::Biquad(FilterType::Peaking))[index]
    }

    fn gain_node(runtime: &RecordingRuntime) -> crate::domain::audio::NodeId {
        runtime.nodes_of_kind(NodeKind::Gain)[0]
    }

    #[tokio::test]
    async fn test_initial_view() {
        let f = fixture();
        let view = f.controller.view();
        assert!(!view.enabled);
        assert!(!view.connected);
        assert_eq!(view.connection, ConnectionState::Unbound);
        assert_eq!(view.band_gains, vec![0.0; 6]);
        assert_eq!(view.active_preset.as_deref(), Some("Flat"));
        assert_eq!(view.compressor.params, CompressorParams::default());
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let f = fixture();
        f.controller.connect(&handle()).await.unwrap();
        f.controller.connect(&handle()).await.unwrap();

        assert!(f.controller.view().connected);
        assert_eq!(f.runtime.source_creations(), 1);
    }

    #[tokio::test]
    async fn test_connect_current_without_element() {
        let f = fixture();
        f.slot.clear();
        assert!(matches!(
            f.controller.connect_current().await,
            Err(EqError::NoPlaybackElement)
        ));
    }

    #[tokio::test]
    async fn test_bound_elsewhere_keeps_disconnected() {
        let f = fixture();
        f.runtime.mark_bound_elsewhere(handle().element());

        let err = f.controller.connect(&handle()).await.unwrap_err();
        assert!(matches!(
            err,
            EqError::Bind(BindError::AlreadyBoundElsewhere { .. })
        ));
        assert!(!f.controller.view().connected);
        assert_eq!(f.controller.view().connection, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_set_enabled_auto_connects() {
        let f = fixture();
        f.controller.set_enabled(true).await.unwrap();

        let view = f.controller.view();
        assert!(view.enabled);
        assert!(view.connected);
        assert_eq!(f.runtime.source_creations(), 1);
    }

    #[tokio::test]
    async fn test_disabled_equalizer_is_flat_but_wired() {
        let f = fixture();
        f.controller.set_enabled(true).await.unwrap();
        f.controller.set_band_gain(0, 7.0).unwrap();
        f.controller.set_preamp(6.0).unwrap();
        let edges = f.runtime.edges();

        assert_eq!(f.runtime.param(band_node(&f.runtime, 0), AudioParam::Gain), Some(7.0));
        let preamp = f.runtime.param(gain_node(&f.runtime), AudioParam::Gain).unwrap();
        assert!((preamp - db_to_gain(6.0)).abs() < 1e-6);

        f.controller.set_enabled(false).await.unwrap();

        assert_eq!(f.runtime.edges(), edges);
        assert_eq!(f.runtime.param(band_node(&f.runtime, 0), AudioParam::Gain), Some(0.0));
        assert_eq!(f.runtime.param(gain_node(&f.runtime), AudioParam::Gain), Some(1.0));
        // The user's curve is kept for re-enabling
        assert_eq!(f.controller.view().band_gains[0], 7.0);

        f.controller.set_enabled(true).await.unwrap();
        assert_eq!(f.runtime.param(band_node(&f.runtime, 0), AudioParam::Gain), Some(7.0));
    }

    #[tokio::test]
    async fn test_disconnect_clears_flags() {
        let f = fixture();
        f.controller.set_enabled(true).await.unwrap();
        f.controller.disconnect().await.unwrap();

        let view = f.controller.view();
        assert!(!view.connected);
        assert!(!view.enabled);
        assert_eq!(view.connection, ConnectionState::Disconnected);
        assert_eq!(f.runtime.edge_count(), 0);

        f.controller.connect(&handle()).await.unwrap();
        assert_eq!(f.runtime.source_creations(), 1);
        assert!(f.controller.view().connected);
    }

    #[tokio::test]
    async fn test_compressor_follows_enabled() {
        let f = fixture();
        f.controller.connect(&handle()).await.unwrap();
        let gain = gain_node(&f.runtime);
        let compressor = f.runtime.nodes_of_kind(NodeKind::Compressor)[0];

        f.controller.set_compressor_enabled(true).await.unwrap();
        assert!(!f.runtime.has_edge(gain, compressor));

        f.controller.set_enabled(true).await.unwrap();
        assert!(f.runtime.has_edge(gain, compressor));

        f.controller.set_enabled(false).await.unwrap();
        assert!(!f.runtime.has_edge(gain, compressor));
        assert!(f.runtime.has_edge(gain, RecordingRuntime::DESTINATION));
    }

    #[tokio::test]
    async fn test_compressor_params_clamped() {
        let f = fixture();
        f.controller.connect(&handle()).await.unwrap();
        f.controller
            .set_compressor_params(CompressorParams {
                threshold_db: -200.0,
                ratio: 0.5,
                ..CompressorParams::default()
            })
            .unwrap();

        let params = f.controller.view().compressor.params;
        assert_eq!(params.threshold_db, -100.0);
        assert_eq!(params.ratio, 1.0);
        let compressor = f.runtime.nodes_of_kind(NodeKind::Compressor)[0];
        assert_eq!(f.runtime.param(compressor, AudioParam::Ratio), Some(1.0));
    }

    #[tokio::test]
    async fn test_band_index_out_of_range() {
        let f = fixture();
        f.controller.set_band_gain(1, 3.0).unwrap();
        let before = f.controller.view();

        let err = f.controller.set_band_gain(6, 3.0).unwrap_err();
        assert!(matches!(
            err,
            EqError::Filter(FilterError::IndexOutOfRange { index: 6, bands: 6 })
        ));
        assert_eq!(f.controller.view(), before);
    }

    #[tokio::test]
    async fn test_flat_after_mutations() {
        let f = fixture();
        f.controller.set_all_band_gains(&[3.0, -4.0, 5.0, 1.0, 2.0, 12.0]).unwrap();
        f.controller.set_bass_shelf(ShelfSettings::new(150.0, 6.0)).unwrap();
        f.controller.set_treble_shelf(ShelfSettings::new(3000.0, -3.0)).unwrap();
        assert_eq!(f.controller.view().active_preset, None);

        f.controller.apply_preset("Flat").unwrap();

        let view = f.controller.view();
        assert_eq!(view.band_gains, vec![0.0; 6]);
        assert_eq!(view.bass_filter.gain_db, 0.0);
        assert_eq!(view.treble_filter.gain_db, 0.0);
        assert_eq!(view.bass_filter.frequency_hz, 150.0);
        assert_eq!(view.active_preset.as_deref(), Some("Flat"));
    }

    #[tokio::test]
    async fn test_builtin_preset_truncated_to_band_count() {
        let f = fixture();
        f.controller.apply_preset("Rock").unwrap();
        assert_eq!(
            f.controller.view().band_gains,
            vec![4.0, 3.0, -1.0, -2.0, 2.0, 4.0]
        );
    }

    #[tokio::test]
    async fn test_unknown_preset() {
        let f = fixture();
        f.controller.set_band_gain(0, 2.0).unwrap();
        let before = f.controller.view();

        assert!(matches!(
            f.controller.apply_preset("Nope"),
            Err(EqError::PresetNotFound(_))
        ));
        assert_eq!(f.controller.view(), before);
    }

    #[tokio::test]
    async fn test_save_then_apply_custom_preset() {
        let f = fixture();
        let gains = vec![1.5, -2.0, 3.0, 0.0, 4.5, -6.0];

        f.controller.save_custom_preset("My EQ", gains.clone()).await.unwrap();
        f.controller.save_custom_preset("My EQ", gains.clone()).await.unwrap();
        f.controller.apply_preset("My EQ").unwrap();

        assert_eq!(f.controller.view().band_gains, gains);
        assert_eq!(f.controller.custom_presets().len(), 1);

        let stored = f.store.get(CUSTOM_PRESETS_KEY).unwrap();
        assert_eq!(
            stored,
            json!([{ "name": "My EQ", "values": [1.5, -2.0, 3.0, 0.0, 4.5, -6.0] }])
        );
    }

    #[tokio::test]
    async fn test_save_overwrites_existing() {
        let f = fixture();
        f.controller.save_custom_preset("Mine", vec![1.0; 6]).await.unwrap();
        f.controller.save_custom_preset("Mine", vec![2.0; 6]).await.unwrap();

        let presets = f.controller.custom_presets();
        assert_eq!(presets.len(), 1);
        assert_eq!(presets[0].band_gains, vec![2.0; 6]);
    }

    #[tokio::test]
    async fn test_custom_names_validated() {
        let f = fixture();
        assert!(matches!(
            f.controller.save_custom_preset("Rock", vec![0.0; 6]).await,
            Err(EqError::ReservedPresetName(_))
        ));
        assert!(matches!(
            f.controller.save_custom_preset("  ", vec![0.0; 6]).await,
            Err(EqError::InvalidPresetName(_))
        ));
        assert!(matches!(
            f.controller.delete_custom_preset("Flat").await,
            Err(EqError::ReservedPresetName(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_active_preset_falls_back() {
        let f = fixture();
        f.controller.save_custom_preset("Mine", vec![5.0; 6]).await.unwrap();
        f.controller.apply_preset("Mine").unwrap();

        f.controller.delete_custom_preset("Mine").await.unwrap();

        let view = f.controller.view();
        assert_eq!(view.active_preset.as_deref(), Some(DEFAULT_PRESET));
        assert_eq!(view.band_gains, vec![0.0; 6]);
        assert!(matches!(
            f.controller.apply_preset("Mine"),
            Err(EqError::PresetNotFound(_))
        ));
        assert!(matches!(
            f.controller.delete_custom_preset("Mine").await,
            Err(EqError::PresetNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_inactive_preset_keeps_curve() {
        let f = fixture();
        f.controller.save_custom_preset("Mine", vec![5.0; 6]).await.unwrap();
        f.controller.apply_preset("Vocal").unwrap();

        f.controller.delete_custom_preset("Mine").await.unwrap();

        assert_eq!(f.controller.view().active_preset.as_deref(), Some("Vocal"));
    }

    #[tokio::test]
    async fn test_persistence_failure_degrades() {
        let f = fixture();
        f.store.set_failing(true);

        let err = f
            .controller
            .save_custom_preset("Session", vec![1.0; 6])
            .await
            .unwrap_err();
        assert!(matches!(err, EqError::Persistence(_)));

        let view = f.controller.view();
        assert!(view.persistence_degraded);
        assert_eq!(view.custom_presets, vec!["Session".to_string()]);
        f.controller.apply_preset("Session").unwrap();

        f.store.set_failing(false);
        f.controller.persist_last_used().await.unwrap();
        assert!(!f.controller.view().persistence_degraded);
        assert_eq!(f.store.get(LAST_USED_PRESET_KEY), Some(json!("Session")));
        assert_eq!(
            f.store.get(CUSTOM_PRESETS_KEY),
            Some(json!([{ "name": "Session", "values": [1.0, 1.0, 1.0, 1.0, 1.0, 1.0] }]))
        );
    }

    #[tokio::test]
    async fn test_save_after_failed_load_keeps_stored_presets() {
        let f = fixture();
        f.store.insert(
            CUSTOM_PRESETS_KEY,
            json!([{ "name": "Night", "values": [-2, -1, 0, 1, 2, 3] }]),
        );
        f.store.set_failing(true);
        assert!(matches!(
            f.controller.load_presets().await,
            Err(EqError::Persistence(_))
        ));

        // Still unreachable: the change stays in the session only
        let err = f
            .controller
            .save_custom_preset("New", vec![2.0; 6])
            .await
            .unwrap_err();
        assert!(matches!(err, EqError::Persistence(_)));
        assert!(f.controller.view().persistence_degraded);
        assert_eq!(
            f.store.get(CUSTOM_PRESETS_KEY),
            Some(json!([{ "name": "Night", "values": [-2, -1, 0, 1, 2, 3] }]))
        );

        f.store.set_failing(false);
        f.controller
            .save_custom_preset("Newer", vec![3.0; 6])
            .await
            .unwrap();

        let names: Vec<String> = serde_json::from_value::<Vec<CustomPresetRecord>>(
            f.store.get(CUSTOM_PRESETS_KEY).unwrap(),
        )
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
        assert_eq!(names, vec!["New", "Night", "Newer"]);
        assert!(!f.controller.view().persistence_degraded);
        f.controller.apply_preset("Night").unwrap();
    }

    #[tokio::test]
    async fn test_delete_before_load_keeps_other_stored_presets() {
        let f = fixture();
        f.store.insert(
            CUSTOM_PRESETS_KEY,
            json!([
                { "name": "A", "values": [1, 1, 1, 1, 1, 1] },
                { "name": "B", "values": [2, 2, 2, 2, 2, 2] }
            ]),
        );

        f.controller.delete_custom_preset("A").await.unwrap();

        assert_eq!(f.controller.view().custom_presets, vec!["B".to_string()]);
        assert_eq!(
            f.store.get(CUSTOM_PRESETS_KEY),
            Some(json!([{ "name": "B", "values": [2.0, 2.0, 2.0, 2.0, 2.0, 2.0] }]))
        );
    }

    #[tokio::test]
    async fn test_other_handle_leaves_connection_intact() {
        let f = fixture();
        f.controller.set_enabled(true).await.unwrap();

        let other = PlaybackHandle::new(ElementId::new(2), "remounted");
        let err = f.controller.connect(&other).await.unwrap_err();
        assert!(matches!(
            err,
            EqError::Bind(BindError::DifferentHandle { .. })
        ));

        let view = f.controller.view();
        assert!(view.connected);
        assert!(view.enabled);
        assert_eq!(view.connection, ConnectionState::Connected);
        assert_eq!(f.runtime.edge_count(), 12);
    }

    #[tokio::test]
    async fn test_load_presets_restores_state() {
        let f = fixture();
        f.store.insert(
            CUSTOM_PRESETS_KEY,
            json!([
                { "name": "Night", "values": [-2, -1, 0, 1, 2, 3] },
                { "name": "Flat", "values": [9, 9, 9, 9, 9, 9] }
            ]),
        );
        f.store.insert(LAST_USED_PRESET_KEY, json!("Night"));

        f.controller.load_presets().await.unwrap();

        let view = f.controller.view();
        assert_eq!(view.custom_presets, vec!["Night".to_string()]);
        assert_eq!(view.active_preset.as_deref(), Some("Night"));
        assert_eq!(view.band_gains, vec![-2.0, -1.0, 0.0, 1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_load_presets_ignores_malformed_values() {
        let f = fixture();
        f.store.insert(CUSTOM_PRESETS_KEY, json!({ "not": "a list" }));
        f.store.insert(LAST_USED_PRESET_KEY, json!(42));

        f.controller.load_presets().await.unwrap();

        let view = f.controller.view();
        assert!(view.custom_presets.is_empty());
        assert_eq!(view.active_preset.as_deref(), Some("Flat"));
    }

    #[tokio::test]
    async fn test_reset_keeps_flags() {
        let f = fixture();
        f.controller.set_enabled(true).await.unwrap();
        f.controller.apply_preset("Bass Boost").unwrap();

        f.controller.reset().unwrap();

        let view = f.controller.view();
        assert!(view.enabled && view.connected);
        assert_eq!(view.band_gains, vec![0.0; 6]);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let f = fixture();
        let mut rx = f.controller.subscribe();

        f.controller.set_band_gain(3, 4.0).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().band_gains[3], 4.0);

        f.controller.set_enabled(true).await.unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow().connected);
    }
}
