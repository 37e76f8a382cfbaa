//! Integration tests for the equalizer controller
//!
//! These tests combine the controller with the recording runtime (to check
//! exactly what the graph asks of the platform) and with the JSON file
//! preset store (to check what survives a restart).

use ethereal_core::domain::{
    AudioParam, ConnectionState, ElementId, EqError, EqualizerController, EtherealConfig,
    NodeKind, PlaybackHandle, PlaybackSlot, PresetStore,
};
use ethereal_core::testing::RecordingRuntime;
use ethereal_infra::storage::JsonFilePresetStore;
use futures::future::join_all;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn handle() -> PlaybackHandle {
    PlaybackHandle::new(ElementId::new(1), "audio")
}

fn controller_with(
    runtime: Arc<RecordingRuntime>,
    store: Arc<dyn PresetStore>,
) -> EqualizerController {
    EqualizerController::from_config(
        runtime,
        &EtherealConfig::factory_default(),
        Arc::new(PlaybackSlot::with_handle(handle())),
        store,
    )
    .unwrap()
}

fn file_session(path: &Path) -> (Arc<RecordingRuntime>, EqualizerController) {
    let runtime = Arc::new(RecordingRuntime::new());
    let store = Arc::new(JsonFilePresetStore::new(path));
    let controller = controller_with(runtime.clone(), store);
    (runtime, controller)
}

// ============================================================================
// PRESET PERSISTENCE
// ============================================================================

#[tokio::test]
async fn test_custom_preset_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("presets.json");

    {
        let (_runtime, controller) = file_session(&path);
        controller.load_presets().await.unwrap();
        controller
            .save_custom_preset("Night", vec![-3.0, -1.5, 0.0, 2.0, 4.0, 6.0])
            .await
            .unwrap();
        controller.apply_preset("Night").unwrap();
        controller.persist_last_used().await.unwrap();
    }

    let (_runtime, restarted) = file_session(&path);
    restarted.load_presets().await.unwrap();
    let view = restarted.view();
    assert_eq!(view.custom_presets, vec!["Night".to_string()]);
    assert_eq!(view.active_preset.as_deref(), Some("Night"));
    assert_eq!(view.band_gains, vec![-3.0, -1.5, 0.0, 2.0, 4.0, 6.0]);
    assert!(!view.persistence_degraded);

    let stored: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(stored["lastUsedEqPreset"], json!("Night"));
    assert_eq!(stored["customEqPresets"][0]["name"], json!("Night"));
}

#[tokio::test]
async fn test_deleted_preset_is_gone_after_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("presets.json");

    {
        let (_runtime, controller) = file_session(&path);
        controller
            .save_custom_preset("A", vec![1.0; 6])
            .await
            .unwrap();
        controller
            .save_custom_preset("B", vec![2.0; 6])
            .await
            .unwrap();
        controller.delete_custom_preset("A").await.unwrap();
    }

    let (_runtime, restarted) = file_session(&path);
    restarted.load_presets().await.unwrap();
    assert_eq!(restarted.view().custom_presets, vec!["B".to_string()]);
    assert_eq!(restarted.preset_names().len(), 6);
}

#[tokio::test]
async fn test_unreadable_store_is_never_overwritten() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("presets.json");
    std::fs::write(&path, "{{{").unwrap();

    let (_runtime, controller) = file_session(&path);
    let err = controller.load_presets().await.unwrap_err();
    assert!(matches!(err, EqError::Persistence(_)));
    assert!(controller.view().persistence_degraded);
    assert_eq!(controller.view().active_preset.as_deref(), Some("Flat"));

    // Kept for this session only; the file is left as it was
    let err = controller
        .save_custom_preset("Fresh", vec![0.0; 6])
        .await
        .unwrap_err();
    assert!(matches!(err, EqError::Persistence(_)));
    assert!(controller.view().persistence_degraded);
    assert_eq!(controller.view().custom_presets, vec!["Fresh".to_string()]);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "{{{");

    // Once the file is readable again both lists are kept
    std::fs::write(
        &path,
        r#"{ "customEqPresets": [{ "name": "Night", "values": [1, 1, 1, 1, 1, 1] }] }"#,
    )
    .unwrap();
    controller
        .save_custom_preset("Fresh", vec![0.5; 6])
        .await
        .unwrap();
    assert!(!controller.view().persistence_degraded);

    let (_runtime, restarted) = file_session(&path);
    restarted.load_presets().await.unwrap();
    assert_eq!(
        restarted.view().custom_presets,
        vec!["Fresh".to_string(), "Night".to_string()]
    );
}

#[tokio::test]
async fn test_save_without_load_keeps_presets_on_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("presets.json");

    {
        let (_runtime, controller) = file_session(&path);
        controller
            .save_custom_preset("Night", vec![-1.5; 6])
            .await
            .unwrap();
    }

    // A second session that never called load_presets
    let (_runtime, controller) = file_session(&path);
    controller
        .save_custom_preset("Day", vec![3.0; 6])
        .await
        .unwrap();

    let stored: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(stored["customEqPresets"][0]["name"], json!("Night"));
    assert_eq!(stored["customEqPresets"][1]["name"], json!("Day"));
}

#[tokio::test]
async fn test_malformed_last_used_is_ignored() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("presets.json");
    std::fs::write(&path, r#"{ "lastUsedEqPreset": 42, "customEqPresets": "nope" }"#).unwrap();

    let (_runtime, controller) = file_session(&path);
    controller.load_presets().await.unwrap();
    let view = controller.view();
    assert!(view.custom_presets.is_empty());
    assert_eq!(view.active_preset.as_deref(), Some("Flat"));
}

// ============================================================================
// GRAPH TOPOLOGY
// ============================================================================

#[tokio::test]
async fn test_concurrent_connects_bind_once() {
    let runtime = Arc::new(RecordingRuntime::new());
    let controller = controller_with(
        runtime.clone(),
        Arc::new(ethereal_core::domain::MemoryPresetStore::new()),
    );

    let results = join_all((0..8).map(|_| controller.connect_current())).await;
    assert!(results.iter().all(|r| r.is_ok()));

    assert_eq!(runtime.source_creations(), 1);
    assert_eq!(runtime.nodes_of_kind(NodeKind::Analyser).len(), 1);
    assert_eq!(controller.view().connection, ConnectionState::Connected);
}

#[tokio::test]
async fn test_compressor_toggle_moves_only_the_tail() {
    let runtime = Arc::new(RecordingRuntime::new());
    let controller = controller_with(
        runtime.clone(),
        Arc::new(ethereal_core::domain::MemoryPresetStore::new()),
    );
    controller.set_enabled(true).await.unwrap();

    let gain = runtime.nodes_of_kind(NodeKind::Gain)[0];
    let compressor = runtime.nodes_of_kind(NodeKind::Compressor)[0];
    let destination = RecordingRuntime::DESTINATION;
    let before = runtime.edges();
    assert_eq!(before.len(), 12);
    assert!(before.contains(&(gain, destination)));

    controller.set_compressor_enabled(true).await.unwrap();
    let after = runtime.edges();
    assert_eq!(after.len(), 12);
    assert!(after.contains(&(gain, compressor)));
    assert!(!after.contains(&(gain, destination)));
    assert_eq!(before.symmetric_difference(&after).count(), 2);

    // Disabling the equalizer takes the compressor out again
    controller.set_enabled(false).await.unwrap();
    assert!(runtime.has_edge(gain, destination));
    assert!(!runtime.has_edge(gain, compressor));
}

#[tokio::test]
async fn test_enable_pushes_curve_and_preamp() {
    let runtime = Arc::new(RecordingRuntime::new());
    let controller = controller_with(
        runtime.clone(),
        Arc::new(ethereal_core::domain::MemoryPresetStore::new()),
    );
    controller.apply_preset("Rock").unwrap();
    controller.set_preamp(6.0).unwrap();
    controller.connect_current().await.unwrap();

    let biquads = runtime.nodes_of_kind(NodeKind::Biquad(
        ethereal_core::domain::FilterType::Peaking,
    ));
    let gain = runtime.nodes_of_kind(NodeKind::Gain)[0];
    assert_eq!(runtime.param(biquads[0], AudioParam::Gain), Some(0.0));
    assert_eq!(runtime.param(gain, AudioParam::Gain), Some(1.0));

    controller.set_enabled(true).await.unwrap();
    assert_eq!(runtime.param(biquads[0], AudioParam::Gain), Some(4.0));
    let preamp = runtime.param(gain, AudioParam::Gain).unwrap();
    assert!((preamp - 1.995).abs() < 0.01);
}
