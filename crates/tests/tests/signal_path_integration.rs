//! Integration tests for the audible signal path
//!
//! These tests run the equalizer controller against the software runtime and
//! measure what actually comes out of the render graph.

use ethereal_core::domain::{
    BindError, ConnectionState, EqError, EqualizerController, MemoryPresetStore, PlaybackSlot,
    VisualizerSampler,
};
use ethereal_infra::audio::{ElementRegistry, SoftwareRuntime};
use ethereal_tests::{rms, small_analyser_config, SoftwareRig, Tone, SAMPLE_RATE};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

/// Frames rendered before measuring, enough for smoothing and envelopes
const SETTLE_FRAMES: usize = 9600;
const MEASURE_FRAMES: usize = 4096;

fn level_ratio(rig: &SoftwareRig, freq: f32, amplitude: f32) -> f32 {
    let mut tone = Tone::new(freq, amplitude);
    rig.play(&mut tone, SETTLE_FRAMES);
    let output = rig.play(&mut tone, MEASURE_FRAMES);
    rms(&output) / (amplitude / std::f32::consts::SQRT_2)
}

// ============================================================================
// EQUALIZER CURVE
// ============================================================================

#[tokio::test]
async fn test_disabled_equalizer_is_transparent() {
    let rig = SoftwareRig::new();
    rig.controller.set_band_gain(3, 12.0).unwrap();
    rig.controller.set_preamp(-6.0).unwrap();
    rig.controller.connect_current().await.unwrap();

    let mut tone = Tone::new(1000.0, 0.2);
    let mut expected_tone = tone.clone();
    let output = rig.play(&mut tone, 2048);
    let expected = expected_tone.block(2048);

    let worst = output
        .iter()
        .zip(expected.iter())
        .map(|(o, e)| (o - e).abs())
        .fold(0.0f32, f32::max);
    assert!(worst < 1e-3, "max deviation {worst}");
}

#[tokio::test]
async fn test_band_boost_raises_matching_tone() {
    let rig = SoftwareRig::new();
    rig.controller.set_band_gain(3, 12.0).unwrap();
    rig.controller.set_enabled(true).await.unwrap();

    // +12 dB is a factor of about 3.98
    let ratio = level_ratio(&rig, 1000.0, 0.05);
    assert!((3.5..4.5).contains(&ratio), "ratio {ratio}");
}

#[tokio::test]
async fn test_band_boost_leaves_distant_tone_alone() {
    let rig = SoftwareRig::new();
    rig.controller.set_band_gain(3, 12.0).unwrap();
    rig.controller.set_enabled(true).await.unwrap();

    let ratio = level_ratio(&rig, 60.0, 0.05);
    assert!((0.9..1.15).contains(&ratio), "ratio {ratio}");
}

#[tokio::test]
async fn test_bass_shelf_cut() {
    let rig = SoftwareRig::new();
    rig.controller
        .set_bass_shelf(ethereal_core::domain::ShelfSettings::new(200.0, -12.0))
        .unwrap();
    rig.controller.set_enabled(true).await.unwrap();

    let ratio = level_ratio(&rig, 60.0, 0.1);
    assert!(ratio < 0.5, "ratio {ratio}");
}

#[tokio::test]
async fn test_preamp_ramps_to_new_level() {
    let rig = SoftwareRig::new();
    rig.controller.set_enabled(true).await.unwrap();
    rig.controller.set_preamp(-6.0).unwrap();

    let ratio = level_ratio(&rig, 1000.0, 0.1);
    assert!((0.45..0.55).contains(&ratio), "ratio {ratio}");
}

// ============================================================================
// COMPRESSOR AND CONNECTION LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_compressor_splice_changes_level() {
    let rig = SoftwareRig::new();
    rig.controller.set_compressor_enabled(true).await.unwrap();
    rig.controller.set_enabled(true).await.unwrap();

    let compressed = level_ratio(&rig, 440.0, 0.9);
    assert!(compressed < 0.6, "compressed ratio {compressed}");

    rig.controller.set_compressor_enabled(false).await.unwrap();
    let bypassed = level_ratio(&rig, 440.0, 0.9);
    assert!((0.97..1.03).contains(&bypassed), "bypassed ratio {bypassed}");
}

#[tokio::test]
async fn test_disconnect_silences_output() {
    let rig = SoftwareRig::new();
    rig.controller.set_enabled(true).await.unwrap();
    assert!(level_ratio(&rig, 1000.0, 0.2) > 0.9);

    rig.controller.disconnect().await.unwrap();
    assert!(rig.runtime.edges().is_empty());

    let mut tone = Tone::new(1000.0, 0.2);
    let output = rig.play(&mut tone, 1024);
    assert!(output.iter().all(|&s| s == 0.0));

    // Reconnecting reuses the element's source node
    rig.controller.connect_current().await.unwrap();
    assert!(level_ratio(&rig, 1000.0, 0.2) > 0.9);
}

#[tokio::test]
async fn test_element_cannot_feed_two_graphs() {
    let elements = Arc::new(ElementRegistry::new());
    let element = elements.create("audio");
    let config = small_analyser_config();

    let controller = |runtime: Arc<SoftwareRuntime>| {
        EqualizerController::from_config(
            runtime,
            &config,
            Arc::new(PlaybackSlot::with_handle(element.handle())),
            Arc::new(MemoryPresetStore::new()),
        )
        .unwrap()
    };
    let first = controller(Arc::new(SoftwareRuntime::new(
        SAMPLE_RATE,
        Arc::clone(&elements),
    )));
    let second = controller(Arc::new(SoftwareRuntime::new(
        SAMPLE_RATE,
        Arc::clone(&elements),
    )));

    first.connect_current().await.unwrap();

    for _ in 0..2 {
        let err = second.connect_current().await.unwrap_err();
        assert!(matches!(
            err,
            EqError::Bind(BindError::AlreadyBoundElsewhere { .. })
        ));
    }
    assert_eq!(second.view().connection, ConnectionState::Failed);
    assert_eq!(first.view().connection, ConnectionState::Connected);
}

#[tokio::test]
async fn test_suspended_runtime_can_be_retried() {
    let rig = SoftwareRig::new();
    rig.runtime.suspend();

    let err = rig.controller.connect_current().await.unwrap_err();
    assert!(matches!(
        err,
        EqError::Bind(BindError::RuntimeUnavailable(_))
    ));
    assert!(!rig.element.is_claimed());

    rig.runtime.reopen();
    rig.controller.connect_current().await.unwrap();
    assert!(rig.controller.view().connected);
    assert!(rig.element.is_claimed());
}

// ============================================================================
// VISUALIZER
// ============================================================================

#[tokio::test]
async fn test_visualizer_sees_tone() {
    let rig = SoftwareRig::new();
    rig.controller.set_enabled(true).await.unwrap();

    // 3 kHz with a 512-point FFT at 48 kHz lands on bin 32
    let mut tone = Tone::new(3000.0, 0.3);
    rig.play(&mut tone, 4096);

    let sampler = VisualizerSampler::new(rig.controller.graph().clone(), 60);
    let mut frames = Box::pin(sampler.sample());
    let frame = tokio::time::timeout(Duration::from_secs(2), frames.next())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(frame.bins.len(), 256);
    assert_eq!(frame.bins[32], frame.peak());
    assert!(frame.peak() > 200);
    assert!(frame.bins[5] < 128);
}

#[tokio::test]
async fn test_visualizer_idle_while_disconnected() {
    let rig = SoftwareRig::new();
    let sampler = VisualizerSampler::new(rig.controller.graph().clone(), 100);
    let mut frames = Box::pin(sampler.sample());

    assert!(tokio::time::timeout(Duration::from_millis(100), frames.next())
        .await
        .is_err());
}
