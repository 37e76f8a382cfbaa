//! Walk through the equalizer controller against the recording runtime
//!
//! Run with: cargo run --package ethereal-core --example preset_demo --features test-util

use ethereal_core::domain::{
    ElementId, EqualizerController, EtherealConfig, MemoryPresetStore, PlaybackHandle,
    PlaybackSlot, BUILTIN_PRESETS,
};
use ethereal_core::testing::RecordingRuntime;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("ethereal_core=debug,info")
        .init();

    println!("=== Ethereal Preset Demo ===\n");

    let runtime = Arc::new(RecordingRuntime::new());
    let slot = Arc::new(PlaybackSlot::with_handle(PlaybackHandle::new(
        ElementId::next(),
        "demo",
    )));
    let store = Arc::new(MemoryPresetStore::new());
    let controller = EqualizerController::from_config(
        runtime.clone(),
        &EtherealConfig::factory_default(),
        slot,
        store,
    )?;

    println!("1. Enabling (connects to the playback element first)...");
    controller.set_enabled(true).await?;
    println!(
        "   ✓ connected, {} nodes, {} edges",
        runtime.node_count(),
        runtime.edge_count()
    );

    println!("\n2. Built-in presets:");
    for preset in BUILTIN_PRESETS {
        controller.apply_preset(preset.name)?;
        println!("   {:<14} {:?}", preset.name, controller.view().band_gains);
    }

    println!("\n3. Saving a custom preset...");
    controller.set_all_band_gains(&[2.0, 1.0, 0.0, -1.0, 1.5, 3.0])?;
    controller.save_current_as("Late Night").await?;
    controller.apply_preset("Flat")?;
    controller.apply_preset("Late Night")?;
    println!("   ✓ Late Night -> {:?}", controller.view().band_gains);

    println!("\n4. Splicing the compressor...");
    let before = runtime.edges();
    controller.set_compressor_enabled(true).await?;
    controller.set_compressor_enabled(false).await?;
    println!("   ✓ tail restored: {}", before == runtime.edges());

    println!("\n=== Demo Complete ===");
    Ok(())
}
