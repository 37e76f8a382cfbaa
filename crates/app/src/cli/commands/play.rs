//! `ethereal play`: run a generated signal through the equalizer into the
//! default output device while drawing the analyser spectrum.

use super::Session;
use anyhow::Context;
use clap::Args;
use ethereal_core::domain::{ConfigManager, SpectrumFrame, VisualizerSampler};
use ethereal_infra::audio::{MediaElement, OutputStream};
use futures::StreamExt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Frames per generated block
const BLOCK_FRAMES: usize = 1024;

const BARS: usize = 32;
const LEVELS: [char; 9] = [' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

#[derive(Args)]
pub struct PlayArgs {
    /// Test tone frequency in Hz
    #[arg(long, value_name = "HZ", default_value_t = 440.0)]
    tone: f32,

    /// How long to play
    #[arg(long, value_name = "N", default_value_t = 5)]
    seconds: u64,

    /// Preset to apply before playing
    #[arg(long, value_name = "NAME")]
    preset: Option<String>,

    /// Put the compressor in the signal path
    #[arg(long)]
    compressor: bool,

    /// Preamp gain in dB
    #[arg(long, value_name = "DB", allow_hyphen_values = true)]
    preamp: Option<f32>,
}

pub async fn run(manager: &ConfigManager, args: PlayArgs) -> anyhow::Result<()> {
    let session = Session::open(manager).await?;
    let controller = &session.controller;

    let element = session.elements.create("test-tone");
    session.slot.set(element.handle());

    if let Some(name) = &args.preset {
        controller
            .apply_preset(name)
            .with_context(|| format!("cannot apply preset {name:?}"))?;
        if let Err(e) = controller.persist_last_used().await {
            warn!(error = %e, "Last used preset not saved");
        }
    }
    if let Some(db) = args.preamp {
        controller.set_preamp(db)?;
    }
    controller.set_compressor_enabled(args.compressor).await?;
    controller
        .set_enabled(true)
        .await
        .context("equalizer could not connect to the player")?;

    let _output = OutputStream::open(session.runtime.clone(), &session.config.audio)
        .context("cannot open the audio output")?;

    let stop = Arc::new(AtomicBool::new(false));
    let player = spawn_tone(
        element,
        args.tone,
        session.config.audio.sample_rate,
        Arc::clone(&stop),
    );

    let view = controller.view();
    info!(
        tone = args.tone,
        preset = view.active_preset.as_deref().unwrap_or("custom"),
        compressor = view.compressor.enabled,
        "Playing"
    );

    let sampler = VisualizerSampler::new(
        controller.graph().clone(),
        session.config.visualizer.frames_per_second,
    );
    let deadline = tokio::time::sleep(Duration::from_secs(args.seconds));
    tokio::pin!(deadline);
    let mut frames = Box::pin(sampler.sample());
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            frame = frames.next() => match frame {
                Some(frame) => {
                    write!(stdout, "\r{}", draw(&frame))?;
                    stdout.flush()?;
                }
                None => break,
            },
        }
    }
    writeln!(stdout)?;

    stop.store(true, Ordering::Release);
    if player.join().is_err() {
        warn!("Tone generator thread panicked");
    }
    controller.disconnect().await?;
    Ok(())
}

/// Feed a sine into `element` until `stop` is set, paced by the render thread
fn spawn_tone(
    element: Arc<MediaElement>,
    freq: f32,
    sample_rate: u32,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let step = freq / sample_rate as f32;
        let mut phase = 0.0f32;
        let started = Instant::now();
        while !stop.load(Ordering::Acquire) {
            let mut block = Vec::with_capacity(BLOCK_FRAMES * 2);
            for _ in 0..BLOCK_FRAMES {
                let s = (std::f32::consts::TAU * phase).sin() * 0.3;
                block.extend_from_slice(&[s, s]);
                phase = (phase + step).fract();
            }
            // Retry the same block until there is room or we are told to stop
            while let Err(returned) = element.push_samples_timeout(block, Duration::from_millis(50)) {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                block = returned;
            }
        }
        tracing::debug!(elapsed = ?started.elapsed(), "Tone generator stopped");
    })
}

fn draw(frame: &SpectrumFrame) -> String {
    frame
        .bars(BARS)
        .into_iter()
        .map(|b| LEVELS[usize::from(b) * (LEVELS.len() - 1) / 255])
        .collect()
}
