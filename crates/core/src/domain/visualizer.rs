//! Spectrum sampling for visualizers
//!
//! [`VisualizerSampler::sample`] returns a lazy, never-ending stream of
//! analyser frames at a fixed cadence. Ticks that find no live analyser tap
//! (unbound or disconnected graph) are skipped, and sampling picks up again
//! on its own once the graph is connected. Nothing is buffered: every frame
//! is read from the analyser at the tick that yields it.

use crate::domain::graph::SignalGraph;
use futures::stream::{self, Stream};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self as tokio_time, Interval, MissedTickBehavior};
use tracing::trace;

/// One analyser snapshot, byte magnitudes by ascending frequency bin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpectrumFrame {
    pub bins: Vec<u8>,
    /// Scheduling tick that produced the frame, counted from stream start
    pub tick: u64,
}

impl SpectrumFrame {
    pub fn peak(&self) -> u8 {
        self.bins.iter().copied().max().unwrap_or(0)
    }

    /// Collapse the bins into `count` bars, each the maximum of its group
    pub fn bars(&self, count: usize) -> Vec<u8> {
        if count == 0 || self.bins.is_empty() {
            return vec![0; count];
        }
        (0..count)
            .map(|i| {
                let start = i * self.bins.len() / count;
                let end = ((i + 1) * self.bins.len() / count).max(start + 1);
                self.bins[start..end.min(self.bins.len())]
                    .iter()
                    .copied()
                    .max()
                    .unwrap_or(0)
            })
            .collect()
    }
}

struct SamplerState {
    graph: Arc<SignalGraph>,
    period: Duration,
    ticker: Option<Interval>,
    tick: u64,
}

/// Pulls frames from the graph's analyser tap on a fixed cadence
#[derive(Debug, Clone)]
pub struct VisualizerSampler {
    graph: Arc<SignalGraph>,
    period: Duration,
}

impl VisualizerSampler {
    pub fn new(graph: Arc<SignalGraph>, frames_per_second: u32) -> Self {
        let fps = frames_per_second.max(1);
        Self {
            graph,
            period: Duration::from_secs_f64(1.0 / f64::from(fps)),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start a fresh frame stream.
    ///
    /// Nothing runs until the stream is polled; dropping it stops sampling.
    pub fn sample(&self) -> impl Stream<Item = SpectrumFrame> + Send + 'static {
        let state = SamplerState {
            graph: Arc::clone(&self.graph),
            period: self.period,
            ticker: None,
            tick: 0,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                let period = state.period;
                let ticker = state.ticker.get_or_insert_with(|| {
                    let mut ticker = tokio_time::interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    ticker
                });
                ticker.tick().await;
                state.tick += 1;

                let Some(tap) = state.graph.live_tap() else {
                    continue;
                };
                match tap.frame() {
                    Ok(bins) => {
                        let frame = SpectrumFrame {
                            bins,
                            tick: state.tick,
                        };
                        return Some((frame, state));
                    }
                    Err(e) => trace!(error = %e, "Analyser read skipped"),
                }
            }
        })
    }
}
