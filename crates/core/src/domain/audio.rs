//! Audio runtime abstractions and playback handles
//!
//! This module defines the platform port the signal graph drives. The
//! processing context, its nodes and their realtime rendering live behind
//! [`AudioRuntime`]; implementations (the software render graph, the
//! recording fake used in tests) live elsewhere.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use thiserror::Error;

/// Errors reported by an audio runtime
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    /// The operation is not allowed in the object's current state
    /// (e.g. the element already feeds a source node)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The processing context could not be created or resumed
    #[error("Runtime unavailable: {0}")]
    Unavailable(String),

    /// The node does not exist in this runtime
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    /// Any other platform failure
    #[error("Platform error: {0}")]
    Platform(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Identity of a media playback element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId(u64);

impl ElementId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocate a process-unique element id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "element#{}", self.0)
    }
}

/// Opaque reference to the media element the whole session plays through.
///
/// The graph never constructs or destroys the element; it only binds a
/// source node to it, at most once for the element's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlaybackHandle {
    element: ElementId,
    label: String,
}

impl PlaybackHandle {
    pub fn new(element: ElementId, label: impl Into<String>) -> Self {
        Self {
            element,
            label: label.into(),
        }
    }

    pub fn element(&self) -> ElementId {
        self.element
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Identifier of a node inside one runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Response shape of a biquad node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterType {
    LowShelf,
    HighShelf,
    Peaking,
}

/// Kind of a processing node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    MediaSource(ElementId),
    Biquad(FilterType),
    Compressor,
    Gain,
    Analyser,
    Destination,
}

/// Automatable node parameters
///
/// `Gain` is in dB on biquad nodes and a linear factor on gain nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioParam {
    Frequency,
    Q,
    Gain,
    Threshold,
    Knee,
    Ratio,
    Attack,
    Release,
}

/// Analyser node configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalyserOptions {
    /// FFT window length in samples, power of two in [32, 32768]
    pub fft_size: usize,
    /// Averaging constant between consecutive frames, in [0, 1)
    pub smoothing_time_constant: f32,
    /// Magnitude mapped to byte 0
    pub min_decibels: f32,
    /// Magnitude mapped to byte 255
    pub max_decibels: f32,
}

impl AnalyserOptions {
    pub const MIN_FFT_SIZE: usize = 32;
    pub const MAX_FFT_SIZE: usize = 32768;

    /// Number of frequency bins exposed by the analyser
    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Reason these options cannot build an analyser, if any
    pub fn validate(&self) -> std::result::Result<(), String> {
        let size = self.fft_size;
        if !size.is_power_of_two() || !(Self::MIN_FFT_SIZE..=Self::MAX_FFT_SIZE).contains(&size) {
            return Err(format!(
                "fft_size {size} must be a power of two in [{}, {}]",
                Self::MIN_FFT_SIZE,
                Self::MAX_FFT_SIZE
            ));
        }
        if !(0.0..1.0).contains(&self.smoothing_time_constant) {
            return Err("analyser smoothing must be in [0, 1)".to_string());
        }
        if !(self.min_decibels < self.max_decibels) {
            return Err(format!(
                "analyser min_db ({}) must be below max_db ({})",
                self.min_decibels, self.max_decibels
            ));
        }
        Ok(())
    }
}

impl Default for AnalyserOptions {
    fn default() -> Self {
        Self {
            fft_size: 2048,
            smoothing_time_constant: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
        }
    }
}

/// Lifecycle of the graph's binding to a playback element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Unbound,
    Binding,
    Connected,
    Disconnected,
    Failed,
}

/// Platform audio runtime: processing context, nodes and connections
///
/// Topology calls are control-plane commands; the runtime applies them to
/// its own rendering thread. Parameter writes are fire-and-forget and become
/// audible on the next render quantum.
#[async_trait]
pub trait AudioRuntime: Send + Sync {
    /// Create or resume the processing context
    async fn resume(&self) -> Result<()>;

    /// Create the source node fed by `handle`'s element.
    ///
    /// Fails with [`RuntimeError::InvalidState`] if the element already
    /// feeds a source node, in this runtime or any other.
    fn create_media_source(&self, handle: &PlaybackHandle) -> Result<NodeId>;

    fn create_biquad(&self, filter: FilterType) -> Result<NodeId>;

    fn create_compressor(&self) -> Result<NodeId>;

    fn create_gain(&self) -> Result<NodeId>;

    fn create_analyser(&self, options: &AnalyserOptions) -> Result<NodeId>;

    /// The output node of the context
    fn destination(&self) -> NodeId;

    fn connect(&self, from: NodeId, to: NodeId) -> Result<()>;

    fn disconnect(&self, from: NodeId, to: NodeId) -> Result<()>;

    /// Move the edge `from -> old_to` to `from -> new_to` in one step, so the
    /// render thread never sees both edges or neither.
    fn reroute(&self, from: NodeId, old_to: NodeId, new_to: NodeId) -> Result<()>;

    fn set_param(&self, node: NodeId, param: AudioParam, value: f32) -> Result<()>;

    fn frequency_bin_count(&self, node: NodeId) -> Result<usize>;

    /// Copy the analyser's current byte magnitudes (0-255, ascending
    /// frequency) into `out`; `out` may be shorter than the bin count.
    fn byte_frequency_data(&self, node: NodeId, out: &mut [u8]) -> Result<()>;
}

/// Accessor for the session's playback element
pub trait PlaybackElementProvider: Send + Sync {
    fn playback_handle(&self) -> Option<PlaybackHandle>;
}

/// In-process provider holding the current element handle
#[derive(Debug, Default)]
pub struct PlaybackSlot {
    handle: RwLock<Option<PlaybackHandle>>,
}

impl PlaybackSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handle(handle: PlaybackHandle) -> Self {
        Self {
            handle: RwLock::new(Some(handle)),
        }
    }

    pub fn set(&self, handle: PlaybackHandle) {
        if let Ok(mut slot) = self.handle.write() {
            *slot = Some(handle);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.handle.write() {
            *slot = None;
        }
    }
}

impl PlaybackElementProvider for PlaybackSlot {
    fn playback_handle(&self) -> Option<PlaybackHandle> {
        self.handle.read().ok().and_then(|slot| slot.clone())
    }
}
