//! Software audio runtime and its realtime output
//!
//! [`SoftwareRuntime`] implements the core `AudioRuntime` port with an
//! in-process render graph; [`OutputStream`] drives it from a CPAL device
//! callback; [`MediaElement`]s are the players feeding it.

pub mod analyser;
pub mod cpal_output;
pub mod media_element;
pub mod render_graph;
pub mod software_runtime;

pub use analyser::Analyser;
pub use cpal_output::{fold_channels, OutputError, OutputStream};
pub use media_element::{ElementRegistry, MediaElement, DEFAULT_QUEUE_BLOCKS};
pub use render_graph::{CHANNELS, PARAM_SMOOTHING, RENDER_QUANTUM_FRAMES};
pub use software_runtime::SoftwareRuntime;
