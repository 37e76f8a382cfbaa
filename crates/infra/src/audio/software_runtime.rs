//! In-process [`AudioRuntime`] backed by a real render graph
//!
//! Control calls validate against a control-side mirror of the topology and
//! forward a [`Command`] to the render side; [`SoftwareRuntime::render`] is
//! what the output device (or a test) calls to pull audio.

use super::analyser::Analyser;
use super::media_element::ElementRegistry;
use super::render_graph::{Command, Processor, RenderGraph};
use async_trait::async_trait;
use crossbeam::channel::{unbounded, Sender};
use ethereal_core::domain::audio::{
    AnalyserOptions, AudioParam, AudioRuntime, FilterType, NodeId, NodeKind, PlaybackHandle,
    Result, RuntimeError,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

const DESTINATION: NodeId = NodeId::new(0);

/// Control-side view of the nodes and edges
#[derive(Debug, Default)]
struct Topology {
    next_node: u64,
    nodes: HashMap<NodeId, NodeKind>,
    edges: BTreeSet<(NodeId, NodeId)>,
    analysers: HashMap<NodeId, Arc<Mutex<Analyser>>>,
}

impl Topology {
    fn kind(&self, node: NodeId) -> Result<NodeKind> {
        self.nodes
            .get(&node)
            .copied()
            .ok_or(RuntimeError::UnknownNode(node))
    }

    /// True if `to` can already reach `from`, i.e. `from -> to` closes a cycle
    fn reaches(&self, to: NodeId, from: NodeId) -> bool {
        let mut stack = vec![to];
        let mut seen = BTreeSet::new();
        while let Some(node) = stack.pop() {
            if node == from {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            stack.extend(
                self.edges
                    .range((node, NodeId::new(0))..)
                    .take_while(|(f, _)| *f == node)
                    .map(|(_, t)| *t),
            );
        }
        false
    }
}

/// Software audio context rendering interleaved stereo at a fixed rate
pub struct SoftwareRuntime {
    sample_rate: u32,
    elements: Arc<ElementRegistry>,
    topology: Mutex<Topology>,
    commands: Sender<Command>,
    renderer: Mutex<RenderGraph>,
    running: AtomicBool,
    locked_out: AtomicBool,
}

impl SoftwareRuntime {
    pub fn new(sample_rate: u32, elements: Arc<ElementRegistry>) -> Self {
        let (commands, receiver) = unbounded();
        let mut topology = Topology {
            next_node: DESTINATION.get() + 1,
            ..Topology::default()
        };
        topology.nodes.insert(DESTINATION, NodeKind::Destination);

        info!(sample_rate, "Creating software audio runtime");
        Self {
            sample_rate,
            elements,
            topology: Mutex::new(topology),
            commands,
            renderer: Mutex::new(RenderGraph::new(receiver, DESTINATION)),
            running: AtomicBool::new(false),
            locked_out: AtomicBool::new(false),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn elements(&self) -> &Arc<ElementRegistry> {
        &self.elements
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Suspend the context: rendering goes silent and `resume` reports the
    /// context unavailable until [`Self::reopen`]
    pub fn suspend(&self) {
        info!("Suspending software audio runtime");
        self.locked_out.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);
    }

    /// Allow `resume` to succeed again after [`Self::suspend`]
    pub fn reopen(&self) {
        self.locked_out.store(false, Ordering::Release);
    }

    /// Render interleaved stereo into `out`.
    ///
    /// Queued control commands are applied even while suspended so the
    /// topology is current when rendering restarts.
    pub fn render(&self, out: &mut [f32]) {
        let mut renderer = self.renderer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_running() {
            renderer.render(out);
        } else {
            renderer.apply_commands();
            renderer.discard_pending();
            out.fill(0.0);
        }
    }

    /// Live edges, as the control plane sees them
    pub fn edges(&self) -> BTreeSet<(NodeId, NodeId)> {
        self.topology().edges.clone()
    }

    pub fn node_kind(&self, node: NodeId) -> Option<NodeKind> {
        self.topology().nodes.get(&node).copied()
    }

    fn topology(&self) -> MutexGuard<'_, Topology> {
        self.topology.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| RuntimeError::Platform("render graph is gone".to_string()))
    }

    fn add_node(&self, kind: NodeKind, processor: Processor) -> Result<NodeId> {
        let mut topology = self.topology();
        let id = NodeId::new(topology.next_node);
        topology.next_node += 1;
        topology.nodes.insert(id, kind);
        self.send(Command::AddNode(id, processor))?;
        debug!(node = %id, ?kind, "Node created");
        Ok(id)
    }
}

impl std::fmt::Debug for SoftwareRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareRuntime")
            .field("sample_rate", &self.sample_rate)
            .field("running", &self.is_running())
            .finish()
    }
}

#[async_trait]
impl AudioRuntime for SoftwareRuntime {
    async fn resume(&self) -> Result<()> {
        if self.locked_out.load(Ordering::Acquire) {
            warn!("Resume refused: audio context is suspended");
            return Err(RuntimeError::Unavailable(
                "audio context is suspended".to_string(),
            ));
        }
        if !self.running.swap(true, Ordering::AcqRel) {
            info!("Software audio runtime running");
        }
        Ok(())
    }

    fn create_media_source(&self, handle: &PlaybackHandle) -> Result<NodeId> {
        let element = self.elements.get(handle.element()).ok_or_else(|| {
            RuntimeError::Platform(format!("no media element registered as {}", handle.element()))
        })?;
        if !element.claim() {
            return Err(RuntimeError::InvalidState(format!(
                "{} already feeds a source node",
                handle.element()
            )));
        }
        self.add_node(
            NodeKind::MediaSource(handle.element()),
            Processor::Source(element.reader()),
        )
    }

    fn create_biquad(&self, filter: FilterType) -> Result<NodeId> {
        self.add_node(
            NodeKind::Biquad(filter),
            Processor::biquad(filter, self.sample_rate),
        )
    }

    fn create_compressor(&self) -> Result<NodeId> {
        self.add_node(NodeKind::Compressor, Processor::compressor(self.sample_rate))
    }

    fn create_gain(&self) -> Result<NodeId> {
        self.add_node(NodeKind::Gain, Processor::gain())
    }

    fn create_analyser(&self, options: &AnalyserOptions) -> Result<NodeId> {
        options.validate().map_err(RuntimeError::InvalidState)?;

        let analyser = Arc::new(Mutex::new(Analyser::new(*options)));
        let id = self.add_node(NodeKind::Analyser, Processor::Analyser(Arc::clone(&analyser)))?;
        self.topology().analysers.insert(id, analyser);
        Ok(id)
    }

    fn destination(&self) -> NodeId {
        DESTINATION
    }

    fn connect(&self, from: NodeId, to: NodeId) -> Result<()> {
        let mut topology = self.topology();
        topology.kind(from)?;
        if matches!(topology.kind(to)?, NodeKind::MediaSource(_)) {
            return Err(RuntimeError::InvalidState(format!(
                "{to} is a source and takes no input"
            )));
        }
        if from == DESTINATION {
            return Err(RuntimeError::InvalidState(
                "destination has no output".to_string(),
            ));
        }
        if topology.reaches(to, from) {
            return Err(RuntimeError::InvalidState(format!(
                "{from} -> {to} would create a cycle"
            )));
        }
        if topology.edges.insert((from, to)) {
            self.send(Command::Connect(from, to))?;
        }
        Ok(())
    }

    fn disconnect(&self, from: NodeId, to: NodeId) -> Result<()> {
        let mut topology = self.topology();
        topology.kind(from)?;
        topology.kind(to)?;
        if !topology.edges.remove(&(from, to)) {
            return Err(RuntimeError::InvalidState(format!(
                "{from} is not connected to {to}"
            )));
        }
        self.send(Command::Disconnect(from, to))
    }

    fn reroute(&self, from: NodeId, old_to: NodeId, new_to: NodeId) -> Result<()> {
        let mut topology = self.topology();
        topology.kind(from)?;
        topology.kind(old_to)?;
        topology.kind(new_to)?;
        if !topology.edges.contains(&(from, old_to)) {
            return Err(RuntimeError::InvalidState(format!(
                "{from} is not connected to {old_to}"
            )));
        }
        topology.edges.remove(&(from, old_to));
        if topology.reaches(new_to, from) {
            topology.edges.insert((from, old_to));
            return Err(RuntimeError::InvalidState(format!(
                "{from} -> {new_to} would create a cycle"
            )));
        }
        topology.edges.insert((from, new_to));
        self.send(Command::Reroute {
            from,
            old_to,
            new_to,
        })
    }

    fn set_param(&self, node: NodeId, param: AudioParam, value: f32) -> Result<()> {
        let kind = self.topology().kind(node)?;
        let accepted = match kind {
            NodeKind::Biquad(_) => {
                matches!(param, AudioParam::Frequency | AudioParam::Q | AudioParam::Gain)
            }
            NodeKind::Compressor => matches!(
                param,
                AudioParam::Threshold
                    | AudioParam::Knee
                    | AudioParam::Ratio
                    | AudioParam::Attack
                    | AudioParam::Release
            ),
            NodeKind::Gain => param == AudioParam::Gain,
            NodeKind::MediaSource(_) | NodeKind::Analyser | NodeKind::Destination => false,
        };
        if !accepted {
            return Err(RuntimeError::InvalidState(format!(
                "{node} has no {param:?} parameter"
            )));
        }
        if !value.is_finite() {
            return Err(RuntimeError::InvalidState(format!(
                "{param:?} must be finite"
            )));
        }
        self.send(Command::SetParam(node, param, value))
    }

    fn frequency_bin_count(&self, node: NodeId) -> Result<usize> {
        let topology = self.topology();
        topology.kind(node)?;
        topology
            .analysers
            .get(&node)
            .map(|a| a.lock().unwrap_or_else(PoisonError::into_inner).bin_count())
            .ok_or_else(|| RuntimeError::InvalidState(format!("{node} is not an analyser")))
    }

    fn byte_frequency_data(&self, node: NodeId, out: &mut [u8]) -> Result<()> {
        let analyser = {
            let topology = self.topology();
            topology.kind(node)?;
            topology
                .analysers
                .get(&node)
                .cloned()
                .ok_or_else(|| RuntimeError::InvalidState(format!("{node} is not an analyser")))?
        };
        analyser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .byte_frequency_data(out);
        Ok(())
    }
}
