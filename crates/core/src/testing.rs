//! Recording fake of [`AudioRuntime`] for tests
//!
//! Every call is recorded: created nodes, live edges, parameter writes and an
//! ordered event log. Failure knobs let tests model a suspended context or an
//! element bound by another graph. A platform that refuses connections or
//! analyser nodes can be modelled too.

use crate::domain::audio::{
    AnalyserOptions, AudioParam, AudioRuntime, ElementId, FilterType, NodeId, NodeKind,
    PlaybackHandle, Result, RuntimeError,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One recorded runtime call
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    Resumed,
    ResumeFailed,
    NodeCreated(NodeId, NodeKind),
    Connected(NodeId, NodeId),
    Disconnected(NodeId, NodeId),
    Rerouted {
        from: NodeId,
        old_to: NodeId,
        new_to: NodeId,
    },
    ParamSet(NodeId, AudioParam, f32),
}

#[derive(Debug, Default)]
struct Recording {
    next_node: u64,
    nodes: HashMap<NodeId, NodeKind>,
    bin_counts: HashMap<NodeId, usize>,
    edges: BTreeSet<(NodeId, NodeId)>,
    params: HashMap<(NodeId, AudioParam), f32>,
    sources: HashMap<ElementId, NodeId>,
    source_creations: usize,
    events: Vec<RuntimeEvent>,
    bound_elsewhere: HashSet<ElementId>,
    pending_resume_failures: usize,
    pending_analyser_failures: usize,
    fail_connects: bool,
    spectrum: Vec<u8>,
}

/// In-memory [`AudioRuntime`] that records what the graph asks of it
#[derive(Debug)]
pub struct RecordingRuntime {
    state: Mutex<Recording>,
}

impl RecordingRuntime {
    pub const DESTINATION: NodeId = NodeId::new(0);

    pub fn new() -> Self {
        let mut recording = Recording {
            next_node: 1,
            ..Recording::default()
        };
        recording
            .nodes
            .insert(Self::DESTINATION, NodeKind::Destination);
        Self {
            state: Mutex::new(recording),
        }
    }

    fn state(&self) -> MutexGuard<'_, Recording> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Treat `element` as already feeding a source node of another runtime
    pub fn mark_bound_elsewhere(&self, element: ElementId) {
        self.state().bound_elsewhere.insert(element);
    }

    /// Make the next `count` resumes fail with `Unavailable`
    pub fn fail_next_resumes(&self, count: usize) {
        self.state().pending_resume_failures = count;
    }

    /// Make the next `count` analyser creations fail with a platform error
    pub fn fail_next_analysers(&self, count: usize) {
        self.state().pending_analyser_failures = count;
    }

    /// Make every `connect` fail with a platform error
    pub fn fail_connects(&self, fail: bool) {
        self.state().fail_connects = fail;
    }

    /// Bytes returned by `byte_frequency_data` (zero-padded to the request)
    pub fn set_spectrum(&self, bytes: Vec<u8>) {
        self.state().spectrum = bytes;
    }

    pub fn source_creations(&self) -> usize {
        self.state().source_creations
    }

    pub fn edges(&self) -> BTreeSet<(NodeId, NodeId)> {
        self.state().edges.clone()
    }

    pub fn edge_count(&self) -> usize {
        self.state().edges.len()
    }

    pub fn has_edge(&self, from: NodeId, to: NodeId) -> bool {
        self.state().edges.contains(&(from, to))
    }

    pub fn param(&self, node: NodeId, param: AudioParam) -> Option<f32> {
        self.state().params.get(&(node, param)).copied()
    }

    pub fn node_count(&self) -> usize {
        self.state().nodes.len()
    }

    /// Nodes of `kind`, in creation order
    pub fn nodes_of_kind(&self, kind: NodeKind) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .state()
            .nodes
            .iter()
            .filter(|(_, k)| **k == kind)
            .map(|(id, _)| *id)
            .collect();
        nodes.sort();
        nodes
    }

    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.state().events.clone()
    }

    pub fn count_events(&self, matches: impl Fn(&RuntimeEvent) -> bool) -> usize {
        self.state().events.iter().filter(|e| matches(e)).count()
    }

    fn add_node(&self, kind: NodeKind) -> NodeId {
        let mut state = self.state();
        let id = NodeId::new(state.next_node);
        state.next_node += 1;
        state.nodes.insert(id, kind);
        state.events.push(RuntimeEvent::NodeCreated(id, kind));
        id
    }
}

impl Default for RecordingRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Recording {
    fn require(&self, node: NodeId) -> Result<NodeKind> {
        self.nodes
            .get(&node)
            .copied()
            .ok_or(RuntimeError::UnknownNode(node))
    }
}

#[async_trait]
impl AudioRuntime for RecordingRuntime {
    async fn resume(&self) -> Result<()> {
        tokio::task::yield_now().await;

        let mut state = self.state();
        if state.pending_resume_failures > 0 {
            state.pending_resume_failures -= 1;
            state.events.push(RuntimeEvent::ResumeFailed);
            return Err(RuntimeError::Unavailable("context suspended".to_string()));
        }
        state.events.push(RuntimeEvent::Resumed);
        Ok(())
    }

    fn create_media_source(&self, handle: &PlaybackHandle) -> Result<NodeId> {
        let element = handle.element();
        {
            let state = self.state();
            if state.bound_elsewhere.contains(&element) || state.sources.contains_key(&element) {
                return Err(RuntimeError::InvalidState(format!(
                    "{element} is already connected to a source node"
                )));
            }
        }

        let id = self.add_node(NodeKind::MediaSource(element));
        let mut state = self.state();
        state.sources.insert(element, id);
        state.source_creations += 1;
        Ok(id)
    }

    fn create_biquad(&self, filter: FilterType) -> Result<NodeId> {
        Ok(self.add_node(NodeKind::Biquad(filter)))
    }

    fn create_compressor(&self) -> Result<NodeId> {
        Ok(self.add_node(NodeKind::Compressor))
    }

    fn create_gain(&self) -> Result<NodeId> {
        Ok(self.add_node(NodeKind::Gain))
    }

    fn create_analyser(&self, options: &AnalyserOptions) -> Result<NodeId> {
        {
            let mut state = self.state();
            if state.pending_analyser_failures > 0 {
                state.pending_analyser_failures -= 1;
                return Err(RuntimeError::Platform("analyser unavailable".to_string()));
            }
        }
        let id = self.add_node(NodeKind::Analyser);
        self.state()
            .bin_counts
            .insert(id, options.frequency_bin_count());
        Ok(id)
    }

    fn destination(&self) -> NodeId {
        Self::DESTINATION
    }

    fn connect(&self, from: NodeId, to: NodeId) -> Result<()> {
        let mut state = self.state();
        state.require(from)?;
        state.require(to)?;
        if state.fail_connects {
            return Err(RuntimeError::Platform("connect refused".to_string()));
        }
        state.edges.insert((from, to));
        state.events.push(RuntimeEvent::Connected(from, to));
        Ok(())
    }

    fn disconnect(&self, from: NodeId, to: NodeId) -> Result<()> {
        let mut state = self.state();
        if !state.edges.remove(&(from, to)) {
            return Err(RuntimeError::InvalidState(format!(
                "{from} is not connected to {to}"
            )));
        }
        state.events.push(RuntimeEvent::Disconnected(from, to));
        Ok(())
    }

    fn reroute(&self, from: NodeId, old_to: NodeId, new_to: NodeId) -> Result<()> {
        let mut state = self.state();
        state.require(new_to)?;
        if !state.edges.contains(&(from, old_to)) {
            return Err(RuntimeError::InvalidState(format!(
                "{from} is not connected to {old_to}"
            )));
        }
        state.edges.remove(&(from, old_to));
        state.edges.insert((from, new_to));
        state.events.push(RuntimeEvent::Rerouted {
            from,
            old_to,
            new_to,
        });
        Ok(())
    }

    fn set_param(&self, node: NodeId, param: AudioParam, value: f32) -> Result<()> {
        let mut state = self.state();
        state.require(node)?;
        state.params.insert((node, param), value);
        state.events.push(RuntimeEvent::ParamSet(node, param, value));
        Ok(())
    }

    fn frequency_bin_count(&self, node: NodeId) -> Result<usize> {
        self.state()
            .bin_counts
            .get(&node)
            .copied()
            .ok_or(RuntimeError::UnknownNode(node))
    }

    fn byte_frequency_data(&self, node: NodeId, out: &mut [u8]) -> Result<()> {
        let state = self.state();
        if !state.bin_counts.contains_key(&node) {
            return Err(RuntimeError::UnknownNode(node));
        }
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = state.spectrum.get(i).copied().unwrap_or(0);
        }
        Ok(())
    }
}
