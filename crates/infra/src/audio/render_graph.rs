//! Render-thread side of the software runtime
//!
//! The control plane sends [`Command`]s over a crossbeam channel; the render
//! thread drains them at the start of every quantum, so a topology change
//! always lands between two quanta. Nodes are evaluated in topological order
//! of the current edges, each summing the outputs of its inputs.

use super::analyser::Analyser;
use super::media_element::ElementReader;
use crossbeam::channel::Receiver;
use ethereal_core::domain::audio::{AudioParam, FilterType, NodeId};
use ethereal_core::domain::dsp::{
    BiquadCoeffs, Compressor, CompressorParams, Effect, SmoothedValue, StereoBiquad,
};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

/// Frames per render quantum
pub const RENDER_QUANTUM_FRAMES: usize = 128;

/// The software runtime renders interleaved stereo
pub const CHANNELS: usize = 2;

const QUANTUM_SAMPLES: usize = RENDER_QUANTUM_FRAMES * CHANNELS;

/// Fraction of the remaining distance a parameter keeps per quantum
pub const PARAM_SMOOTHING: f32 = 0.6;

/// Control-plane instruction applied by the render thread
pub(crate) enum Command {
    AddNode(NodeId, Processor),
    Connect(NodeId, NodeId),
    Disconnect(NodeId, NodeId),
    Reroute {
        from: NodeId,
        old_to: NodeId,
        new_to: NodeId,
    },
    SetParam(NodeId, AudioParam, f32),
}

/// What a node does to its summed input
pub(crate) enum Processor {
    Source(ElementReader),
    Biquad(BiquadNode),
    Compressor(CompressorNode),
    Gain(SmoothedValue),
    Analyser(Arc<Mutex<Analyser>>),
    Destination,
}

impl Processor {
    pub(crate) fn biquad(filter: FilterType, sample_rate: u32) -> Self {
        Self::Biquad(BiquadNode::new(filter, sample_rate as f32))
    }

    pub(crate) fn compressor(sample_rate: u32) -> Self {
        Self::Compressor(CompressorNode::new(sample_rate))
    }

    pub(crate) fn gain() -> Self {
        Self::Gain(SmoothedValue::new(1.0, PARAM_SMOOTHING))
    }

    fn set_param(&mut self, param: AudioParam, value: f32) {
        match self {
            Self::Biquad(node) => node.set_param(param, value),
            Self::Compressor(node) => node.set_param(param, value),
            Self::Gain(gain) => {
                if param == AudioParam::Gain {
                    gain.set_target(value);
                }
            }
            Self::Source(_) | Self::Analyser(_) | Self::Destination => {}
        }
    }

    fn process(&mut self, buffer: &mut [f32], has_input: bool) {
        match self {
            Self::Source(reader) => {
                reader.fill(buffer);
            }
            Self::Biquad(node) => node.process(buffer),
            Self::Compressor(node) => node.process(buffer),
            Self::Gain(gain) => {
                let start = gain.current();
                gain.step();
                let end = gain.current();
                let frames = buffer.len() / CHANNELS;
                for (i, frame) in buffer.chunks_exact_mut(CHANNELS).enumerate() {
                    let t = (i + 1) as f32 / frames as f32;
                    let level = start + (end - start) * t;
                    frame.iter_mut().for_each(|s| *s *= level);
                }
            }
            Self::Analyser(analyser) => {
                analyser
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_stereo(buffer);
            }
            Self::Destination => {}
        }
        if !has_input && !matches!(self, Self::Source(_)) {
            buffer.fill(0.0);
        }
    }
}

/// Biquad with smoothed frequency, Q and gain
pub(crate) struct BiquadNode {
    filter: FilterType,
    sample_rate: f32,
    frequency: SmoothedValue,
    q: SmoothedValue,
    gain_db: SmoothedValue,
    stage: StereoBiquad,
    rendered: bool,
}

impl BiquadNode {
    fn new(filter: FilterType, sample_rate: f32) -> Self {
        let frequency = SmoothedValue::new(350.0, PARAM_SMOOTHING);
        let q = SmoothedValue::new(1.0, PARAM_SMOOTHING);
        let gain_db = SmoothedValue::new(0.0, PARAM_SMOOTHING);
        let coeffs = BiquadCoeffs::for_type(filter, sample_rate, 350.0, 0.0, 1.0);
        Self {
            filter,
            sample_rate,
            frequency,
            q,
            gain_db,
            stage: StereoBiquad::new(coeffs),
            rendered: false,
        }
    }

    fn set_param(&mut self, param: AudioParam, value: f32) {
        let target = match param {
            AudioParam::Frequency => &mut self.frequency,
            AudioParam::Q => &mut self.q,
            AudioParam::Gain => &mut self.gain_db,
            _ => return,
        };
        target.set_target(value);
        // Settings made before the node first renders take effect at once
        if !self.rendered {
            target.settle();
            self.update_coeffs();
        }
    }

    fn update_coeffs(&mut self) {
        self.stage.set_coeffs(BiquadCoeffs::for_type(
            self.filter,
            self.sample_rate,
            self.frequency.current(),
            self.gain_db.current(),
            self.q.current(),
        ));
    }

    fn process(&mut self, buffer: &mut [f32]) {
        self.rendered = true;
        let moved = self.frequency.step() | self.q.step() | self.gain_db.step();
        if moved {
            self.update_coeffs();
        }
        self.stage.process(buffer);
    }
}

pub(crate) struct CompressorNode {
    compressor: Compressor,
    params: CompressorParams,
}

impl CompressorNode {
    fn new(sample_rate: u32) -> Self {
        let compressor = Compressor::new(sample_rate);
        Self {
            params: compressor.params(),
            compressor,
        }
    }

    fn set_param(&mut self, param: AudioParam, value: f32) {
        match param {
            AudioParam::Threshold => self.params.threshold_db = value,
            AudioParam::Knee => self.params.knee_db = value,
            AudioParam::Ratio => self.params.ratio = value,
            AudioParam::Attack => self.params.attack_sec = value,
            AudioParam::Release => self.params.release_sec = value,
            _ => return,
        }
        self.compressor.set_params(self.params);
    }

    fn process(&mut self, buffer: &mut [f32]) {
        self.compressor.process(buffer);
    }
}

struct RenderNode {
    processor: Processor,
    output: Vec<f32>,
}

/// Node set, edges and evaluation order owned by the render thread
pub(crate) struct RenderGraph {
    commands: Receiver<Command>,
    destination: NodeId,
    nodes: HashMap<NodeId, RenderNode>,
    edges: BTreeSet<(NodeId, NodeId)>,
    order: Vec<NodeId>,
    inputs: HashMap<NodeId, Vec<NodeId>>,
    dirty: bool,
    mix: Vec<f32>,
    pending: Vec<f32>,
    pending_pos: usize,
}

impl RenderGraph {
    pub(crate) fn new(commands: Receiver<Command>, destination: NodeId) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            destination,
            RenderNode {
                processor: Processor::Destination,
                output: vec![0.0; QUANTUM_SAMPLES],
            },
        );
        Self {
            commands,
            destination,
            nodes,
            edges: BTreeSet::new(),
            order: Vec::new(),
            inputs: HashMap::new(),
            dirty: true,
            mix: vec![0.0; QUANTUM_SAMPLES],
            pending: vec![0.0; QUANTUM_SAMPLES],
            pending_pos: QUANTUM_SAMPLES,
        }
    }

    /// Apply every queued control command
    pub(crate) fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::AddNode(id, processor) => {
                    self.nodes.insert(
                        id,
                        RenderNode {
                            processor,
                            output: vec![0.0; QUANTUM_SAMPLES],
                        },
                    );
                    self.dirty = true;
                }
                Command::Connect(from, to) => {
                    self.dirty |= self.edges.insert((from, to));
                }
                Command::Disconnect(from, to) => {
                    self.dirty |= self.edges.remove(&(from, to));
                }
                Command::Reroute {
                    from,
                    old_to,
                    new_to,
                } => {
                    self.edges.remove(&(from, old_to));
                    self.edges.insert((from, new_to));
                    self.dirty = true;
                }
                Command::SetParam(node, param, value) => {
                    if let Some(node) = self.nodes.get_mut(&node) {
                        node.processor.set_param(param, value);
                    }
                }
            }
        }
    }

    /// Fill `out` (interleaved stereo) with rendered audio
    pub(crate) fn render(&mut self, out: &mut [f32]) {
        let mut written = 0;
        while written < out.len() {
            if self.pending_pos >= QUANTUM_SAMPLES {
                self.apply_commands();
                self.render_quantum();
                self.pending_pos = 0;
            }
            let take = (QUANTUM_SAMPLES - self.pending_pos).min(out.len() - written);
            out[written..written + take]
                .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + take]);
            self.pending_pos += take;
            written += take;
        }
    }

    /// Drop any partially consumed quantum, used when rendering is suspended
    pub(crate) fn discard_pending(&mut self) {
        self.pending_pos = QUANTUM_SAMPLES;
    }

    fn render_quantum(&mut self) {
        if self.dirty {
            self.rebuild_order();
        }

        for index in 0..self.order.len() {
            let id = self.order[index];
            self.mix.fill(0.0);
            let mut has_input = false;
            if let Some(inputs) = self.inputs.get(&id) {
                for input in inputs {
                    if let Some(source) = self.nodes.get(input) {
                        has_input = true;
                        for (acc, s) in self.mix.iter_mut().zip(source.output.iter()) {
                            *acc += *s;
                        }
                    }
                }
            }
            if let Some(node) = self.nodes.get_mut(&id) {
                node.output.copy_from_slice(&self.mix);
                node.processor.process(&mut node.output, has_input);
            }
        }

        match self.nodes.get(&self.destination) {
            Some(node) => self.pending.copy_from_slice(&node.output),
            None => self.pending.fill(0.0),
        }
    }

    /// Kahn's algorithm over the live edges; ties broken by node id so the
    /// order is stable. Nodes on a cycle are left out and render nothing.
    fn rebuild_order(&mut self) {
        let mut indegree: HashMap<NodeId, usize> = self.nodes.keys().map(|id| (*id, 0)).collect();
        self.inputs.clear();
        for &(from, to) in &self.edges {
            if !self.nodes.contains_key(&from) || !self.nodes.contains_key(&to) {
                continue;
            }
            *indegree.entry(to).or_insert(0) += 1;
            self.inputs.entry(to).or_default().push(from);
        }

        let mut ready: Vec<NodeId> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(id, _)| *id)
            .collect();
        ready.sort();
        let mut queue: VecDeque<NodeId> = ready.into();

        self.order.clear();
        while let Some(id) = queue.pop_front() {
            self.order.push(id);
            let mut released = Vec::new();
            let outgoing = self
                .edges
                .range((id, NodeId::new(0))..)
                .take_while(|(from, _)| *from == id);
            for &(_, to) in outgoing {
                if let Some(d) = indegree.get_mut(&to) {
                    *d -= 1;
                    if *d == 0 {
                        released.push(to);
                    }
                }
            }
            released.sort();
            queue.extend(released);
        }
        self.dirty = false;
    }

    #[cfg(test)]
    pub(crate) fn order(&self) -> &[NodeId] {
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::media_element::MediaElement;
    use crossbeam::channel::{unbounded, Sender};

    const DEST: NodeId = NodeId::new(0);

    fn graph() -> (Sender<Command>, RenderGraph) {
        let (tx, rx) = unbounded();
        (tx, RenderGraph::new(rx, DEST))
    }

    fn id(n: u64) -> NodeId {
        NodeId::new(n)
    }

    fn source_with(element: &MediaElement, value: f32, quanta: usize) -> Processor {
        for _ in 0..quanta {
            element.push_samples(vec![value; QUANTUM_SAMPLES]);
        }
        Processor::Source(element.reader())
    }

    #[test]
    fn test_empty_graph_renders_silence() {
        let (_tx, mut graph) = graph();
        let mut out = vec![1.0; 300];
        graph.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_source_to_destination() {
        let (tx, mut graph) = graph();
        let element = MediaElement::new("audio");
        tx.send(Command::AddNode(id(1), source_with(&element, 0.25, 2)))
            .unwrap();
        tx.send(Command::Connect(id(1), DEST)).unwrap();

        let mut out = vec![0.0; QUANTUM_SAMPLES];
        graph.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.25));
    }

    #[test]
    fn test_gain_ramps_to_target() {
        let (tx, mut graph) = graph();
        let element = MediaElement::with_capacity("audio", 64);
        tx.send(Command::AddNode(id(1), source_with(&element, 1.0, 40)))
            .unwrap();
        tx.send(Command::AddNode(id(2), Processor::gain())).unwrap();
        tx.send(Command::Connect(id(1), id(2))).unwrap();
        tx.send(Command::Connect(id(2), DEST)).unwrap();
        tx.send(Command::SetParam(id(2), AudioParam::Gain, 0.0))
            .unwrap();

        let mut first = vec![0.0; QUANTUM_SAMPLES];
        graph.render(&mut first);
        // No step change within the first quantum
        assert!(first[0] > 0.9);
        assert!(first[QUANTUM_SAMPLES - 1] < first[0]);

        let mut out = vec![0.0; QUANTUM_SAMPLES];
        for _ in 0..30 {
            graph.render(&mut out);
        }
        assert!(out.iter().all(|s| s.abs() < 1e-3));
    }

    #[test]
    fn test_sums_fan_in() {
        let (tx, mut graph) = graph();
        let a = MediaElement::new("a");
        let b = MediaElement::new("b");
        tx.send(Command::AddNode(id(1), source_with(&a, 0.25, 1)))
            .unwrap();
        tx.send(Command::AddNode(id(2), source_with(&b, 0.5, 1)))
            .unwrap();
        tx.send(Command::Connect(id(1), DEST)).unwrap();
        tx.send(Command::Connect(id(2), DEST)).unwrap();

        let mut out = vec![0.0; 8];
        graph.render(&mut out);
        assert!(out.iter().all(|&s| (s - 0.75).abs() < 1e-6));
    }

    #[test]
    fn test_order_follows_edges() {
        let (tx, mut graph) = graph();
        tx.send(Command::AddNode(id(3), Processor::gain())).unwrap();
        tx.send(Command::AddNode(id(2), Processor::gain())).unwrap();
        tx.send(Command::AddNode(id(1), Processor::gain())).unwrap();
        tx.send(Command::Connect(id(3), id(2))).unwrap();
        tx.send(Command::Connect(id(2), id(1))).unwrap();
        tx.send(Command::Connect(id(1), DEST)).unwrap();

        let mut out = vec![0.0; 4];
        graph.render(&mut out);

        let pos = |n: NodeId| graph.order().iter().position(|x| *x == n).unwrap();
        assert!(pos(id(3)) < pos(id(2)));
        assert!(pos(id(2)) < pos(id(1)));
        assert!(pos(id(1)) < pos(DEST));
    }

    #[test]
    fn test_reroute_moves_one_edge() {
        let (tx, mut graph) = graph();
        let element = MediaElement::with_capacity("audio", 8);
        tx.send(Command::AddNode(id(1), source_with(&element, 0.5, 4)))
            .unwrap();
        tx.send(Command::AddNode(id(2), Processor::gain())).unwrap();
        tx.send(Command::SetParam(id(2), AudioParam::Gain, 0.0))
            .unwrap();
        tx.send(Command::Connect(id(1), DEST)).unwrap();

        let mut out = vec![0.0; QUANTUM_SAMPLES];
        graph.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.5));

        // Gain node is a dead end: rerouting into it silences the output
        tx.send(Command::Reroute {
            from: id(1),
            old_to: DEST,
            new_to: id(2),
        })
        .unwrap();
        graph.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(graph.edges.contains(&(id(1), id(2))));
        assert!(!graph.edges.contains(&(id(1), DEST)));
    }

    #[test]
    fn test_node_without_input_is_silent() {
        let (tx, mut graph) = graph();
        tx.send(Command::AddNode(
            id(1),
            Processor::biquad(FilterType::Peaking, 48000),
        ))
        .unwrap();
        tx.send(Command::Connect(id(1), DEST)).unwrap();

        let mut out = vec![1.0; QUANTUM_SAMPLES];
        graph.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_biquad_params_before_first_render_apply_immediately() {
        let mut node = BiquadNode::new(FilterType::Peaking, 48000.0);
        node.set_param(AudioParam::Frequency, 1000.0);
        node.set_param(AudioParam::Gain, 6.0);
        assert_eq!(node.frequency.current(), 1000.0);
        assert_eq!(node.gain_db.current(), 6.0);

        node.process(&mut [0.0; QUANTUM_SAMPLES]);
        node.set_param(AudioParam::Gain, -6.0);
        assert_eq!(node.gain_db.current(), 6.0);
        node.process(&mut [0.0; QUANTUM_SAMPLES]);
        assert!(node.gain_db.current() < 6.0);
        assert!(node.gain_db.current() > -6.0);
    }

    #[test]
    fn test_compressor_params_reach_processor() {
        let mut node = CompressorNode::new(48000);
        node.set_param(AudioParam::Threshold, -40.0);
        node.set_param(AudioParam::Ratio, 4.0);
        node.set_param(AudioParam::Frequency, 1.0);
        let params = node.compressor.params();
        assert_eq!(params.threshold_db, -40.0);
        assert_eq!(params.ratio, 4.0);
    }
}
