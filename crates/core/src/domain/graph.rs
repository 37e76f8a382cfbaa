//! Signal graph around the session's playback element
//!
//! [`SignalGraph`] is the only component that creates processing nodes or
//! changes their connections. The fixed topology is:
//!
//! ```text
//! source -> bass -> treble -> band[0] -> ... -> band[n-1] -> gain -> (compressor ->) destination
//!                                                    \-> analyser
//! ```
//!
//! The source node is created at most once per element. Disconnecting drops
//! every edge but keeps the nodes, so a later bind only rewires. Topology
//! changes are serialized on an async mutex; parameter pushes are synchronous
//! and never wait for it.

use crate::domain::audio::{
    AnalyserOptions, AudioParam, AudioRuntime, ConnectionState, ElementId, NodeId,
    PlaybackHandle, RuntimeError,
};
use crate::domain::config::ConfigError;
use crate::domain::dsp::CompressorParams;
use crate::domain::filter_chain::FilterChainState;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, trace, warn};

/// Errors from binding the graph to a playback element
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BindError {
    /// The element already feeds a source node of another graph. Only a new
    /// element can be bound.
    #[error("{element} is already bound to another signal graph")]
    AlreadyBoundElsewhere { element: ElementId },

    /// The processing context could not be created or resumed; retry later
    #[error("Audio runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// This graph is connected to a different element; disconnect first
    #[error("Graph is bound to {bound}, cannot bind {requested}")]
    DifferentHandle {
        bound: ElementId,
        requested: ElementId,
    },

    #[error("Graph error: {0}")]
    Graph(#[from] RuntimeError),
}

impl BindError {
    /// Whether a later bind of the same handle can succeed; a different
    /// handle needs a disconnect first
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BindError::AlreadyBoundElsewhere { .. })
    }
}

pub type Result<T> = std::result::Result<T, BindError>;

/// Every node the graph owns, created once on the first successful bind
#[derive(Debug, Clone)]
struct GraphNodes {
    /// Bass shelf, treble shelf, then peaking bands ascending
    stages: Vec<NodeId>,
    gain: NodeId,
    compressor: NodeId,
    analyser: NodeId,
    analyser_bins: usize,
    destination: NodeId,
}

impl GraphNodes {
    fn last_stage(&self) -> NodeId {
        self.stages.last().copied().unwrap_or(self.gain)
    }

    /// Edges of a wired graph, tail excluded
    fn chain_edges(&self, source: NodeId) -> Vec<(NodeId, NodeId)> {
        let mut edges = Vec::with_capacity(self.stages.len() + 3);
        let mut previous = source;
        for &stage in &self.stages {
            edges.push((previous, stage));
            previous = stage;
        }
        edges.push((previous, self.gain));
        edges.push((self.last_stage(), self.analyser));
        edges.push((self.compressor, self.destination));
        edges
    }

    fn tail_edge(&self, compressor: bool) -> (NodeId, NodeId) {
        if compressor {
            (self.gain, self.compressor)
        } else {
            (self.gain, self.destination)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BoundSource {
    element: ElementId,
    node: NodeId,
}

/// Nodes made by a bind that failed before all of them existed. The next
/// attempt picks up from here instead of creating a second set.
#[derive(Debug, Default)]
struct PendingNodes {
    stages: Vec<NodeId>,
    gain: Option<NodeId>,
    compressor: Option<NodeId>,
    analyser: Option<NodeId>,
}

fn reuse_or_create(
    slot: &mut Option<NodeId>,
    create: impl FnOnce() -> std::result::Result<NodeId, RuntimeError>,
) -> std::result::Result<NodeId, RuntimeError> {
    if let Some(node) = *slot {
        return Ok(node);
    }
    let node = create()?;
    *slot = Some(node);
    Ok(node)
}

/// Connection state guarded by the topology lock
#[derive(Debug, Default)]
struct Topology {
    source: Option<BoundSource>,
    pending: PendingNodes,
    edges: BTreeSet<(NodeId, NodeId)>,
    compressor_wanted: bool,
    compressor_spliced: bool,
}

#[derive(Debug)]
struct Status {
    state: ConnectionState,
    source_element: Option<ElementId>,
    /// Permanent failure for one element; later binds of it return this
    terminal: Option<(ElementId, BindError)>,
}

/// Last requested parameters, pushed onto nodes as soon as they exist
#[derive(Debug)]
struct Staged {
    chain: FilterChainState,
    compressor: CompressorParams,
    output_gain: f32,
}

type BindOutcome = Option<Result<()>>;

/// Removes the in-flight entry when the leading bind finishes or is dropped
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashMap<ElementId, watch::Receiver<BindOutcome>>>,
    element: ElementId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.element);
    }
}

/// Read-only handle on the analyser node
#[derive(Clone)]
pub struct AnalyserTap {
    runtime: Arc<dyn AudioRuntime>,
    node: NodeId,
    bin_count: usize,
}

impl AnalyserTap {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Number of frequency bins per frame
    pub fn bin_count(&self) -> usize {
        self.bin_count
    }

    /// Copy the current byte magnitudes into `out`
    pub fn read(&self, out: &mut [u8]) -> std::result::Result<(), RuntimeError> {
        self.runtime.byte_frequency_data(self.node, out)
    }

    /// Current magnitudes as a fresh frame of `bin_count` bytes
    pub fn frame(&self) -> std::result::Result<Vec<u8>, RuntimeError> {
        let mut bins = vec![0u8; self.bin_count];
        self.read(&mut bins)?;
        Ok(bins)
    }
}

impl fmt::Debug for AnalyserTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyserTap")
            .field("node", &self.node)
            .field("bin_count", &self.bin_count)
            .finish()
    }
}

/// Owner of the processing nodes and their connections
pub struct SignalGraph {
    runtime: Arc<dyn AudioRuntime>,
    analyser_options: AnalyserOptions,
    staged: Mutex<Staged>,
    nodes: RwLock<Option<Arc<GraphNodes>>>,
    status: RwLock<Status>,
    topology: tokio::sync::Mutex<Topology>,
    in_flight: Mutex<HashMap<ElementId, watch::Receiver<BindOutcome>>>,
}

impl SignalGraph {
    /// Create an unbound graph. No node exists until the first bind.
    ///
    /// Analyser options are checked here so a bad value fails construction
    /// rather than every bind.
    pub fn new(
        runtime: Arc<dyn AudioRuntime>,
        chain: FilterChainState,
        analyser_options: AnalyserOptions,
    ) -> std::result::Result<Self, ConfigError> {
        analyser_options.validate().map_err(ConfigError::Invalid)?;
        Ok(Self {
            runtime,
            analyser_options,
            staged: Mutex::new(Staged {
                chain,
                compressor: CompressorParams::default(),
                output_gain: 1.0,
            }),
            nodes: RwLock::new(None),
            status: RwLock::new(Status {
                state: ConnectionState::Unbound,
                source_element: None,
                terminal: None,
            }),
            topology: tokio::sync::Mutex::new(Topology::default()),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Element whose source node this graph owns, if any
    pub fn bound_element(&self) -> Option<ElementId> {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .source_element
    }

    /// Bind to `handle` and wire the chain.
    ///
    /// The source node is created on the first successful call only. A bind
    /// of an already connected handle succeeds without touching the runtime.
    /// After a disconnect the graph may be bound to a different element; the
    /// processing nodes are kept and only a source for that element is made.
    /// Concurrent binds of one handle share a single attempt.
    #[instrument(skip(self, handle), fields(element = %handle.element()))]
    pub async fn bind(&self, handle: &PlaybackHandle) -> Result<()> {
        if let Some(settled) = self.settled_bind(handle.element()) {
            return settled;
        }

        let element = handle.element();
        let (mut outcome, leader) = {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(&element) {
                Some(rx) => (rx.clone(), None),
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(element, rx.clone());
                    (rx, Some(tx))
                }
            }
        };

        match leader {
            Some(tx) => {
                let _guard = InFlightGuard {
                    in_flight: &self.in_flight,
                    element,
                };
                let result = self.bind_exclusive(handle).await;
                tx.send_replace(Some(result.clone()));
                result
            }
            None => {
                debug!("Bind already in flight, awaiting its result");
                match outcome.wait_for(Option::is_some).await {
                    Ok(settled) => settled
                        .clone()
                        .unwrap_or_else(|| Err(Self::cancelled_bind())),
                    Err(_) => Err(Self::cancelled_bind()),
                }
            }
        }
    }

    fn cancelled_bind() -> BindError {
        BindError::RuntimeUnavailable("bind attempt cancelled".to_string())
    }

    /// Results that need no runtime call
    fn settled_bind(&self, element: ElementId) -> Option<Result<()>> {
        let status = self.status.read().unwrap_or_else(PoisonError::into_inner);
        if let Some((failed, error)) = &status.terminal {
            if *failed == element {
                return Some(Err(error.clone()));
            }
        }
        match status.source_element {
            Some(bound) if status.state == ConnectionState::Connected => {
                if bound == element {
                    Some(Ok(()))
                } else {
                    Some(Err(BindError::DifferentHandle {
                        bound,
                        requested: element,
                    }))
                }
            }
            _ => None,
        }
    }

    async fn bind_exclusive(&self, handle: &PlaybackHandle) -> Result<()> {
        let mut topology = self.topology.lock().await;
        let element = handle.element();

        if let Some(source) = topology.source {
            match (source.element == element, self.is_connected()) {
                (true, true) => return Ok(()),
                (false, true) => {
                    return Err(BindError::DifferentHandle {
                        bound: source.element,
                        requested: element,
                    })
                }
                (false, false) => {
                    // Moving to a new element; its own source node replaces the old one
                    if let Some(e) = self.unwire(&mut topology) {
                        warn!(error = %e, "Leftover edges could not be removed");
                    }
                    debug!(old = %source.element, "Rebinding to a new element");
                }
                (true, false) => {}
            }
        }

        self.set_state(ConnectionState::Binding);
        match self.bind_locked(&mut topology, handle).await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                info!(edges = topology.edges.len(), "Signal graph connected");
                Ok(())
            }
            Err(e) => {
                let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
                status.state = ConnectionState::Failed;
                if let BindError::AlreadyBoundElsewhere { .. } = e {
                    warn!(error = %e, "Playback element already has a source node");
                    status.terminal = Some((element, e.clone()));
                } else {
                    error!(error = %e, "Failed to bind signal graph");
                }
                Err(e)
            }
        }
    }

    async fn bind_locked(&self, topology: &mut Topology, handle: &PlaybackHandle) -> Result<()> {
        self.runtime.resume().await.map_err(|e| match e {
            RuntimeError::Unavailable(reason) => BindError::RuntimeUnavailable(reason),
            other => BindError::Graph(other),
        })?;

        let source = match topology.source {
            Some(source) if source.element == handle.element() => source.node,
            _ => {
                let element = handle.element();
                let node = self
                    .runtime
                    .create_media_source(handle)
                    .map_err(|e| match e {
                        RuntimeError::InvalidState(_) => {
                            BindError::AlreadyBoundElsewhere { element }
                        }
                        RuntimeError::Unavailable(reason) => {
                            BindError::RuntimeUnavailable(reason)
                        }
                        other => BindError::Graph(other),
                    })?;
                topology.source = Some(BoundSource { element, node });
                self.status
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .source_element = Some(element);
                debug!(%node, "Media source created");
                node
            }
        };

        let nodes = match self.nodes() {
            Some(nodes) => nodes,
            None => self.create_nodes(&mut topology.pending)?,
        };

        self.wire(topology, &nodes, source)?;
        Ok(())
    }

    /// Create the processing nodes, publish them, and push staged parameters.
    ///
    /// Nodes made before a failure stay in `pending` for the next attempt.
    fn create_nodes(
        &self,
        pending: &mut PendingNodes,
    ) -> std::result::Result<Arc<GraphNodes>, RuntimeError> {
        let stage_specs = self.staged().chain.stages();
        for spec in stage_specs.iter().skip(pending.stages.len()) {
            let node = self.runtime.create_biquad(spec.role.filter_type())?;
            pending.stages.push(node);
        }
        let gain = reuse_or_create(&mut pending.gain, || self.runtime.create_gain())?;
        let compressor =
            reuse_or_create(&mut pending.compressor, || self.runtime.create_compressor())?;
        let analyser = reuse_or_create(&mut pending.analyser, || {
            self.runtime.create_analyser(&self.analyser_options)
        })?;
        let analyser_bins = self.runtime.frequency_bin_count(analyser)?;

        let nodes = Arc::new(GraphNodes {
            stages: std::mem::take(&mut pending.stages),
            gain,
            compressor,
            analyser,
            analyser_bins,
            destination: self.runtime.destination(),
        });
        *pending = PendingNodes::default();
        *self.nodes.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&nodes));

        let staged = self.staged();
        self.push_chain(&nodes, &staged.chain)?;
        self.push_compressor(&nodes, &staged.compressor)?;
        self.runtime
            .set_param(nodes.gain, AudioParam::Gain, staged.output_gain)?;

        debug!(stages = nodes.stages.len(), "Processing nodes created");
        Ok(nodes)
    }

    /// Connect every missing edge; on failure undo this call's connections
    fn wire(
        &self,
        topology: &mut Topology,
        nodes: &GraphNodes,
        source: NodeId,
    ) -> std::result::Result<(), RuntimeError> {
        let spliced = topology.compressor_wanted;
        let mut wanted = nodes.chain_edges(source);
        wanted.push(nodes.tail_edge(spliced));

        let mut added = Vec::new();
        for (from, to) in wanted {
            if topology.edges.contains(&(from, to)) {
                continue;
            }
            if let Err(e) = self.runtime.connect(from, to) {
                for &(f, t) in added.iter().rev() {
                    if let Err(undo) = self.runtime.disconnect(f, t) {
                        warn!(from = %f, to = %t, error = %undo, "Failed to undo connection");
                    }
                    topology.edges.remove(&(f, t));
                }
                return Err(e);
            }
            topology.edges.insert((from, to));
            added.push((from, to));
        }

        topology.compressor_spliced = spliced;
        trace!(added = added.len(), "Graph wired");
        Ok(())
    }

    /// Drop every connection, keeping the nodes for a later bind.
    ///
    /// A graph that was never bound is left untouched.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> std::result::Result<(), RuntimeError> {
        let mut topology = self.topology.lock().await;
        if topology.source.is_none() {
            return Ok(());
        }

        let first_error = self.unwire(&mut topology);
        self.set_state(ConnectionState::Disconnected);
        info!("Signal graph disconnected");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn unwire(&self, topology: &mut Topology) -> Option<RuntimeError> {
        let mut first_error = None;
        let edges = std::mem::take(&mut topology.edges);
        for (from, to) in edges {
            if let Err(e) = self.runtime.disconnect(from, to) {
                error!(%from, %to, error = %e, "Failed to disconnect edge");
                first_error.get_or_insert(e);
            }
        }
        topology.compressor_spliced = false;
        first_error
    }

    /// Tear down every edge and wire the chain again on the existing nodes.
    ///
    /// Used to recover a graph whose connections are in doubt; requires a
    /// previously bound source.
    #[instrument(skip(self))]
    pub async fn rebuild(&self) -> Result<()> {
        let mut topology = self.topology.lock().await;
        let (Some(source), Some(nodes)) = (topology.source, self.nodes()) else {
            return Err(BindError::Graph(RuntimeError::InvalidState(
                "graph has never been bound".to_string(),
            )));
        };

        if let Some(e) = self.unwire(&mut topology) {
            warn!(error = %e, "Stale edge during rebuild");
        }
        match self.wire(&mut topology, &nodes, source.node) {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                info!("Signal graph rebuilt");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Failed);
                error!(error = %e, "Failed to rebuild signal graph");
                Err(e.into())
            }
        }
    }

    /// Splice the compressor into the tail or bypass it.
    ///
    /// The gain stage's single outgoing edge is moved in one runtime call.
    /// While unbound or disconnected only the preference is recorded.
    #[instrument(skip(self))]
    pub async fn set_compressor_enabled(&self, enabled: bool) -> std::result::Result<(), RuntimeError> {
        let mut topology = self.topology.lock().await;
        topology.compressor_wanted = enabled;

        let Some(nodes) = self.nodes() else {
            return Ok(());
        };
        if !self.is_connected() || topology.compressor_spliced == enabled {
            return Ok(());
        }

        let (_, old_to) = nodes.tail_edge(topology.compressor_spliced);
        let (from, new_to) = nodes.tail_edge(enabled);
        self.runtime.reroute(from, old_to, new_to)?;
        topology.edges.remove(&(from, old_to));
        topology.edges.insert((from, new_to));
        topology.compressor_spliced = enabled;

        debug!(enabled, "Compressor splice updated");
        Ok(())
    }

    pub async fn compressor_spliced(&self) -> bool {
        self.topology.lock().await.compressor_spliced
    }

    /// Current edges, sorted
    pub async fn edges(&self) -> Vec<(NodeId, NodeId)> {
        self.topology.lock().await.edges.iter().copied().collect()
    }

    /// Push filter parameters onto the live stages in place.
    ///
    /// Before the first bind the values are only staged.
    pub fn apply_filter_chain(&self, chain: &FilterChainState) -> std::result::Result<(), RuntimeError> {
        let mut staged = self.staged();
        if let Some(nodes) = self.nodes() {
            self.push_chain(&nodes, chain)?;
        }
        staged.chain = chain.clone();
        Ok(())
    }

    pub fn set_compressor_params(&self, params: CompressorParams) -> std::result::Result<(), RuntimeError> {
        let params = params.clamped();
        let mut staged = self.staged();
        if let Some(nodes) = self.nodes() {
            self.push_compressor(&nodes, &params)?;
        }
        staged.compressor = params;
        Ok(())
    }

    /// Linear factor applied by the gain stage
    pub fn set_output_gain(&self, gain: f32) -> std::result::Result<(), RuntimeError> {
        let gain = if gain.is_finite() { gain.max(0.0) } else { 1.0 };
        let mut staged = self.staged();
        if let Some(nodes) = self.nodes() {
            self.runtime.set_param(nodes.gain, AudioParam::Gain, gain)?;
            trace!(gain, "Output gain pushed");
        }
        staged.output_gain = gain;
        Ok(())
    }

    /// Analyser handle, once nodes exist
    pub fn analyser_tap(&self) -> Option<AnalyserTap> {
        self.nodes().map(|nodes| AnalyserTap {
            runtime: Arc::clone(&self.runtime),
            node: nodes.analyser,
            bin_count: nodes.analyser_bins,
        })
    }

    /// Analyser handle while the graph is connected
    pub fn live_tap(&self) -> Option<AnalyserTap> {
        if self.is_connected() {
            self.analyser_tap()
        } else {
            None
        }
    }

    fn push_chain(
        &self,
        nodes: &GraphNodes,
        chain: &FilterChainState,
    ) -> std::result::Result<(), RuntimeError> {
        let stages = chain.stages();
        if stages.len() != nodes.stages.len() {
            return Err(RuntimeError::InvalidState(format!(
                "chain has {} stages, graph has {}",
                stages.len(),
                nodes.stages.len()
            )));
        }
        for (&node, stage) in nodes.stages.iter().zip(&stages) {
            self.runtime
                .set_param(node, AudioParam::Frequency, stage.frequency_hz)?;
            self.runtime.set_param(node, AudioParam::Q, stage.quality_factor)?;
            self.runtime.set_param(node, AudioParam::Gain, stage.gain_db)?;
        }
        trace!(bands = ?chain.bands, "Filter chain pushed");
        Ok(())
    }

    fn push_compressor(
        &self,
        nodes: &GraphNodes,
        params: &CompressorParams,
    ) -> std::result::Result<(), RuntimeError> {
        let node = nodes.compressor;
        self.runtime
            .set_param(node, AudioParam::Threshold, params.threshold_db)?;
        self.runtime.set_param(node, AudioParam::Knee, params.knee_db)?;
        self.runtime.set_param(node, AudioParam::Ratio, params.ratio)?;
        self.runtime.set_param(node, AudioParam::Attack, params.attack_sec)?;
        self.runtime
            .set_param(node, AudioParam::Release, params.release_sec)?;
        trace!(?params, "Compressor parameters pushed");
        Ok(())
    }

    fn nodes(&self) -> Option<Arc<GraphNodes>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn staged(&self) -> std::sync::MutexGuard<'_, Staged> {
        self.staged.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.status
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .state = state;
    }
}

impl fmt::Debug for SignalGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalGraph")
            .field("state", &self.connection_state())
            .field("bound_element", &self.bound_element())
            .finish_non_exhaustive()
    }
}
