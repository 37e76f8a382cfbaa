//! Media elements: the players feeding PCM into a software runtime
//!
//! A [`MediaElement`] is the in-process stand-in for a page's `<audio>`
//! element. The player side pushes interleaved stereo blocks; a media source
//! node drains them on the render thread. An element can feed exactly one
//! source node for its whole lifetime, whichever runtime asks first.

use crossbeam::channel::{bounded, Receiver, SendTimeoutError, Sender};
use ethereal_core::domain::audio::{ElementId, PlaybackHandle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Blocks buffered between the player and the render thread
pub const DEFAULT_QUEUE_BLOCKS: usize = 16;

/// A playback element producing interleaved stereo `f32` blocks
#[derive(Debug)]
pub struct MediaElement {
    handle: PlaybackHandle,
    sender: Sender<Vec<f32>>,
    receiver: Receiver<Vec<f32>>,
    claimed: AtomicBool,
}

impl MediaElement {
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_capacity(label, DEFAULT_QUEUE_BLOCKS)
    }

    pub fn with_capacity(label: impl Into<String>, blocks: usize) -> Self {
        let (sender, receiver) = bounded(blocks.max(1));
        Self {
            handle: PlaybackHandle::new(ElementId::next(), label),
            sender,
            receiver,
            claimed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ElementId {
        self.handle.element()
    }

    pub fn handle(&self) -> PlaybackHandle {
        self.handle.clone()
    }

    /// Queue a block without waiting; returns false if the queue is full
    pub fn push_samples(&self, block: Vec<f32>) -> bool {
        self.sender.try_send(block).is_ok()
    }

    /// Queue a block, waiting up to `timeout` for room; the block comes back
    /// if it could not be queued.
    ///
    /// Players pace themselves with this: the render thread frees a slot
    /// every time it consumes a block.
    pub fn push_samples_timeout(&self, block: Vec<f32>, timeout: Duration) -> Result<(), Vec<f32>> {
        self.sender.send_timeout(block, timeout).map_err(|e| match e {
            SendTimeoutError::Timeout(block) | SendTimeoutError::Disconnected(block) => block,
        })
    }

    /// Blocks waiting to be rendered
    pub fn queued_blocks(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Reserve the element for one source node; false if already taken
    pub(crate) fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn reader(&self) -> ElementReader {
        ElementReader {
            receiver: self.receiver.clone(),
            pending: Vec::new(),
            position: 0,
        }
    }
}

/// Render-side cursor over an element's queued blocks
#[derive(Debug)]
pub(crate) struct ElementReader {
    receiver: Receiver<Vec<f32>>,
    pending: Vec<f32>,
    position: usize,
}

impl ElementReader {
    /// Fill `out` from queued blocks; underruns are zero-filled.
    /// Returns the number of samples that came from the element.
    pub(crate) fn fill(&mut self, out: &mut [f32]) -> usize {
        let mut written = 0;
        while written < out.len() {
            if self.position >= self.pending.len() {
                match self.receiver.try_recv() {
                    Ok(block) => {
                        self.pending = block;
                        self.position = 0;
                        continue;
                    }
                    Err(_) => break,
                }
            }
            let take = (self.pending.len() - self.position).min(out.len() - written);
            out[written..written + take]
                .copy_from_slice(&self.pending[self.position..self.position + take]);
            self.position += take;
            written += take;
        }
        out[written..].fill(0.0);
        written
    }

    #[cfg(test)]
    fn wait_for_block(&self, timeout: Duration) -> bool {
        self.receiver.recv_timeout(timeout).is_ok()
    }
}

/// Shared lookup from element ids to elements, consulted by runtimes when a
/// graph binds to a playback handle
#[derive(Debug, Default)]
pub struct ElementRegistry {
    elements: RwLock<HashMap<ElementId, Arc<MediaElement>>>,
}

impl ElementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a new element
    pub fn create(&self, label: impl Into<String>) -> Arc<MediaElement> {
        let element = Arc::new(MediaElement::new(label));
        self.insert(Arc::clone(&element));
        element
    }

    pub fn insert(&self, element: Arc<MediaElement>) {
        debug!(element = %element.id(), "Registering media element");
        self.elements
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(element.id(), element);
    }

    pub fn get(&self, id: ElementId) -> Option<Arc<MediaElement>> {
        self.elements
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.elements
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
