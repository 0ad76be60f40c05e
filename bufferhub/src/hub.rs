//! The registry behind every broker: which buffers exist, who holds their
//! producer and consumer slots, and what happens when a holder goes away.

use crate::allocator::GraphicsAllocator;
use crate::broker::Liveness;
use crate::buffer::SharedBuffer;
use crate::descriptor::{BufferDescriptor, BufferId, BufferSpec};
use crate::error::{BufferHubError, Result};
use crate::fence::Fence;
use crate::slot::{Client, ConsumerSlot};
use crate::state::BufferState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// A process (or connection) holding handles through a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Node {
    buffer: SharedBuffer,
    /// Present while the buffer is persistent.
    name: Option<String>,
    producer: Option<PeerId>,
    consumers: HashMap<ConsumerSlot, PeerId>,
}

impl Node {
    fn is_unreferenced(&self) -> bool {
        self.name.is_none() && self.producer.is_none() && self.consumers.is_empty()
    }

    fn detach_producer(&mut self) -> Result<()> {
        self.producer = None;
        if self.name.is_none() {
            debug!(buffer_id = %self.buffer.id(), "producer gone, hanging up consumers");
            self.buffer.hang_up()?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Registry {
    nodes: HashMap<BufferId, Node>,
    names: HashMap<String, BufferId>,
    next_buffer_id: u64,
    next_peer_id: u64,
}

impl Registry {
    fn node_mut(&mut self, id: BufferId) -> Result<&mut Node> {
        self.nodes
            .get_mut(&id)
            .ok_or(BufferHubError::UnknownBuffer(id.get()))
    }

    fn producer_node(&mut self, peer: PeerId, id: BufferId) -> Result<&mut Node> {
        let node = self.node_mut(id)?;
        if node.producer != Some(peer) {
            return Err(BufferHubError::NotProducer(id.get()));
        }
        Ok(node)
    }

    /// A node whose producer side is still alive, with `slot` held by `peer`.
    fn consumer_node(
        &mut self,
        peer: PeerId,
        id: BufferId,
        slot: ConsumerSlot,
    ) -> Result<&mut Node> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or(BufferHubError::BrokenPipe)?;
        if node.buffer.is_hung_up() {
            return Err(BufferHubError::BrokenPipe);
        }
        if node.consumers.get(&slot) != Some(&peer) {
            return Err(BufferHubError::InvalidSlot(slot.index()));
        }
        Ok(node)
    }

    fn reap(&mut self, id: BufferId) {
        if self.nodes.get(&id).is_some_and(Node::is_unreferenced) {
            self.nodes.remove(&id);
            debug!(buffer_id = %id, "buffer destroyed");
        }
    }
}

/// Owns every live buffer and brokers the synchronous call style for all
/// connected peers.
pub struct BufferHub {
    allocator: Box<dyn GraphicsAllocator>,
    registry: Mutex<Registry>,
}

impl BufferHub {
    pub fn new<A: GraphicsAllocator + 'static>(allocator: A) -> Self {
        BufferHub {
            allocator: Box::new(allocator),
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn register_peer(&self) -> PeerId {
        let mut registry = self.registry.lock();
        registry.next_peer_id += 1;
        PeerId(registry.next_peer_id)
    }

    /// Creates a buffer, or re-attaches to the persistent buffer called
    /// `name` if it exists. Re-attaching requires identical parameters and
    /// no other live producer.
    pub fn create_producer(
        &self,
        peer: PeerId,
        spec: &BufferSpec,
        name: Option<&str>,
    ) -> Result<BufferDescriptor> {
        let mut registry = self.registry.lock();

        if let Some(id) = name.and_then(|name| registry.names.get(name).copied()) {
            let name = name.unwrap_or_default();
            let node = registry.node_mut(id)?;
            if node.buffer.spec() != spec {
                return Err(BufferHubError::ParameterMismatch(name.to_string()));
            }
            if node.producer.is_some() {
                return Err(BufferHubError::ProducerExists(name.to_string()));
            }
            self.allocator.import(node.buffer.graphics_fd(), spec)?;

            let descriptor = node.buffer.descriptor(Client::Producer)?;
            node.producer = Some(peer);
            debug!(buffer_id = %id, name, %peer, "producer re-attached");
            return Ok(descriptor);
        }

        spec.validate()?;
        let graphics = self.allocator.allocate(spec)?;
        registry.next_buffer_id += 1;
        let id = BufferId::new(registry.next_buffer_id);
        let buffer = SharedBuffer::create(id, *spec, graphics)?;
        let descriptor = buffer.descriptor(Client::Producer)?;

        if let Some(name) = name {
            registry.names.insert(name.to_string(), id);
        }
        registry.nodes.insert(
            id,
            Node {
                buffer,
                name: name.map(str::to_string),
                producer: Some(peer),
                consumers: HashMap::new(),
            },
        );
        debug!(buffer_id = %id, ?name, %peer, ?spec, "buffer created");
        Ok(descriptor)
    }

    /// Allocates a consumer slot owned by `peer` until another peer claims it.
    pub fn create_consumer(&self, peer: PeerId, id: BufferId) -> Result<BufferDescriptor> {
        let mut registry = self.registry.lock();
        let node = registry.node_mut(id)?;
        if node.buffer.is_hung_up() {
            return Err(BufferHubError::BrokenPipe);
        }

        let slot = node.buffer.allocate_slot()?;
        match node.buffer.descriptor(Client::Consumer(slot)) {
            Ok(descriptor) => {
                node.consumers.insert(slot, peer);
                debug!(buffer_id = %id, %slot, %peer, "consumer created");
                Ok(descriptor)
            }
            Err(e) => {
                node.buffer.reclaim_slot(slot)?;
                Err(e)
            }
        }
    }

    /// Moves a consumer slot to the peer that imported its descriptor.
    pub fn claim_consumer(&self, peer: PeerId, id: BufferId, slot: ConsumerSlot) -> Result<()> {
        let mut registry = self.registry.lock();
        let node = registry.node_mut(id)?;
        let owner = node
            .consumers
            .get_mut(&slot)
            .ok_or(BufferHubError::InvalidSlot(slot.index()))?;
        *owner = peer;
        Ok(())
    }

    pub fn post(&self, peer: PeerId, id: BufferId, fence: Fence, metadata: &[u8]) -> Result<()> {
        let mut registry = self.registry.lock();
        registry.producer_node(peer, id)?.buffer.post(fence, metadata)
    }

    pub fn gain(&self, peer: PeerId, id: BufferId) -> Result<Fence> {
        let mut registry = self.registry.lock();
        registry.producer_node(peer, id)?.buffer.gain()
    }

    pub fn acquire(
        &self,
        peer: PeerId,
        id: BufferId,
        slot: ConsumerSlot,
        metadata_len: usize,
    ) -> Result<(Fence, Vec<u8>)> {
        let mut registry = self.registry.lock();
        let node = registry.consumer_node(peer, id, slot)?;

        let capacity = node.buffer.spec().metadata_size;
        if metadata_len > capacity {
            return Err(BufferHubError::MetadataSize {
                requested: metadata_len,
                capacity,
            });
        }
        let mut metadata = vec![0u8; metadata_len];
        let fence = node.buffer.acquire(slot, &mut metadata)?;
        Ok((fence, metadata))
    }

    pub fn release(
        &self,
        peer: PeerId,
        id: BufferId,
        slot: ConsumerSlot,
        fence: Fence,
    ) -> Result<()> {
        let mut registry = self.registry.lock();
        registry
            .consumer_node(peer, id, slot)?
            .buffer
            .release(slot, fence)
    }

    /// The buffer will be destroyed once its last handle goes away.
    pub fn remove_persistence(&self, peer: PeerId, id: BufferId) -> Result<()> {
        let mut registry = self.registry.lock();
        let name = registry.producer_node(peer, id)?.name.take();
        if let Some(name) = name {
            registry.names.remove(&name);
            debug!(buffer_id = %id, %name, "persistence removed");
        }
        Ok(())
    }

    pub fn detach_producer(&self, peer: PeerId, id: BufferId) -> Result<()> {
        let mut registry = self.registry.lock();
        registry.producer_node(peer, id)?.detach_producer()?;
        debug!(buffer_id = %id, %peer, "producer detached");
        registry.reap(id);
        Ok(())
    }

    pub fn detach_consumer(&self, peer: PeerId, id: BufferId, slot: ConsumerSlot) -> Result<()> {
        let mut registry = self.registry.lock();
        let node = registry.node_mut(id)?;
        if node.consumers.get(&slot) != Some(&peer) {
            return Err(BufferHubError::InvalidSlot(slot.index()));
        }

        node.consumers.remove(&slot);
        node.buffer.reclaim_slot(slot)?;
        debug!(buffer_id = %id, %slot, %peer, "consumer detached");
        registry.reap(id);
        Ok(())
    }

    pub fn buffer_count(&self) -> usize {
        self.registry.lock().nodes.len()
    }

    pub fn consumer_count(&self, id: BufferId) -> Option<usize> {
        let registry = self.registry.lock();
        registry.nodes.get(&id).map(|node| node.consumers.len())
    }

    pub fn buffer_state(&self, id: BufferId) -> Option<BufferState> {
        let registry = self.registry.lock();
        registry.nodes.get(&id).map(|node| node.buffer.state())
    }
}

impl Liveness for BufferHub {
    fn peer_disconnected(&self, peer: PeerId) {
        let mut registry = self.registry.lock();
        let mut touched = Vec::new();

        for (id, node) in registry.nodes.iter_mut() {
            let orphaned: Vec<ConsumerSlot> = node
                .consumers
                .iter()
                .filter(|(_, owner)| **owner == peer)
                .map(|(slot, _)| *slot)
                .collect();

            for slot in orphaned {
                node.consumers.remove(&slot);
                warn!(buffer_id = %id, %slot, %peer, "reclaiming orphaned consumer slot");
                if let Err(e) = node.buffer.reclaim_slot(slot) {
                    warn!(buffer_id = %id, %slot, error = ?e, "failed to wake producer");
                }
                touched.push(*id);
            }

            if node.producer == Some(peer) {
                debug!(buffer_id = %id, %peer, "producer peer disconnected");
                if let Err(e) = node.detach_producer() {
                    warn!(buffer_id = %id, error = ?e, "failed to hang up consumers");
                }
                touched.push(*id);
            }
        }

        for id in touched {
            registry.reap(id);
        }
    }
}
