use crate::descriptor::{BufferDescriptor, BufferId, BufferSpec};
use crate::error::Result;
use crate::fence::Fence;
use crate::hub::{BufferHub, PeerId};
use crate::slot::ConsumerSlot;
use std::sync::Arc;

/// The synchronous call style. Every method is one round trip to whoever
/// owns the buffer registry, on behalf of the peer the broker is bound to.
pub trait Broker: Send + Sync {
    /// `name` makes the buffer persistent, or re-attaches to it.
    fn create_producer(&self, spec: &BufferSpec, name: Option<&str>) -> Result<BufferDescriptor>;

    fn create_consumer(&self, id: BufferId) -> Result<BufferDescriptor>;

    /// Takes ownership of a consumer slot created by another peer.
    fn claim_consumer(&self, id: BufferId, slot: ConsumerSlot) -> Result<()>;

    fn post(&self, id: BufferId, fence: Fence, metadata: &[u8]) -> Result<()>;

    fn gain(&self, id: BufferId) -> Result<Fence>;

    fn acquire(
        &self,
        id: BufferId,
        slot: ConsumerSlot,
        metadata_len: usize,
    ) -> Result<(Fence, Vec<u8>)>;

    fn release(&self, id: BufferId, slot: ConsumerSlot, fence: Fence) -> Result<()>;

    fn remove_persistence(&self, id: BufferId) -> Result<()>;

    fn detach_producer(&self, id: BufferId) -> Result<()>;

    fn detach_consumer(&self, id: BufferId, slot: ConsumerSlot) -> Result<()>;
}

/// Told when a peer is gone without detaching its handles.
pub trait Liveness {
    fn peer_disconnected(&self, peer: PeerId);
}

/// An in-process broker bound to one peer of a [`BufferHub`]. Dropping it
/// disconnects the peer.
pub struct LocalBroker {
    hub: Arc<BufferHub>,
    peer: PeerId,
}

impl LocalBroker {
    pub fn new(hub: Arc<BufferHub>) -> Self {
        let peer = hub.register_peer();
        LocalBroker { hub, peer }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }
}

impl Drop for LocalBroker {
    fn drop(&mut self) {
        self.hub.peer_disconnected(self.peer);
    }
}

impl BufferHub {
    /// Registers a new peer and returns a broker speaking for it.
    pub fn connect(self: &Arc<Self>) -> Arc<dyn Broker> {
        Arc::new(LocalBroker::new(Arc::clone(self)))
    }
}

impl Broker for LocalBroker {
    fn create_producer(&self, spec: &BufferSpec, name: Option<&str>) -> Result<BufferDescriptor> {
        self.hub.create_producer(self.peer, spec, name)
    }

    fn create_consumer(&self, id: BufferId) -> Result<BufferDescriptor> {
        self.hub.create_consumer(self.peer, id)
    }

    fn claim_consumer(&self, id: BufferId, slot: ConsumerSlot) -> Result<()> {
        self.hub.claim_consumer(self.peer, id, slot)
    }

    fn post(&self, id: BufferId, fence: Fence, metadata: &[u8]) -> Result<()> {
        self.hub.post(self.peer, id, fence, metadata)
    }

    fn gain(&self, id: BufferId) -> Result<Fence> {
        self.hub.gain(self.peer, id)
    }

    fn acquire(
        &self,
        id: BufferId,
        slot: ConsumerSlot,
        metadata_len: usize,
    ) -> Result<(Fence, Vec<u8>)> {
        self.hub.acquire(self.peer, id, slot, metadata_len)
    }

    fn release(&self, id: BufferId, slot: ConsumerSlot, fence: Fence) -> Result<()> {
        self.hub.release(self.peer, id, slot, fence)
    }

    fn remove_persistence(&self, id: BufferId) -> Result<()> {
        self.hub.remove_persistence(self.peer, id)
    }

    fn detach_producer(&self, id: BufferId) -> Result<()> {
        self.hub.detach_producer(self.peer, id)
    }

    fn detach_consumer(&self, id: BufferId, slot: ConsumerSlot) -> Result<()> {
        self.hub.detach_consumer(self.peer, id, slot)
    }
}
