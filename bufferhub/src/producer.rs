use crate::broker::Broker;
use crate::buffer::SharedBuffer;
use crate::descriptor::{BufferDescriptor, BufferId, BufferSpec};
use crate::error::{BufferHubError, Result};
use crate::eventfd::{event_mask, BufferEvents, EventSource, Waiter};
use crate::fence::Fence;
use crate::slot::{Client, PRODUCER_STATE_BIT};
use crate::state::BufferState;
use nix::sys::epoll::EpollFlags;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The producer side of a buffer. Owns the pixels while gained.
pub struct ProducerBuffer {
    broker: Arc<dyn Broker>,
    buffer: SharedBuffer,
    waiter: Waiter,
    persistent: bool,
}

impl ProducerBuffer {
    /// Allocates an anonymous buffer. It is destroyed once every handle is
    /// gone, and its consumers are hung up when this handle is dropped.
    pub fn create(broker: Arc<dyn Broker>, spec: &BufferSpec) -> Result<Self> {
        let descriptor = broker.create_producer(spec, None)?;
        ProducerBuffer::attach(broker, descriptor, false)
    }

    /// Creates the buffer called `name`, or re-attaches to it. The buffer
    /// outlives this handle until [`ProducerBuffer::remove_persistence`].
    /// Re-attaching with different parameters fails with
    /// [`BufferHubError::ParameterMismatch`].
    pub fn create_persistent(
        broker: Arc<dyn Broker>,
        name: &str,
        spec: &BufferSpec,
    ) -> Result<Self> {
        let descriptor = broker.create_producer(spec, Some(name))?;
        ProducerBuffer::attach(broker, descriptor, true)
    }

    fn attach(
        broker: Arc<dyn Broker>,
        descriptor: BufferDescriptor,
        persistent: bool,
    ) -> Result<Self> {
        let id = descriptor.id();
        let mapped = SharedBuffer::from_descriptor(descriptor).and_then(|(buffer, client)| {
            if client != Client::Producer {
                return Err(BufferHubError::InvalidDescriptor(format!(
                    "expected a producer descriptor for buffer {id}"
                )));
            }
            let waiter = Waiter::new(buffer.producer_event())?;
            Ok((buffer, waiter))
        });

        match mapped {
            Ok((buffer, waiter)) => {
                debug!(buffer_id = %id, persistent, "producer attached");
                Ok(ProducerBuffer {
                    broker,
                    buffer,
                    waiter,
                    persistent,
                })
            }
            Err(e) => {
                let _ = broker.detach_producer(id);
                Err(e)
            }
        }
    }

    /// Posts through the broker. `metadata` may be shorter than the buffer's
    /// metadata capacity, never longer.
    pub fn post(&mut self, fence: Fence, metadata: &[u8]) -> Result<()> {
        self.broker.post(self.id(), fence, metadata)
    }

    /// Posts directly on the shared state word.
    pub fn post_async(&mut self, fence: Fence, metadata: &[u8]) -> Result<()> {
        self.buffer.post(fence, metadata)
    }

    /// Takes the buffer back once every signalled consumer released. The
    /// returned fence covers their release fences.
    pub fn gain(&mut self) -> Result<Fence> {
        self.broker.gain(self.id())
    }

    pub fn gain_async(&mut self) -> Result<Fence> {
        self.buffer.gain()
    }

    /// A descriptor for a new consumer, to import here or in another process.
    pub fn create_consumer(&self) -> Result<BufferDescriptor> {
        self.broker.create_consumer(self.id())
    }

    pub fn remove_persistence(&mut self) -> Result<()> {
        self.broker.remove_persistence(self.id())?;
        self.persistent = false;
        Ok(())
    }

    /// Waits until the buffer can be gained. Returns 1 when it can, 0 on
    /// timeout. [`BufferHubError::Interrupted`] should be retried.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<usize> {
        self.waiter
            .poll(timeout, || self.buffer.state().is_gainable())
    }

    pub fn event_sources(&self) -> Vec<EventSource<'_>> {
        vec![EventSource {
            fd: self.buffer.producer_event().fd(),
            events: EpollFlags::EPOLLIN,
        }]
    }

    /// Translates epoll readiness on an event source. `AVAILABLE` is only
    /// reported while the buffer can actually be gained.
    pub fn event_mask(&self, raw: EpollFlags) -> BufferEvents {
        let mut events = event_mask(raw);
        if !self.buffer.state().is_gainable() {
            events.remove(BufferEvents::AVAILABLE);
        }
        events
    }

    pub fn id(&self) -> BufferId {
        self.buffer.id()
    }

    pub fn state_bit(&self) -> u64 {
        PRODUCER_STATE_BIT
    }

    pub fn spec(&self) -> &BufferSpec {
        self.buffer.spec()
    }

    pub fn state(&self) -> BufferState {
        self.buffer.state()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// The graphics memory backing the buffer.
    pub fn memory_fd(&self) -> BorrowedFd<'_> {
        self.buffer.graphics_fd()
    }
}

impl Drop for ProducerBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.broker.detach_producer(self.id()) {
            warn!(buffer_id = %self.id(), error = ?e, "failed to detach producer");
        }
    }
}
