use crate::broker::Broker;
use crate::buffer::SharedBuffer;
use crate::common::unlikely;
use crate::descriptor::{BufferDescriptor, BufferId, BufferSpec};
use crate::error::{BufferHubError, Result};
use crate::eventfd::{event_mask, BufferEvents, EventSource, Waiter};
use crate::fence::Fence;
use crate::slot::{Client, ConsumerSlot};
use nix::sys::epoll::EpollFlags;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One consumer of a buffer. Reads the pixels while acquired.
pub struct ConsumerBuffer {
    broker: Arc<dyn Broker>,
    buffer: SharedBuffer,
    slot: ConsumerSlot,
    waiter: Waiter,
    acquired: bool,
}

impl ConsumerBuffer {
    /// Maps a consumer descriptor and takes ownership of its slot. The
    /// consumer waits for the next post; earlier posts are never replayed.
    pub fn import(broker: Arc<dyn Broker>, descriptor: BufferDescriptor) -> Result<Self> {
        let id = descriptor.id();
        let slot = match descriptor.client() {
            Client::Consumer(slot) => slot,
            Client::Producer => {
                return Err(BufferHubError::InvalidDescriptor(format!(
                    "expected a consumer descriptor for buffer {id}"
                )))
            }
        };
        broker.claim_consumer(id, slot)?;

        let mapped = SharedBuffer::from_descriptor(descriptor).and_then(|(buffer, _)| {
            let waiter = Waiter::new(buffer.consumer_event())?;
            Ok((buffer, waiter))
        });

        match mapped {
            Ok((buffer, waiter)) => {
                debug!(buffer_id = %id, %slot, "consumer imported");
                Ok(ConsumerBuffer {
                    broker,
                    buffer,
                    slot,
                    waiter,
                    acquired: false,
                })
            }
            Err(e) => {
                let _ = broker.detach_consumer(id, slot);
                Err(e)
            }
        }
    }

    /// Acquires through the broker. Fills `metadata` with the posted prefix;
    /// asking for more than the metadata capacity is an error.
    pub fn acquire(&mut self, metadata: &mut [u8]) -> Result<Fence> {
        self.check_not_acquired()?;
        let (fence, posted) = self.broker.acquire(self.id(), self.slot, metadata.len())?;
        if posted.len() != metadata.len() {
            return Err(BufferHubError::Broker(format!(
                "acquire returned {} metadata bytes, asked for {}",
                posted.len(),
                metadata.len()
            )));
        }
        metadata.copy_from_slice(&posted);
        self.acquired = true;
        Ok(fence)
    }

    /// Acquires directly on the shared state word. Keeps working after the
    /// producer side is gone.
    pub fn acquire_async(&mut self, metadata: &mut [u8]) -> Result<Fence> {
        self.check_not_acquired()?;
        let fence = self.buffer.acquire(self.slot, metadata)?;
        self.acquired = true;
        Ok(fence)
    }

    /// Hands the buffer back with `fence` covering any outstanding reads.
    pub fn release(&mut self, fence: Fence) -> Result<()> {
        self.check_acquired()?;
        self.broker.release(self.id(), self.slot, fence)?;
        self.acquired = false;
        Ok(())
    }

    pub fn release_async(&mut self, fence: Fence) -> Result<()> {
        self.check_acquired()?;
        self.buffer.release(self.slot, fence)?;
        self.acquired = false;
        Ok(())
    }

    fn check_not_acquired(&self) -> Result<()> {
        if unlikely(self.acquired) {
            return Err(BufferHubError::Busy("acquire"));
        }
        Ok(())
    }

    fn check_acquired(&self) -> Result<()> {
        if unlikely(!self.acquired) {
            return Err(BufferHubError::Busy("release"));
        }
        Ok(())
    }

    /// A descriptor for a sibling consumer of the same buffer.
    pub fn create_consumer(&self) -> Result<BufferDescriptor> {
        self.broker.create_consumer(self.id())
    }

    fn is_acquirable(&self) -> bool {
        !self.acquired && self.buffer.state().is_pending(self.slot)
    }

    fn is_available(&self) -> bool {
        self.is_acquirable() || self.buffer.is_hung_up()
    }

    /// Waits until there is a post to acquire, or the producer side hung up.
    /// Returns 1 when ready, 0 on timeout.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<usize> {
        self.waiter.poll(timeout, || self.is_available())
    }

    pub fn event_sources(&self) -> Vec<EventSource<'_>> {
        vec![EventSource {
            fd: self.buffer.consumer_event().fd(),
            events: EpollFlags::EPOLLIN,
        }]
    }

    /// Translates epoll readiness on an event source. `AVAILABLE` is only
    /// reported while there is a post this consumer can acquire.
    pub fn event_mask(&self, raw: EpollFlags) -> BufferEvents {
        let mut events = event_mask(raw);
        if !self.is_acquirable() {
            events.remove(BufferEvents::AVAILABLE);
        }
        if self.buffer.is_hung_up() {
            events |= BufferEvents::HANGUP;
        }
        events
    }

    pub fn id(&self) -> BufferId {
        self.buffer.id()
    }

    pub fn slot(&self) -> ConsumerSlot {
        self.slot
    }

    pub fn state_bit(&self) -> u64 {
        self.slot.mask()
    }

    pub fn spec(&self) -> &BufferSpec {
        self.buffer.spec()
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    pub fn is_hung_up(&self) -> bool {
        self.buffer.is_hung_up()
    }
}

impl Drop for ConsumerBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.broker.detach_consumer(self.id(), self.slot) {
            warn!(buffer_id = %self.id(), slot = %self.slot, error = ?e, "failed to detach consumer");
        }
    }
}
