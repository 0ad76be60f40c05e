//! One process's mapping of a buffer.
//!
//! Every transition lives here so the broker and the handles' direct path
//! apply the same rules to the same shared words.

use crate::common::{
    region_size, unlikely, SharedHeader, HANGUP_FLAG, HEADER_MAGIC, METADATA_OFFSET,
};
use crate::descriptor::{BufferDescriptor, BufferId, BufferSpec, DescriptorFds};
use crate::error::{BufferHubError, Result};
use crate::eventfd::Notification;
use crate::fence::{Fence, FenceRelay};
use crate::hub_trace;
use crate::memory::{page_size, Memory};
use crate::slot::{Client, ConsumerSlot, SlotPool, CONSUMER_STATE_MASK, PRODUCER_STATE_BIT};
use crate::state::{self, BufferState};
use crate::sync::Ordering;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::ptr::{self, addr_of_mut};

pub(crate) struct SharedBuffer {
    id: BufferId,
    spec: BufferSpec,
    header: Memory,
    graphics: OwnedFd,
    producer_event: Notification,
    consumer_event: Notification,
    post_fences: FenceRelay,
    release_fences: FenceRelay,
}

impl SharedBuffer {
    /// Lays out a fresh header region around already allocated graphics
    /// memory. The buffer starts gained with no consumers.
    pub(crate) fn create(id: BufferId, spec: BufferSpec, graphics: OwnedFd) -> Result<Self> {
        spec.validate()?;

        let size = region_size(spec.metadata_size, page_size());
        let header = Memory::new(size).map_err(BufferHubError::memory)?;

        // The memfd is zero-filled, so every atomic already reads 0.
        let raw = header.as_ptr().cast::<SharedHeader>().as_ptr();
        unsafe {
            addr_of_mut!((*raw).magic).write(HEADER_MAGIC);
            addr_of_mut!((*raw).buffer_id).write(id.get());
            addr_of_mut!((*raw).width).write(spec.width);
            addr_of_mut!((*raw).height).write(spec.height);
            addr_of_mut!((*raw).format).write(spec.format);
            addr_of_mut!((*raw).usage).write(spec.usage);
            addr_of_mut!((*raw).metadata_size).write(spec.metadata_size as u64);
        }

        Ok(SharedBuffer {
            id,
            spec,
            header,
            graphics,
            producer_event: Notification::new()?,
            consumer_event: Notification::new()?,
            post_fences: FenceRelay::new()?,
            release_fences: FenceRelay::new()?,
        })
    }

    /// Maps a buffer from a descriptor. Returns the client the descriptor
    /// speaks for.
    pub(crate) fn from_descriptor(descriptor: BufferDescriptor) -> Result<(Self, Client)> {
        let BufferDescriptor {
            id,
            client,
            spec,
            fds,
        } = descriptor;
        spec.validate()?;

        let size = region_size(spec.metadata_size, page_size());
        let header = Memory::from_fd(fds.header, size).map_err(BufferHubError::memory)?;

        // SAFETY: descriptor eventfds are created by `SharedBuffer::create`.
        let producer_event = unsafe { Notification::from_owned_fd(fds.producer_event) };
        let consumer_event = unsafe { Notification::from_owned_fd(fds.consumer_event) };

        let buffer = SharedBuffer {
            id,
            spec,
            header,
            graphics: fds.graphics,
            producer_event,
            consumer_event,
            post_fences: FenceRelay::from_owned_fd(fds.post_fences),
            release_fences: FenceRelay::from_owned_fd(fds.release_fences),
        };
        buffer.check_header()?;
        Ok((buffer, client))
    }

    fn check_header(&self) -> Result<()> {
        let header = self.header();
        let matches = header.magic == HEADER_MAGIC
            && header.buffer_id == self.id.get()
            && header.width == self.spec.width
            && header.height == self.spec.height
            && header.format == self.spec.format
            && header.usage == self.spec.usage
            && header.metadata_size == self.spec.metadata_size as u64;
        if !matches {
            return Err(BufferHubError::InvalidDescriptor(format!(
                "shared header does not describe buffer {}",
                self.id
            )));
        }
        Ok(())
    }

    /// Duplicates every fd into a descriptor for `client`.
    pub(crate) fn descriptor(&self, client: Client) -> Result<BufferDescriptor> {
        Ok(BufferDescriptor {
            id: self.id,
            client,
            spec: self.spec,
            fds: DescriptorFds {
                header: self.header.clone_fd()?,
                graphics: self.graphics.try_clone()?,
                producer_event: self.producer_event.clone_fd()?,
                consumer_event: self.consumer_event.clone_fd()?,
                post_fences: self.post_fences.clone_fd()?,
                release_fences: self.release_fences.clone_fd()?,
            },
        })
    }

    fn header(&self) -> &SharedHeader {
        unsafe { self.header.as_ptr().cast::<SharedHeader>().as_ref() }
    }

    fn metadata_ptr(&self) -> *mut u8 {
        unsafe { self.header.as_ptr().as_ptr().add(METADATA_OFFSET) }
    }

    fn check_metadata(&self, len: usize) -> Result<()> {
        if unlikely(len > self.spec.metadata_size) {
            return Err(BufferHubError::MetadataSize {
                requested: len,
                capacity: self.spec.metadata_size,
            });
        }
        Ok(())
    }

    pub(crate) fn id(&self) -> BufferId {
        self.id
    }

    pub(crate) fn spec(&self) -> &BufferSpec {
        &self.spec
    }

    pub(crate) fn graphics_fd(&self) -> BorrowedFd<'_> {
        self.graphics.as_fd()
    }

    pub(crate) fn producer_event(&self) -> &Notification {
        &self.producer_event
    }

    pub(crate) fn consumer_event(&self) -> &Notification {
        &self.consumer_event
    }

    pub(crate) fn state(&self) -> BufferState {
        state::load(&self.header().buffer_state)
    }

    pub(crate) fn active_slots(&self) -> u64 {
        SlotPool::new(&self.header().active_slots).allocated()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.header().generation.load(Ordering::Acquire)
    }

    /// Gained -> Posted. Copies `metadata` into the shared record, publishes
    /// `fence` and signals every allocated consumer. A failed post leaves the
    /// generation, the fence state and the registered fences as they were.
    pub(crate) fn post(&self, fence: Fence, metadata: &[u8]) -> Result<()> {
        self.check_metadata(metadata.len())?;
        let header = self.header();
        state::check_post(&header.buffer_state)?;

        let previous = header.generation.load(Ordering::Acquire);
        let generation = previous + 1;
        let published = self
            .post_fences
            .publish(fence, generation, Client::Producer)?;

        // Gained: nobody else reads the record, the generation or the fence
        // state until the state word flips.
        unsafe {
            ptr::copy_nonoverlapping(metadata.as_ptr(), self.metadata_ptr(), metadata.len());
        }
        let fence_state = if published { PRODUCER_STATE_BIT } else { 0 };
        let previous_fences = header.fence_state.swap(fence_state, Ordering::AcqRel);
        header.generation.store(generation, Ordering::Release);

        if let Err(e) = state::post(&header.buffer_state, &header.active_slots) {
            header.generation.store(previous, Ordering::Release);
            header.fence_state.store(previous_fences, Ordering::Release);
            self.post_fences.withdraw(generation, Client::Producer);
            return Err(e);
        }
        hub_trace!(buffer_id = self.id.get(), generation, "post");
        self.consumer_event.notify()
    }

    /// Posted with every signalled consumer released -> Gained. Returns a
    /// fence covering the released consumers' fences.
    pub(crate) fn gain(&self) -> Result<Fence> {
        let header = self.header();
        state::gain(&header.buffer_state)?;

        // Fences from slots reclaimed since release are no longer waited on.
        let wanted = header.fence_state.load(Ordering::Acquire)
            & header.active_slots.load(Ordering::Acquire)
            & CONSUMER_STATE_MASK;
        hub_trace!(buffer_id = self.id.get(), wanted, "gain");
        self.release_fences.collect(wanted, self.generation())
    }

    /// Reads the posted metadata prefix into `metadata` and returns the post
    /// fence. The consumer's bit stays set until release.
    pub(crate) fn acquire(&self, slot: ConsumerSlot, metadata: &mut [u8]) -> Result<Fence> {
        self.check_metadata(metadata.len())?;
        let header = self.header();
        state::check_acquire(&header.buffer_state, slot)?;

        unsafe {
            ptr::copy_nonoverlapping(self.metadata_ptr(), metadata.as_mut_ptr(), metadata.len());
        }

        let wanted = header.fence_state.load(Ordering::Acquire) & PRODUCER_STATE_BIT;
        hub_trace!(buffer_id = self.id.get(), slot = slot.index(), "acquire");
        self.post_fences.collect(wanted, self.generation())
    }

    /// Publishes the consumer's fence and clears its bit.
    pub(crate) fn release(&self, slot: ConsumerSlot, fence: Fence) -> Result<()> {
        let header = self.header();
        if unlikely(!self.state().is_pending(slot)) {
            return Err(BufferHubError::Busy("release"));
        }

        let client = Client::Consumer(slot);
        let generation = self.generation();
        let published = self.release_fences.publish(fence, generation, client)?;
        if published {
            header.fence_state.fetch_or(slot.mask(), Ordering::AcqRel);
        }

        let left = match state::release(&header.buffer_state, slot) {
            Ok(left) => left,
            Err(e) => {
                if published {
                    header.fence_state.fetch_and(!slot.mask(), Ordering::AcqRel);
                    self.release_fences.withdraw(generation, client);
                }
                return Err(e);
            }
        };
        // Only the release that empties the word wakes the producer.
        if left.is_gainable() {
            self.producer_event.notify()?;
        }
        Ok(())
    }

    /// Takes a consumer bit from the pool. The fresh slot is never pending,
    /// so it waits for the next post.
    pub(crate) fn allocate_slot(&self) -> Result<ConsumerSlot> {
        let header = self.header();
        let slot = SlotPool::new(&header.active_slots).allocate()?;
        state::clear_slot(&header.buffer_state, slot);
        header.fence_state.fetch_and(!slot.mask(), Ordering::AcqRel);
        Ok(slot)
    }

    /// Returns a consumer bit to the pool whatever state it was in, and wakes
    /// the producer if that unblocked it. Returns false if the slot was free.
    /// Fences the slot already released stay registered until they complete.
    pub(crate) fn reclaim_slot(&self, slot: ConsumerSlot) -> Result<bool> {
        let header = self.header();
        let was_allocated = SlotPool::new(&header.active_slots).free(slot);
        let was_pending = state::clear_slot(&header.buffer_state, slot);
        header.fence_state.fetch_and(!slot.mask(), Ordering::AcqRel);

        if was_pending && self.state().is_gainable() {
            self.producer_event.notify()?;
        }
        Ok(was_allocated)
    }

    /// Marks the producer side as permanently gone and wakes consumers.
    pub(crate) fn hang_up(&self) -> Result<()> {
        self.header().flags.fetch_or(HANGUP_FLAG, Ordering::AcqRel);
        self.consumer_event.notify()
    }

    pub(crate) fn is_hung_up(&self) -> bool {
        self.header().flags.load(Ordering::Acquire) & HANGUP_FLAG != 0
    }
}
