//! # bufferhub - Shared Graphics Buffer Ownership
//!
//! Passes ownership of one graphics buffer between a producer and up to 63
//! consumers living in different processes. Ownership is tracked in a 64-bit
//! state word in shared memory: bit 0 belongs to the producer, bits 1..=63
//! are handed to consumers. Completion fences travel with every transition
//! and each handle exposes an fd for edge-triggered readiness.
//!
//! Uses `memfd` and `mmap` for the shared header, compare-and-swap loops for
//! every transition, eventfds for notification and shared epoll sets to
//! relay fences.
//!
//! ## The cycle
//!
//! ```rust
//! use bufferhub::{BufferHub, BufferSpec, ConsumerBuffer, Fence, MemfdAllocator, ProducerBuffer};
//! use std::sync::Arc;
//!
//! let hub = Arc::new(BufferHub::new(MemfdAllocator::default()));
//! let broker = hub.connect();
//!
//! let spec = BufferSpec::new(640, 480, 1, 0).with_metadata_size(8);
//! let mut producer = ProducerBuffer::create(broker.clone(), &spec)?;
//! let mut consumer = ConsumerBuffer::import(broker, producer.create_consumer()?)?;
//!
//! producer.post(Fence::invalid(), &42u64.to_le_bytes())?;
//!
//! let mut metadata = [0u8; 8];
//! let fence = consumer.acquire(&mut metadata)?;
//! fence.wait(None)?;
//! assert_eq!(u64::from_le_bytes(metadata), 42);
//!
//! consumer.release(Fence::invalid())?;
//! producer.gain()?;
//! # Ok::<(), bufferhub::BufferHubError>(())
//! ```
//!
//! ## Two call styles
//!
//! `post`, `gain`, `acquire` and `release` go through the [`Broker`] the
//! handle was created with. The `_async` variants touch the shared state
//! word directly with no round trip. Both enforce the same rules:
//!
//! - `post` needs the producer to hold the buffer, else [`BufferHubError::Busy`].
//! - `gain` needs every signalled consumer to have released, else `Busy`.
//!   Gaining twice is [`BufferHubError::AlreadyDone`].
//! - `acquire` needs a post this consumer has not acquired yet.
//! - `release` needs a prior `acquire`.
//!
//! A failed transition never changes the state word.
//!
//! ## Waiting
//!
//! ```rust
//! # use bufferhub::{BufferHub, BufferSpec, ConsumerBuffer, Fence, MemfdAllocator, ProducerBuffer};
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # let hub = Arc::new(BufferHub::new(MemfdAllocator::default()));
//! # let broker = hub.connect();
//! # let spec = BufferSpec::new(64, 64, 1, 0);
//! # let mut producer = ProducerBuffer::create(broker.clone(), &spec)?;
//! # let consumer = ConsumerBuffer::import(broker, producer.create_consumer()?)?;
//! assert_eq!(consumer.poll(Some(Duration::ZERO))?, 0);
//! producer.post_async(Fence::invalid(), &[])?;
//! assert_eq!(consumer.poll(Some(Duration::from_secs(1)))?, 1);
//! # Ok::<(), bufferhub::BufferHubError>(())
//! ```
//!
//! ## Persistence
//!
//! [`ProducerBuffer::create_persistent`] names a buffer. It survives its
//! producer and a later call with the same name and parameters re-attaches
//! to the same [`BufferId`]. Anonymous buffers, and named ones after
//! [`ProducerBuffer::remove_persistence`], hang up their consumers when the
//! producer goes away: synchronous consumer calls then fail with
//! [`BufferHubError::BrokenPipe`].
//!
//! ## Orphans
//!
//! A consumer that disappears without releasing keeps blocking `gain` until
//! its slot is reclaimed. [`LocalBroker`] reclaims on drop; a socket broker
//! reclaims when it sees the peer hang up, reported through [`Liveness`].

pub use allocator::{GraphicsAllocator, MemfdAllocator};
pub use broker::{Broker, Liveness, LocalBroker};
pub use common::MAX_METADATA_SIZE;
pub use consumer::ConsumerBuffer;
pub use descriptor::{BufferDescriptor, BufferId, BufferSpec, BUFFER_FD_COUNT};
pub use error::{BufferHubError, Result};
pub use eventfd::{event_mask, BufferEvents, EventSource, Notification};
pub use fence::{Fence, FenceKind, FenceSignal, RelayWait};
pub use hub::{BufferHub, PeerId};
pub use producer::ProducerBuffer;
pub use slot::{Client, ConsumerSlot, MAX_CONSUMERS};
pub use state::BufferState;

pub mod allocator;
pub mod broker;
pub(crate) mod buffer;
pub(crate) mod common;
pub mod consumer;
pub mod descriptor;
pub mod error;
pub mod eventfd;
pub mod fence;
pub mod hub;
#[cfg(all(test, feature = "loom"))]
pub(crate) mod loom;
pub(crate) mod memory;
pub mod producer;
pub mod slot;
pub mod state;
pub(crate) mod sync;
mod trace_macro;
