//! Consumer slot bookkeeping.
//!
//! Bit 0 of the state word belongs to the producer for the whole lifetime of
//! the buffer. Bits 1..=63 form the consumer pool; the set of allocated bits
//! lives in the shared `active_slots` word so every process sees the same pool.

use std::fmt;

use crate::error::{BufferHubError, Result};
use crate::hub_trace;
use crate::sync::{AtomicU64, Ordering};

/// Number of consumers a single buffer can have at once.
pub const MAX_CONSUMERS: usize = 63;

pub const PRODUCER_STATE_BIT: u64 = 1;
pub const CONSUMER_STATE_MASK: u64 = !PRODUCER_STATE_BIT;

/// A consumer's bit in the state word, always in `1..=63`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerSlot(u8);

impl ConsumerSlot {
    pub fn from_index(index: u8) -> Option<Self> {
        if (1..=MAX_CONSUMERS as u8).contains(&index) {
            Some(ConsumerSlot(index))
        } else {
            None
        }
    }

    pub fn index(self) -> u8 {
        self.0
    }

    pub fn mask(self) -> u64 {
        1 << self.0
    }
}

impl fmt::Display for ConsumerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the buffer a handle or descriptor speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Client {
    Producer,
    Consumer(ConsumerSlot),
}

impl Client {
    pub fn bit_index(self) -> u8 {
        match self {
            Client::Producer => 0,
            Client::Consumer(slot) => slot.index(),
        }
    }

    pub fn mask(self) -> u64 {
        1 << self.bit_index()
    }

    pub fn from_bit_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Client::Producer),
            _ => ConsumerSlot::from_index(index).map(Client::Consumer),
        }
    }
}

/// Bitset free-list over the shared `active_slots` word.
pub(crate) struct SlotPool<'a> {
    allocated: &'a AtomicU64,
}

impl<'a> SlotPool<'a> {
    pub(crate) fn new(allocated: &'a AtomicU64) -> Self {
        SlotPool { allocated }
    }

    /// Claims the lowest free consumer bit.
    pub(crate) fn allocate(&self) -> Result<ConsumerSlot> {
        let mut current = self.allocated.load(Ordering::Acquire);
        loop {
            let free = !current & CONSUMER_STATE_MASK;
            if free == 0 {
                return Err(BufferHubError::NoFreeSlots(MAX_CONSUMERS));
            }

            let index = free.trailing_zeros() as u8;
            match self.allocated.compare_exchange_weak(
                current,
                current | (1 << index),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    hub_trace!(slot = index, "consumer slot allocated");
                    return Ok(ConsumerSlot(index));
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns the slot to the pool. Returns false if it was not allocated.
    pub(crate) fn free(&self, slot: ConsumerSlot) -> bool {
        let previous = self.allocated.fetch_and(!slot.mask(), Ordering::AcqRel);
        hub_trace!(slot = slot.index(), "consumer slot freed");
        previous & slot.mask() != 0
    }

    pub(crate) fn is_allocated(&self, slot: ConsumerSlot) -> bool {
        self.allocated() & slot.mask() != 0
    }

    pub(crate) fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Acquire) & CONSUMER_STATE_MASK
    }
}
