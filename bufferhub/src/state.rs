//! Transitions on the shared state word.
//!
//! Bit 0 is set while the producer has posted and not yet gained. A consumer
//! bit is set from the post that signalled it until that consumer releases,
//! so it covers both `PendingAcquire` and `Acquired`; the consumer handle
//! tells the two apart locally. Every transition is a compare-and-swap loop
//! and a failed transition never writes the word.

use std::fmt;

use crate::common::unlikely;
use crate::error::{BufferHubError, Result};
use crate::hub_trace;
use crate::slot::{ConsumerSlot, CONSUMER_STATE_MASK, PRODUCER_STATE_BIT};
use crate::sync::{AtomicU64, Ordering};

/// A snapshot of the state word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BufferState(u64);

impl BufferState {
    pub fn from_bits(bits: u64) -> Self {
        BufferState(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn is_gained(self) -> bool {
        self.0 & PRODUCER_STATE_BIT == 0
    }

    pub fn is_posted(self) -> bool {
        !self.is_gained()
    }

    /// The consumer was signalled by the current post and has not released.
    pub fn is_pending(self, slot: ConsumerSlot) -> bool {
        self.0 & slot.mask() != 0
    }

    pub fn pending_consumers(self) -> u64 {
        self.0 & CONSUMER_STATE_MASK
    }

    /// Posted, and every signalled consumer has released.
    pub fn is_gainable(self) -> bool {
        self.is_posted() && self.pending_consumers() == 0
    }
}

impl fmt::Debug for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferState({:#018x})", self.0)
    }
}

pub(crate) fn load(word: &AtomicU64) -> BufferState {
    BufferState(word.load(Ordering::Acquire))
}

pub(crate) fn check_post(word: &AtomicU64) -> Result<()> {
    if unlikely(load(word).is_posted()) {
        return Err(BufferHubError::Busy("post"));
    }
    Ok(())
}

/// Gained -> Posted. Signals every consumer allocated in `active_slots` and
/// returns the signalled mask.
pub(crate) fn post(word: &AtomicU64, active_slots: &AtomicU64) -> Result<u64> {
    let mut current = word.load(Ordering::Acquire);
    let posted = loop {
        if unlikely(current & PRODUCER_STATE_BIT != 0) {
            return Err(BufferHubError::Busy("post"));
        }

        let signalled = active_slots.load(Ordering::Acquire) & CONSUMER_STATE_MASK;
        let next = PRODUCER_STATE_BIT | signalled;
        match word.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break next,
            Err(actual) => current = actual,
        }
    };

    // A slot freed between reading `active_slots` and the swap must not stay
    // pending, or it would block gain and leak into the next owner of the bit.
    let stale = posted & CONSUMER_STATE_MASK & !active_slots.load(Ordering::Acquire);
    if stale != 0 {
        word.fetch_and(!stale, Ordering::AcqRel);
    }

    hub_trace!(state = posted & !stale, "buffer posted");
    Ok(posted & !stale)
}

/// Posted (with no pending consumers) -> Gained.
pub(crate) fn gain(word: &AtomicU64) -> Result<()> {
    let mut current = word.load(Ordering::Acquire);
    loop {
        if current & PRODUCER_STATE_BIT == 0 {
            return Err(BufferHubError::AlreadyDone);
        }
        if unlikely(current & CONSUMER_STATE_MASK != 0) {
            return Err(BufferHubError::Busy("gain"));
        }

        match word.compare_exchange_weak(current, 0, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                hub_trace!("buffer gained");
                return Ok(());
            }
            Err(actual) => current = actual,
        }
    }
}

pub(crate) fn check_acquire(word: &AtomicU64, slot: ConsumerSlot) -> Result<()> {
    if unlikely(!load(word).is_pending(slot)) {
        return Err(BufferHubError::Busy("acquire"));
    }
    Ok(())
}

/// Clears the consumer's bit and returns the word it left behind. Fails with
/// `Busy` if the bit is not set.
pub(crate) fn release(word: &AtomicU64, slot: ConsumerSlot) -> Result<BufferState> {
    let mask = slot.mask();
    let mut current = word.load(Ordering::Acquire);
    loop {
        if unlikely(current & mask == 0) {
            return Err(BufferHubError::Busy("release"));
        }

        let next = current & !mask;
        match word.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                hub_trace!(slot = slot.index(), state = next, "buffer released");
                return Ok(BufferState(next));
            }
            Err(actual) => current = actual,
        }
    }
}

/// Drops whatever the slot held. Used for fresh slots and orphan reclamation.
pub(crate) fn clear_slot(word: &AtomicU64, slot: ConsumerSlot) -> bool {
    let previous = word.fetch_and(!slot.mask(), Ordering::AcqRel);
    previous & slot.mask() != 0
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::slot::SlotPool;
    use rstest::*;

    struct Words {
        state: AtomicU64,
        active: AtomicU64,
    }

    #[fixture]
    fn words() -> Words {
        Words {
            state: AtomicU64::new(0),
            active: AtomicU64::new(0),
        }
    }

    fn slot(index: u8) -> ConsumerSlot {
        ConsumerSlot::from_index(index).unwrap()
    }

    #[rstest]
    fn test_full_cycle(words: Words) {
        let c1 = SlotPool::new(&words.active).allocate().unwrap();

        assert!(load(&words.state).is_gained());
        assert_eq!(post(&words.state, &words.active).unwrap(), 0b11);
        assert!(load(&words.state).is_pending(c1));

        check_acquire(&words.state, c1).unwrap();
        assert!(matches!(gain(&words.state), Err(BufferHubError::Busy(_))));

        assert!(release(&words.state, c1).unwrap().is_gainable());
        assert!(load(&words.state).is_gainable());
        gain(&words.state).unwrap();
        assert_eq!(load(&words.state).bits(), 0);
    }

    #[rstest]
    fn test_post_twice_is_busy_and_leaves_word(words: Words) {
        SlotPool::new(&words.active).allocate().unwrap();
        post(&words.state, &words.active).unwrap();
        let before = load(&words.state);

        for _ in 0..3 {
            assert!(matches!(
                post(&words.state, &words.active),
                Err(BufferHubError::Busy("post"))
            ));
            assert!(matches!(
                check_post(&words.state),
                Err(BufferHubError::Busy("post"))
            ));
            assert_eq!(load(&words.state), before);
        }
    }

    #[rstest]
    fn test_gain_when_gained_is_already_done(words: Words) {
        for _ in 0..3 {
            assert!(matches!(
                gain(&words.state),
                Err(BufferHubError::AlreadyDone)
            ));
            assert_eq!(load(&words.state).bits(), 0);
        }
    }

    #[rstest]
    fn test_release_without_post_is_busy(words: Words) {
        let c1 = SlotPool::new(&words.active).allocate().unwrap();
        assert!(matches!(
            release(&words.state, c1),
            Err(BufferHubError::Busy("release"))
        ));
        assert!(matches!(
            check_acquire(&words.state, c1),
            Err(BufferHubError::Busy("acquire"))
        ));
    }

    #[rstest]
    fn test_post_without_consumers_is_immediately_gainable(words: Words) {
        assert_eq!(post(&words.state, &words.active).unwrap(), PRODUCER_STATE_BIT);
        assert!(load(&words.state).is_gainable());
        gain(&words.state).unwrap();
    }

    #[rstest]
    fn test_late_consumer_is_not_signalled(words: Words) {
        let pool = SlotPool::new(&words.active);
        let early = pool.allocate().unwrap();
        post(&words.state, &words.active).unwrap();

        let late = pool.allocate().unwrap();
        clear_slot(&words.state, late);

        let state = load(&words.state);
        assert!(state.is_pending(early));
        assert!(!state.is_pending(late));

        release(&words.state, early).unwrap();
        gain(&words.state).unwrap();
    }

    #[rstest]
    fn test_clear_slot_unblocks_gain(words: Words) {
        let pool = SlotPool::new(&words.active);
        let c1 = pool.allocate().unwrap();
        let c2 = pool.allocate().unwrap();
        post(&words.state, &words.active).unwrap();
        let left = release(&words.state, c1).unwrap();
        assert!(!left.is_gainable());
        assert!(left.is_pending(c2));

        assert!(matches!(gain(&words.state), Err(BufferHubError::Busy(_))));
        pool.free(c2);
        assert!(clear_slot(&words.state, c2));
        gain(&words.state).unwrap();
    }

    #[rstest]
    #[case(&[1])]
    #[case(&[1, 2, 3])]
    #[case(&[7, 31, 63])]
    fn test_post_signals_exactly_allocated(words: Words, #[case] indices: &[u8]) {
        let mut expected = PRODUCER_STATE_BIT;
        for &index in indices {
            words.active.fetch_or(slot(index).mask(), Ordering::Relaxed);
            expected |= slot(index).mask();
        }

        assert_eq!(post(&words.state, &words.active).unwrap(), expected);
        for &index in indices {
            assert!(load(&words.state).is_pending(slot(index)));
        }
    }
}
