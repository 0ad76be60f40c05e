#[cfg(all(test, feature = "loom"))]
mod tests {
    use crate::error::BufferHubError;
    use crate::slot::{SlotPool, PRODUCER_STATE_BIT};
    use crate::state;
    use crate::sync::{AtomicU64, Ordering};
    use loom::{model::Builder, sync::Arc, thread};

    fn builder() -> Builder {
        let mut builder = Builder::new();
        if builder.preemption_bound.is_none() {
            builder.preemption_bound = Some(3);
        }
        builder
    }

    #[test]
    fn test_concurrent_allocations_are_distinct() {
        builder().check(|| {
            let active = Arc::new(AtomicU64::new(0));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let active = Arc::clone(&active);
                    thread::spawn(move || SlotPool::new(&active).allocate().unwrap())
                })
                .collect();
            let slots: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            assert_ne!(slots[0], slots[1]);
            assert_eq!(
                active.load(Ordering::Acquire),
                slots[0].mask() | slots[1].mask()
            );
        });
    }

    #[test]
    fn test_gain_never_overlaps_pending_consumers() {
        builder().check(|| {
            let word = Arc::new(AtomicU64::new(0));
            let active = Arc::new(AtomicU64::new(0));
            let pool = SlotPool::new(&active);
            let first = pool.allocate().unwrap();
            let second = pool.allocate().unwrap();
            state::post(&word, &active).unwrap();

            let handles: Vec<_> = [first, second]
                .into_iter()
                .map(|slot| {
                    let word = Arc::clone(&word);
                    thread::spawn(move || state::release(&word, slot).unwrap())
                })
                .collect();

            match state::gain(&word) {
                Ok(()) => assert_eq!(word.load(Ordering::Acquire), 0),
                Err(BufferHubError::Busy(_)) => {}
                Err(e) => panic!("unexpected gain error: {e}"),
            }

            let mut gainable = false;
            for handle in handles {
                gainable |= handle.join().unwrap().is_gainable();
            }
            assert!(gainable, "the last release must see the word gainable");
            match state::gain(&word) {
                Ok(()) | Err(BufferHubError::AlreadyDone) => {}
                Err(e) => panic!("unexpected gain error: {e}"),
            }
            assert_eq!(word.load(Ordering::Acquire), 0);
        });
    }

    #[test]
    fn test_post_racing_reclaim_leaves_no_stale_bit() {
        builder().check(|| {
            let word = Arc::new(AtomicU64::new(0));
            let active = Arc::new(AtomicU64::new(0));
            let pool = SlotPool::new(&active);
            let kept = pool.allocate().unwrap();
            let freed = pool.allocate().unwrap();

            let handle = {
                let word = Arc::clone(&word);
                let active = Arc::clone(&active);
                thread::spawn(move || {
                    SlotPool::new(&active).free(freed);
                    state::clear_slot(&word, freed);
                })
            };

            state::post(&word, &active).unwrap();
            handle.join().unwrap();

            let bits = word.load(Ordering::Acquire);
            assert_eq!(bits & freed.mask(), 0);
            assert_eq!(bits, PRODUCER_STATE_BIT | kept.mask());
        });
    }
}
