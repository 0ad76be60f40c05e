// Copyright (C) 2025 Category Labs, Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Shared header layout and small internal helpers.

use crate::sync::AtomicU64;
use crossbeam::utils::CachePadded;
use nix::poll::PollTimeout;
use nix::sys::epoll::EpollTimeout;
use std::time::{Duration, Instant};

#[inline]
#[cold]
fn cold() {}

#[allow(unused)]
#[inline(always)]
pub(crate) fn likely(b: bool) -> bool {
    if !b {
        cold();
    }
    b
}

#[inline(always)]
pub(crate) fn unlikely(b: bool) -> bool {
    if b {
        cold();
    }
    b
}

pub(crate) const HEADER_MAGIC: u64 = u64::from_le_bytes(*b"BUFHUB01");

/// Set in `SharedHeader::flags` once the producer side is permanently gone.
pub(crate) const HANGUP_FLAG: u64 = 1;

pub const MAX_METADATA_SIZE: usize = 16 * 1024;

const METADATA_ALIGN: usize = 64;

/// Start of the metadata record inside the header region.
pub(crate) const METADATA_OFFSET: usize =
    (std::mem::size_of::<SharedHeader>() + METADATA_ALIGN - 1) & !(METADATA_ALIGN - 1);

/// Lives at offset 0 of the header region shared by every handle of a buffer.
#[repr(C)]
pub(crate) struct SharedHeader {
    pub(crate) magic: u64,
    pub(crate) buffer_id: u64,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) format: u32,
    pub(crate) reserved: u32,
    pub(crate) usage: u64,
    pub(crate) metadata_size: u64,
    pub(crate) buffer_state: CachePadded<AtomicU64>,
    pub(crate) fence_state: CachePadded<AtomicU64>,
    pub(crate) active_slots: CachePadded<AtomicU64>,
    pub(crate) generation: CachePadded<AtomicU64>,
    pub(crate) flags: CachePadded<AtomicU64>,
}

/// Page-rounded size of a header region carrying `metadata_size` bytes.
pub(crate) fn region_size(metadata_size: usize, page_size: usize) -> usize {
    let bytes = METADATA_OFFSET + metadata_size;
    bytes.div_ceil(page_size) * page_size
}

/// End of a bounded wait. `None` waits forever.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
    pub(crate) fn after(timeout: Option<Duration>) -> Self {
        Deadline(timeout.and_then(|t| Instant::now().checked_add(t)))
    }

    pub(crate) fn is_expired(self) -> bool {
        self.0.is_some_and(|end| Instant::now() >= end)
    }

    pub(crate) fn remaining(self) -> Option<Duration> {
        self.0.map(|end| end.saturating_duration_since(Instant::now()))
    }

    /// Milliseconds for the next kernel wait, rounded up and clamped. Longer
    /// waits are split into several calls by the caller's loop.
    fn millis(self) -> Option<u16> {
        self.remaining().map(|left| {
            let ms = left.as_nanos().div_ceil(1_000_000);
            ms.min(u16::MAX as u128) as u16
        })
    }

    pub(crate) fn epoll_timeout(self) -> EpollTimeout {
        match self.millis() {
            Some(ms) => EpollTimeout::from(ms),
            None => EpollTimeout::NONE,
        }
    }

    pub(crate) fn poll_timeout(self) -> PollTimeout {
        match self.millis() {
            Some(ms) => PollTimeout::from(ms),
            None => PollTimeout::NONE,
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_metadata_offset_is_aligned() {
        assert_eq!(METADATA_OFFSET % METADATA_ALIGN, 0);
        assert!(METADATA_OFFSET >= std::mem::size_of::<SharedHeader>());
    }

    #[rstest]
    #[case(0)]
    #[case(8)]
    #[case(4096)]
    #[case(MAX_METADATA_SIZE)]
    fn test_region_holds_header_and_metadata(#[case] metadata_size: usize) {
        let size = region_size(metadata_size, 4096);
        assert_eq!(size % 4096, 0);
        assert!(size >= METADATA_OFFSET + metadata_size);
        assert!(size < METADATA_OFFSET + metadata_size + 4096);
    }

    #[test]
    fn test_deadline() {
        let forever = Deadline::after(None);
        assert!(!forever.is_expired());
        assert_eq!(forever.remaining(), None);

        let now = Deadline::after(Some(Duration::ZERO));
        assert!(now.is_expired());
        assert_eq!(now.millis(), Some(0));

        let later = Deadline::after(Some(Duration::from_secs(3600)));
        assert!(!later.is_expired());
        assert_eq!(later.millis(), Some(u16::MAX));
    }
}
