//! Completion fences and the shared relay that carries them between owners.
//!
//! A [`Fence`] is a one-shot, kernel-backed completion handle. It moves with
//! each transition: the producer hands one to `post`, consumers receive it
//! from `acquire`, hand their own to `release`, and the producer gets the
//! combined result back from `gain`.
//!
//! Fences never travel through shared memory directly. Each buffer carries
//! two shared epoll sets, one per direction. A publisher registers its fence
//! fd under a token of `generation << 6 | bit_index`. A collector duplicates
//! the epoll set into a relay fence that completes once every wanted client's
//! fence of that generation reports readable.
//!
//! Registrations outlive the transition that made them. A client's fence
//! stays in the set while it is pending, and completed fences are only
//! dropped once `RETAINED_FENCES` newer ones sit behind them, so a relay
//! handed out earlier still finds its generation after the owners move on.
//! Only plain fds are ever registered: a relay published as an input fence is
//! first bridged to a plain fence.

use crate::common::Deadline;
use crate::error::{BufferHubError, Result};
use crate::hub_trace;
use crate::slot::Client;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use nix::sys::eventfd::{EfdFlags, EventFd};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::warn;

const RELAY_EVENTS: usize = 128;
const RELAY_BACKOFF: Duration = Duration::from_micros(200);
const RELAY_BACKOFF_MAX: Duration = Duration::from_millis(5);
const TOKEN_CLIENT_BITS: u32 = 6;
const TOKEN_CLIENT_MASK: u64 = (1 << TOKEN_CLIENT_BITS) - 1;

/// Completed fences each client keeps registered behind its newest ones.
pub(crate) const RETAINED_FENCES: usize = 8;

/// What a relay fence is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayWait {
    /// State-word mask of the clients whose fences must complete.
    pub wanted: u64,
    pub generation: u64,
}

/// Describes a fence without its fd, for transfer over a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceKind {
    Invalid,
    Plain,
    Relay(RelayWait),
}

enum Inner {
    Invalid,
    Fd(OwnedFd),
    Relay(Relay),
}

struct Relay {
    epoll: Epoll,
    wait: RelayWait,
    /// Wanted clients already seen complete.
    seen: AtomicU64,
}

impl Relay {
    fn new(epoll: Epoll, wait: RelayWait) -> Self {
        Relay {
            epoll,
            wait,
            seen: AtomicU64::new(0),
        }
    }
}

/// A move-only completion handle. The invalid fence counts as already
/// complete.
pub struct Fence {
    inner: Inner,
}

impl Fence {
    pub fn invalid() -> Self {
        Fence {
            inner: Inner::Invalid,
        }
    }

    /// Wraps any pollable fd that becomes readable on completion.
    pub fn from_owned_fd(fd: OwnedFd) -> Self {
        Fence {
            inner: Inner::Fd(fd),
        }
    }

    /// Creates an eventfd-backed fence and the one-shot signal that
    /// completes it.
    pub fn new() -> Result<(Fence, FenceSignal)> {
        let eventfd = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC)
            .map_err(|e| BufferHubError::EventfdCreation(e.to_string()))?;
        let fd = eventfd.as_fd().try_clone_to_owned()?;
        Ok((Fence::from_owned_fd(fd), FenceSignal { eventfd }))
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self.inner, Inner::Invalid)
    }

    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        match &self.inner {
            Inner::Invalid => None,
            Inner::Fd(fd) => Some(fd.as_fd()),
            Inner::Relay(relay) => Some(relay.epoll.0.as_fd()),
        }
    }

    pub fn kind(&self) -> FenceKind {
        match &self.inner {
            Inner::Invalid => FenceKind::Invalid,
            Inner::Fd(_) => FenceKind::Plain,
            Inner::Relay(relay) => FenceKind::Relay(relay.wait),
        }
    }

    pub fn is_signaled(&self) -> Result<bool> {
        self.wait(Some(Duration::ZERO))
    }

    /// Blocks until the fence completes or `timeout` elapses. Returns whether
    /// it completed. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = Deadline::after(timeout);
        match &self.inner {
            Inner::Invalid => Ok(true),
            Inner::Fd(fd) => wait_fd(fd.as_fd(), deadline),
            Inner::Relay(relay) => wait_relay(relay, deadline),
        }
    }

    pub fn into_parts(self) -> (FenceKind, Option<OwnedFd>) {
        match self.inner {
            Inner::Invalid => (FenceKind::Invalid, None),
            Inner::Fd(fd) => (FenceKind::Plain, Some(fd)),
            Inner::Relay(relay) => (FenceKind::Relay(relay.wait), Some(relay.epoll.0)),
        }
    }

    /// Rebuilds a fence received from another process.
    pub fn from_parts(kind: FenceKind, fd: Option<OwnedFd>) -> Result<Self> {
        match (kind, fd) {
            (FenceKind::Invalid, None) => Ok(Fence::invalid()),
            (FenceKind::Plain, Some(fd)) => Ok(Fence::from_owned_fd(fd)),
            (FenceKind::Relay(wait), Some(fd)) => Ok(Fence {
                inner: Inner::Relay(Relay::new(Epoll(fd), wait)),
            }),
            _ => Err(BufferHubError::Fence(Errno::EBADF)),
        }
    }
}

impl Default for Fence {
    fn default() -> Self {
        Fence::invalid()
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("kind", &self.kind())
            .field("fd", &self.as_fd())
            .finish()
    }
}

/// Completes the paired [`Fence`]. Consumed by use.
pub struct FenceSignal {
    eventfd: EventFd,
}

impl FenceSignal {
    pub fn signal(self) -> Result<()> {
        self.eventfd
            .write(1)
            .map_err(|e| BufferHubError::EventfdWrite(e.to_string()))?;
        Ok(())
    }
}

fn wait_fd(fd: BorrowedFd<'_>, deadline: Deadline) -> Result<bool> {
    loop {
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, deadline.poll_timeout()) {
            Ok(0) if deadline.is_expired() => return Ok(false),
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                    return Err(BufferHubError::Fence(Errno::EBADF));
                }
                return Ok(true);
            }
            Err(e) => return Err(BufferHubError::Fence(e)),
        }
    }
}

fn wait_relay(relay: &Relay, deadline: Deadline) -> Result<bool> {
    let wanted = relay.wait.wanted;
    let generation = relay.wait.generation & (u64::MAX >> TOKEN_CLIENT_BITS);
    let mut events = [EpollEvent::empty(); RELAY_EVENTS];
    let mut backoff = RELAY_BACKOFF;
    loop {
        if relay.seen.load(Ordering::Acquire) & wanted == wanted {
            return Ok(true);
        }

        let n = match relay.epoll.wait(&mut events, deadline.epoll_timeout()) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(BufferHubError::Fence(e)),
        };

        let ready = events[..n]
            .iter()
            .map(|event| event.data())
            .filter(|token| token >> TOKEN_CLIENT_BITS == generation)
            .fold(0u64, |mask, token| mask | 1 << (token & TOKEN_CLIENT_MASK));

        let seen = relay.seen.fetch_or(ready & wanted, Ordering::AcqRel) | ready;
        if seen & wanted == wanted {
            return Ok(true);
        }
        if deadline.is_expired() {
            return Ok(false);
        }
        if n > 0 {
            // Level-triggered: other generations' entries report again at once.
            let pause = deadline
                .remaining()
                .map_or(backoff, |left| left.min(backoff));
            thread::sleep(pause);
            backoff = (backoff * 2).min(RELAY_BACKOFF_MAX);
        }
    }
}

/// Stands a plain fence in for `relay`, signalled by a helper thread once the
/// relay completes.
fn bridge(relay: Fence) -> Result<Fence> {
    let (fence, signal) = Fence::new()?;
    thread::Builder::new()
        .name("bufferhub-fence".to_string())
        .spawn(move || {
            if let Err(e) = relay.wait(None) {
                warn!(error = ?e, "relay fence failed, completing its bridge");
            }
            if let Err(e) = signal.signal() {
                warn!(error = ?e, "failed to signal bridged fence");
            }
        })?;
    Ok(fence)
}

fn fence_token(generation: u64, client: Client) -> u64 {
    (generation << TOKEN_CLIENT_BITS) | client.bit_index() as u64
}

/// One process's view of a shared fence set.
pub(crate) struct FenceRelay {
    shared: Epoll,
    /// Fences each client published from this process, oldest first, with
    /// their generations. Holding them keeps their registrations alive.
    published: Mutex<HashMap<u8, VecDeque<(u64, Fence)>>>,
}

impl FenceRelay {
    pub(crate) fn new() -> Result<Self> {
        let shared = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(FenceRelay::from_owned_fd(shared.0))
    }

    pub(crate) fn from_owned_fd(fd: OwnedFd) -> Self {
        FenceRelay {
            shared: Epoll(fd),
            published: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn clone_fd(&self) -> std::io::Result<OwnedFd> {
        self.shared.0.try_clone()
    }

    /// Registers `fence` for `client` in `generation`. Earlier fences of the
    /// client stay registered. Returns false if there was nothing left to
    /// wait on.
    pub(crate) fn publish(&self, fence: Fence, generation: u64, client: Client) -> Result<bool> {
        if !fence.is_valid() || fence.is_signaled()? {
            return Ok(false);
        }
        let fence = if matches!(fence.inner, Inner::Relay(_)) {
            bridge(fence)?
        } else {
            fence
        };

        let token = fence_token(generation, client);
        if let Some(fd) = fence.as_fd() {
            self.shared
                .add(fd, EpollEvent::new(EpollFlags::EPOLLIN, token))
                .map_err(BufferHubError::Fence)?;
        }

        let mut published = self.published.lock();
        let fences = published.entry(client.bit_index()).or_default();
        fences.push_back((generation, fence));
        self.prune(fences);
        hub_trace!(token, retained = fences.len(), "fence published");
        Ok(true)
    }

    /// Takes back the fence `client` published for `generation`.
    pub(crate) fn withdraw(&self, generation: u64, client: Client) {
        let mut published = self.published.lock();
        let Some(fences) = published.get_mut(&client.bit_index()) else {
            return;
        };
        if let Some(index) = fences.iter().position(|(g, _)| *g == generation) {
            if let Some((_, fence)) = fences.remove(index) {
                self.unregister(&fence);
            }
        }
    }

    /// Drops the oldest completed fences beyond the newest `RETAINED_FENCES`.
    /// Pending fences stay whatever their age.
    fn prune(&self, fences: &mut VecDeque<(u64, Fence)>) {
        let mut excess = fences.len().saturating_sub(RETAINED_FENCES);
        fences.retain(|(_, fence)| {
            if excess == 0 || !fence.is_signaled().unwrap_or(true) {
                return true;
            }
            self.unregister(fence);
            excess -= 1;
            false
        });
    }

    fn unregister(&self, fence: &Fence) {
        if let Some(fd) = fence.as_fd() {
            let _ = self.shared.delete(fd);
        }
    }

    /// A fence that completes once every client in `wanted` has a readable
    /// fence registered for `generation`.
    pub(crate) fn collect(&self, wanted: u64, generation: u64) -> Result<Fence> {
        if wanted == 0 {
            return Ok(Fence::invalid());
        }

        let fd = self.clone_fd()?;
        Ok(Fence {
            inner: Inner::Relay(Relay::new(Epoll(fd), RelayWait { wanted, generation })),
        })
    }

    #[cfg(all(test, not(feature = "loom")))]
    fn retained(&self, client: Client) -> usize {
        self.published
            .lock()
            .get(&client.bit_index())
            .map_or(0, VecDeque::len)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::slot::ConsumerSlot;
    use rstest::*;

    fn consumer(index: u8) -> Client {
        Client::Consumer(ConsumerSlot::from_index(index).unwrap())
    }

    #[fixture]
    fn relay() -> FenceRelay {
        FenceRelay::new().unwrap()
    }

    #[test]
    fn test_invalid_fence_is_complete() {
        let fence = Fence::invalid();
        assert!(!fence.is_valid());
        assert!(fence.is_signaled().unwrap());
        assert!(fence.as_fd().is_none());
    }

    #[test]
    fn test_signal_completes_fence() {
        let (fence, signal) = Fence::new().unwrap();
        assert!(fence.is_valid());
        assert!(!fence.is_signaled().unwrap());
        assert!(!fence.wait(Some(Duration::from_millis(5))).unwrap());

        signal.signal().unwrap();
        assert!(fence.wait(None).unwrap());
    }

    #[test]
    fn test_parts_round_trip_keeps_readiness() {
        let (fence, signal) = Fence::new().unwrap();
        let (kind, fd) = fence.into_parts();
        assert_eq!(kind, FenceKind::Plain);

        let fence = Fence::from_parts(kind, fd).unwrap();
        signal.signal().unwrap();
        assert!(fence.is_signaled().unwrap());

        assert!(Fence::from_parts(FenceKind::Plain, None).is_err());
    }

    #[rstest]
    fn test_relay_waits_for_every_wanted_client(relay: FenceRelay) {
        let second = FenceRelay::from_owned_fd(relay.clone_fd().unwrap());
        let (f1, s1) = Fence::new().unwrap();
        let (f2, s2) = Fence::new().unwrap();

        assert!(relay.publish(f1, 7, consumer(1)).unwrap());
        assert!(second.publish(f2, 7, consumer(2)).unwrap());

        let wanted = consumer(1).mask() | consumer(2).mask();
        let merged = relay.collect(wanted, 7).unwrap();
        assert_eq!(
            merged.kind(),
            FenceKind::Relay(RelayWait {
                wanted,
                generation: 7
            })
        );
        assert!(!merged.is_signaled().unwrap());

        s1.signal().unwrap();
        assert!(!merged.wait(Some(Duration::from_millis(5))).unwrap());

        s2.signal().unwrap();
        assert!(merged.wait(Some(Duration::from_secs(5))).unwrap());
    }

    #[rstest]
    fn test_relay_ignores_other_generations(relay: FenceRelay) {
        let (old, old_signal) = Fence::new().unwrap();
        relay.publish(old, 3, Client::Producer).unwrap();
        old_signal.signal().unwrap();

        let merged = relay.collect(Client::Producer.mask(), 4).unwrap();
        assert!(!merged.wait(Some(Duration::from_millis(5))).unwrap());

        let (current, signal) = Fence::new().unwrap();
        relay.publish(current, 4, Client::Producer).unwrap();
        signal.signal().unwrap();
        assert!(merged.wait(Some(Duration::from_secs(5))).unwrap());
    }

    #[rstest]
    fn test_publish_skips_completed_fences(relay: FenceRelay) {
        assert!(!relay
            .publish(Fence::invalid(), 1, Client::Producer)
            .unwrap());

        let (fence, signal) = Fence::new().unwrap();
        signal.signal().unwrap();
        assert!(!relay.publish(fence, 1, Client::Producer).unwrap());
    }

    #[rstest]
    fn test_clients_publishing_from_one_process_coexist(relay: FenceRelay) {
        let (f1, s1) = Fence::new().unwrap();
        let (f2, s2) = Fence::new().unwrap();
        relay.publish(f1, 2, consumer(1)).unwrap();
        relay.publish(f2, 2, consumer(2)).unwrap();

        let merged = relay
            .collect(consumer(1).mask() | consumer(2).mask(), 2)
            .unwrap();
        s1.signal().unwrap();
        s2.signal().unwrap();
        assert!(merged.wait(Some(Duration::from_secs(5))).unwrap());
    }

    #[rstest]
    fn test_relay_outlives_republish(relay: FenceRelay) {
        let (first, first_signal) = Fence::new().unwrap();
        relay.publish(first, 1, Client::Producer).unwrap();
        let merged = relay.collect(Client::Producer.mask(), 1).unwrap();

        let (second, _second_signal) = Fence::new().unwrap();
        assert!(relay.publish(second, 2, Client::Producer).unwrap());
        assert!(!merged.wait(Some(Duration::from_millis(5))).unwrap());

        first_signal.signal().unwrap();
        assert!(merged.wait(Some(Duration::from_millis(500))).unwrap());
    }

    #[rstest]
    fn test_completed_fences_are_pruned_beyond_retention(relay: FenceRelay) {
        let (stuck, stuck_signal) = Fence::new().unwrap();
        relay.publish(stuck, 1, consumer(4)).unwrap();
        let early = relay.collect(consumer(4).mask(), 1).unwrap();
        let (recent, recent_signal) = Fence::new().unwrap();
        relay.publish(recent, 2, consumer(4)).unwrap();
        let recent_merged = relay.collect(consumer(4).mask(), 2).unwrap();
        recent_signal.signal().unwrap();

        for generation in 3..(RETAINED_FENCES as u64 + 6) {
            let (fence, signal) = Fence::new().unwrap();
            relay.publish(fence, generation, consumer(4)).unwrap();
            signal.signal().unwrap();
        }
        // The oldest completed fence made way; the pending one never does.
        assert_eq!(relay.retained(consumer(4)), RETAINED_FENCES);
        assert!(!recent_merged.wait(Some(Duration::from_millis(5))).unwrap());

        stuck_signal.signal().unwrap();
        assert!(early.wait(Some(Duration::from_millis(500))).unwrap());
    }

    #[rstest]
    fn test_seen_clients_stay_complete(relay: FenceRelay) {
        let (fence, signal) = Fence::new().unwrap();
        relay.publish(fence, 1, consumer(5)).unwrap();
        let merged = relay.collect(consumer(5).mask(), 1).unwrap();
        signal.signal().unwrap();
        assert!(merged.wait(Some(Duration::from_millis(500))).unwrap());

        relay.withdraw(1, consumer(5));
        assert!(merged.is_signaled().unwrap());
    }

    #[rstest]
    fn test_withdraw_removes_registration(relay: FenceRelay) {
        let (fence, signal) = Fence::new().unwrap();
        relay.publish(fence, 5, consumer(3)).unwrap();
        relay.withdraw(5, consumer(3));
        signal.signal().unwrap();

        assert_eq!(relay.retained(consumer(3)), 0);
        let merged = relay.collect(consumer(3).mask(), 5).unwrap();
        assert!(!merged.wait(Some(Duration::from_millis(5))).unwrap());
    }

    #[test]
    fn test_published_relay_waits_for_all_of_its_clients() {
        let releases = FenceRelay::new().unwrap();
        let posts = FenceRelay::new().unwrap();
        let (r1, s1) = Fence::new().unwrap();
        let (r2, s2) = Fence::new().unwrap();
        releases.publish(r1, 1, consumer(1)).unwrap();
        releases.publish(r2, 1, consumer(2)).unwrap();

        let gained = releases
            .collect(consumer(1).mask() | consumer(2).mask(), 1)
            .unwrap();
        assert!(posts.publish(gained, 2, Client::Producer).unwrap());
        let acquired = posts.collect(Client::Producer.mask(), 2).unwrap();

        s1.signal().unwrap();
        assert!(!acquired.wait(Some(Duration::from_millis(50))).unwrap());

        s2.signal().unwrap();
        assert!(acquired.wait(Some(Duration::from_secs(5))).unwrap());
    }

    #[test]
    fn test_relays_pass_through_both_directions() {
        let releases = FenceRelay::new().unwrap();
        let posts = FenceRelay::new().unwrap();
        let (post_fence, post_signal) = Fence::new().unwrap();
        posts.publish(post_fence, 1, Client::Producer).unwrap();

        let acquired = posts.collect(Client::Producer.mask(), 1).unwrap();
        assert!(releases.publish(acquired, 1, consumer(1)).unwrap());
        let gained = releases.collect(consumer(1).mask(), 1).unwrap();
        assert!(posts.publish(gained, 2, Client::Producer).unwrap());
        let next = posts.collect(Client::Producer.mask(), 2).unwrap();
        assert!(!next.wait(Some(Duration::from_millis(20))).unwrap());

        post_signal.signal().unwrap();
        assert!(next.wait(Some(Duration::from_secs(5))).unwrap());
    }

    #[rstest]
    fn test_collect_nothing_is_invalid(relay: FenceRelay) {
        let fence = relay.collect(0, 9).unwrap();
        assert!(!fence.is_valid());
    }
}
