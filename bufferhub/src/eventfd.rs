use crate::common::Deadline;
use crate::error::{BufferHubError, Result};
use bitflags::bitflags;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use nix::sys::eventfd::{EfdFlags, EventFd};
use std::os::{
    fd::{AsFd, BorrowedFd},
    unix::io::OwnedFd,
};
use std::time::Duration;

/// A shared eventfd. Every write is an edge for each edge-triggered
/// listener; the counter is never drained, so no listener can consume
/// another's wakeup.
pub struct Notification {
    eventfd: EventFd,
}

impl Notification {
    pub fn new() -> Result<Self> {
        let eventfd =
            EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
                .map_err(|e| BufferHubError::EventfdCreation(e.to_string()))?;

        Ok(Notification { eventfd })
    }

    /// Creates a Notification from an existing file descriptor.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `fd` is a valid eventfd file descriptor.
    /// The file descriptor will be owned by this Notification instance.
    pub unsafe fn from_owned_fd(fd: OwnedFd) -> Self {
        let eventfd = EventFd::from_owned_fd(fd);
        Notification { eventfd }
    }

    pub fn notify(&self) -> Result<()> {
        match self.eventfd.write(1) {
            // Counter saturated: still readable, listeners already have an edge.
            Ok(_) | Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(BufferHubError::EventfdWrite(e.to_string())),
        }
    }

    pub fn fd(&self) -> BorrowedFd {
        self.eventfd.as_fd()
    }

    pub fn clone_fd(&self) -> std::io::Result<OwnedFd> {
        self.eventfd.as_fd().try_clone_to_owned()
    }
}

/// A handle's private view of one shared [`Notification`].
pub(crate) struct Waiter {
    epoll: Epoll,
}

impl Waiter {
    pub(crate) fn new(notification: &Notification) -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        epoll.add(
            notification.fd(),
            EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, 0),
        )?;
        Ok(Waiter { epoll })
    }

    /// Waits for the next notification. Returns false on timeout.
    pub(crate) fn wait(&self, deadline: Deadline) -> Result<bool> {
        let mut events = [EpollEvent::empty(); 1];
        match self.epoll.wait(&mut events, deadline.epoll_timeout()) {
            Ok(n) => Ok(n > 0),
            Err(Errno::EINTR) => Err(BufferHubError::Interrupted),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns 1 once `available` holds, or 0 if `timeout` elapses first.
    /// The condition is re-checked after every wakeup.
    pub(crate) fn poll(
        &self,
        timeout: Option<Duration>,
        available: impl Fn() -> bool,
    ) -> Result<usize> {
        let deadline = Deadline::after(timeout);
        loop {
            if available() {
                return Ok(1);
            }
            if deadline.is_expired() {
                return Ok(0);
            }
            self.wait(deadline)?;
        }
    }
}

bitflags! {
    /// Logical readiness of a buffer handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferEvents: u32 {
        const AVAILABLE = 1 << 0;
        const HANGUP = 1 << 1;
        const ERROR = 1 << 2;
    }
}

/// An fd to register with the caller's own edge-triggered poller.
#[derive(Debug, Clone, Copy)]
pub struct EventSource<'a> {
    pub fd: BorrowedFd<'a>,
    pub events: EpollFlags,
}

/// Translates raw readiness reported for an [`EventSource`].
pub fn event_mask(raw: EpollFlags) -> BufferEvents {
    let mut events = BufferEvents::empty();
    if raw.contains(EpollFlags::EPOLLIN) {
        events |= BufferEvents::AVAILABLE;
    }
    if raw.contains(EpollFlags::EPOLLHUP) {
        events |= BufferEvents::HANGUP;
    }
    if raw.contains(EpollFlags::EPOLLERR) {
        events |= BufferEvents::ERROR;
    }
    events
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn soon() -> Deadline {
        Deadline::after(Some(Duration::from_millis(10)))
    }

    #[test]
    fn test_every_waiter_sees_each_notify() {
        let notification = Notification::new().unwrap();
        let first = Waiter::new(&notification).unwrap();
        let second = Waiter::new(&notification).unwrap();

        assert!(!first.wait(soon()).unwrap());

        notification.notify().unwrap();
        assert!(first.wait(soon()).unwrap());
        assert!(second.wait(soon()).unwrap());

        assert!(!first.wait(soon()).unwrap());
        notification.notify().unwrap();
        assert!(first.wait(soon()).unwrap());
    }

    #[test]
    fn test_waiter_over_cloned_fd() {
        let notification = Notification::new().unwrap();
        let remote = unsafe { Notification::from_owned_fd(notification.clone_fd().unwrap()) };
        let waiter = Waiter::new(&notification).unwrap();

        remote.notify().unwrap();
        assert!(waiter.wait(soon()).unwrap());
    }

    #[test]
    fn test_poll_wakes_on_notify() {
        let notification = Arc::new(Notification::new().unwrap());
        let waiter = Waiter::new(&notification).unwrap();
        let ready = Arc::new(AtomicBool::new(false));

        assert_eq!(
            waiter
                .poll(Some(Duration::ZERO), || ready.load(Ordering::Acquire))
                .unwrap(),
            0
        );

        let remote = Arc::clone(&notification);
        let flag = Arc::clone(&ready);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            flag.store(true, Ordering::Release);
            remote.notify().unwrap();
        });

        let polled = waiter
            .poll(Some(Duration::from_secs(5)), || ready.load(Ordering::Acquire))
            .unwrap();
        assert_eq!(polled, 1);
        handle.join().unwrap();
    }

    #[rstest]
    #[case(EpollFlags::EPOLLIN, BufferEvents::AVAILABLE)]
    #[case(EpollFlags::EPOLLHUP, BufferEvents::HANGUP)]
    #[case(EpollFlags::EPOLLERR | EpollFlags::EPOLLIN, BufferEvents::ERROR | BufferEvents::AVAILABLE)]
    #[case(EpollFlags::EPOLLOUT, BufferEvents::empty())]
    fn test_event_mask(#[case] raw: EpollFlags, #[case] expected: BufferEvents) {
        assert_eq!(event_mask(raw), expected);
    }
}
