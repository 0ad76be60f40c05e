use bufferhub::BufferHub;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use protocol::ArchivedRequest;
use std::collections::HashMap;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::session::Session;
use crate::wire::{message_buf, recv_message, send_message, MessageBuf};
use crate::{HubdError, Result};

const LISTENER_TOKEN: u64 = 0;
const MAX_EVENTS: usize = 32;
const SHUTDOWN_POLL_MS: u16 = 100;

/// Serves a [`BufferHub`] on a Unix socket from a dedicated thread. Each
/// connection is one peer; closing it reclaims everything the peer held.
pub struct Server {
    socket_path: PathBuf,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl Server {
    pub fn start(socket_path: impl Into<PathBuf>, hub: Arc<BufferHub>) -> Result<Self> {
        let socket_path = socket_path.into();
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;
        info!(socket_path = %socket_path.display(), "bufferhubd listening");

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);
        let thread = thread::Builder::new()
            .name("bufferhubd-listener".to_string())
            .spawn(move || listener_thread(listener, hub, shutdown_clone))?;

        Ok(Server {
            socket_path,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether the listener thread is still serving.
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Stops serving and disconnects every peer.
    pub fn stop(mut self) -> Result<()> {
        self.join()
    }

    fn join(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        let result = match self.thread.take() {
            Some(thread) => thread.join().unwrap_or(Err(HubdError::ListenerPanicked)),
            None => Ok(()),
        };
        let _ = std::fs::remove_file(&self.socket_path);
        result
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(e) = self.join() {
            warn!(error = %e, "listener thread failed");
        }
    }
}

struct Peer {
    stream: UnixStream,
    session: Session,
}

fn listener_thread(
    listener: UnixListener,
    hub: Arc<BufferHub>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
    epoll.add(
        &listener,
        EpollEvent::new(EpollFlags::EPOLLIN, LISTENER_TOKEN),
    )?;

    let mut events = vec![EpollEvent::empty(); MAX_EVENTS];
    let mut peers: HashMap<u64, Peer> = HashMap::new();
    let mut buf = message_buf();

    while !shutdown.load(Ordering::Relaxed) {
        let nfds = match epoll.wait(&mut events, EpollTimeout::from(SHUTDOWN_POLL_MS)) {
            Ok(nfds) => nfds,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        };

        for event in events.iter().take(nfds) {
            match event.data() {
                LISTENER_TOKEN => accept_peers(&listener, &epoll, &hub, &mut peers)?,
                token => {
                    let keep = match peers.get(&token) {
                        Some(peer) => serve(peer, &mut buf),
                        None => continue,
                    };
                    if !keep {
                        if let Some(peer) = peers.remove(&token) {
                            epoll.delete(&peer.stream)?;
                        }
                    }
                }
            }
        }
    }

    debug!(peers = peers.len(), "listener thread shutting down");
    Ok(())
}

fn accept_peers(
    listener: &UnixListener,
    epoll: &Epoll,
    hub: &Arc<BufferHub>,
    peers: &mut HashMap<u64, Peer>,
) -> Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(true)?;
                let session = Session::new(Arc::clone(hub));
                let token = session.peer().get();
                epoll.add(&stream, EpollEvent::new(EpollFlags::EPOLLIN, token))?;
                debug!(peer = %session.peer(), "peer connected");
                peers.insert(token, Peer { stream, session });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => {
                warn!(error = ?e, "error accepting connection");
                return Ok(());
            }
        }
    }
}

/// Answers one request. Returns false once the peer should be dropped.
fn serve(peer: &Peer, buf: &mut MessageBuf) -> bool {
    let fds = match recv_message(peer.stream.as_fd(), buf) {
        Ok(Some(fds)) => fds,
        Ok(None) => return false,
        Err(HubdError::Nix(Errno::EAGAIN)) => return true,
        Err(e) => {
            warn!(peer = %peer.session.peer(), error = %e, "error reading from peer");
            return false;
        }
    };

    let request = match rkyv::access::<ArchivedRequest, rkyv::rancor::Error>(buf.as_slice()) {
        Ok(request) => request,
        Err(e) => {
            warn!(peer = %peer.session.peer(), error = %e, "malformed request");
            return false;
        }
    };

    let result = peer.session.handle(request, fds).and_then(|reply| {
        let fds: Vec<BorrowedFd<'_>> = reply.fds.iter().map(|fd| fd.as_fd()).collect();
        send_message(peer.stream.as_fd(), &reply.bytes, &fds)
    });
    match result {
        Ok(()) => true,
        Err(HubdError::Disconnected) => false,
        Err(e) => {
            warn!(peer = %peer.session.peer(), error = %e, "failed to answer peer");
            false
        }
    }
}
