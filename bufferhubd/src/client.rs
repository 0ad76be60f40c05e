use bufferhub::{
    Broker, BufferDescriptor, BufferHubError, BufferId, BufferSpec, ConsumerSlot, Fence,
    MAX_METADATA_SIZE,
};
use parking_lot::Mutex;
use protocol::{ArchivedResponse, Request};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use tracing::debug;

use crate::convert::{
    client_from_wire, error_from_wire, fence_from_wire, fence_to_wire, spec_from_wire,
    spec_to_wire,
};
use crate::wire::{message_buf, recv_message, send_message, MessageBuf};
use crate::{HubdError, Result};

enum Answer {
    Buffer(BufferDescriptor),
    Done,
    Fence(Fence, Vec<u8>),
}

/// A [`Broker`] that forwards every call to a `bufferhubd` instance. Calls
/// are serialized over one connection. Once the connection fails every
/// call reports [`BufferHubError::BrokenPipe`].
pub struct HubClient {
    stream: Mutex<Option<UnixStream>>,
}

impl HubClient {
    pub fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(socket_path.as_ref())?;
        debug!(socket_path = %socket_path.as_ref().display(), "connected to bufferhubd");
        Ok(HubClient {
            stream: Mutex::new(Some(stream)),
        })
    }

    /// Closes the connection. The daemon reclaims everything this peer
    /// still holds.
    pub fn shutdown(&self) {
        if self.stream.lock().take().is_some() {
            debug!("disconnected from bufferhubd");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.lock().is_some()
    }

    fn round_trip(
        &self,
        bytes: &[u8],
        fds: &[BorrowedFd<'_>],
    ) -> Result<(MessageBuf, Vec<OwnedFd>)> {
        let mut guard = self.stream.lock();
        let stream = guard.as_ref().ok_or(HubdError::Disconnected)?;

        let mut buf = message_buf();
        let result = send_message(stream.as_fd(), bytes, fds)
            .and_then(|()| recv_message(stream.as_fd(), &mut buf));
        match result {
            Ok(Some(fds)) => Ok((buf, fds)),
            Ok(None) => {
                *guard = None;
                Err(HubdError::Disconnected)
            }
            Err(e) => {
                *guard = None;
                Err(e)
            }
        }
    }

    fn call(
        &self,
        verb: &'static str,
        requested: usize,
        request: &Request<'_>,
        fds: &[BorrowedFd<'_>],
    ) -> bufferhub::Result<Answer> {
        let bytes =
            protocol::encode(request).map_err(|e| BufferHubError::Broker(e.to_string()))?;
        let (buf, mut fds) = self.round_trip(&bytes, fds).map_err(|e| {
            debug!(verb, error = %e, "bufferhubd call failed");
            BufferHubError::BrokenPipe
        })?;
        let response = rkyv::access::<ArchivedResponse, rkyv::rancor::Error>(buf.as_slice())
            .map_err(|e| BufferHubError::Broker(e.to_string()))?;

        match response {
            ArchivedResponse::Buffer {
                buffer_id,
                client,
                spec,
            } => {
                let descriptor = BufferDescriptor::from_parts(
                    BufferId::new(buffer_id.to_native()),
                    client_from_wire(*client)?,
                    spec_from_wire(spec.to_native())?,
                    fds,
                )?;
                Ok(Answer::Buffer(descriptor))
            }
            ArchivedResponse::Done => Ok(Answer::Done),
            ArchivedResponse::Fence { fence, metadata } => {
                let kind = fence.to_native();
                if fds.len() != kind.fd_count() {
                    return Err(BufferHubError::InvalidDescriptor(format!(
                        "fence {kind:?} arrived with {} fds",
                        fds.len()
                    )));
                }
                let fence = Fence::from_parts(fence_from_wire(kind), fds.pop())?;
                Ok(Answer::Fence(fence, metadata.to_vec()))
            }
            ArchivedResponse::Error {
                code,
                detail,
                message,
            } => Err(error_from_wire(
                code.to_native(),
                detail.to_native(),
                message,
                verb,
                requested,
            )),
        }
    }

    fn call_buffer(
        &self,
        verb: &'static str,
        request: &Request<'_>,
    ) -> bufferhub::Result<BufferDescriptor> {
        match self.call(verb, 0, request, &[])? {
            Answer::Buffer(descriptor) => Ok(descriptor),
            _ => Err(unexpected(verb)),
        }
    }

    fn call_done(
        &self,
        verb: &'static str,
        requested: usize,
        request: &Request<'_>,
        fds: &[BorrowedFd<'_>],
    ) -> bufferhub::Result<()> {
        match self.call(verb, requested, request, fds)? {
            Answer::Done => Ok(()),
            _ => Err(unexpected(verb)),
        }
    }

    fn call_fence(
        &self,
        verb: &'static str,
        requested: usize,
        request: &Request<'_>,
    ) -> bufferhub::Result<(Fence, Vec<u8>)> {
        match self.call(verb, requested, request, &[])? {
            Answer::Fence(fence, metadata) => Ok((fence, metadata)),
            _ => Err(unexpected(verb)),
        }
    }
}

fn unexpected(verb: &str) -> BufferHubError {
    BufferHubError::Broker(format!("unexpected response to {verb}"))
}

impl Broker for HubClient {
    fn create_producer(
        &self,
        spec: &BufferSpec,
        name: Option<&str>,
    ) -> bufferhub::Result<BufferDescriptor> {
        let spec = spec_to_wire(spec);
        let request = match name {
            Some(name) => Request::CreatePersistentProducer { name, spec },
            None => Request::CreateProducer { spec },
        };
        self.call_buffer("create producer", &request)
    }

    fn create_consumer(&self, id: BufferId) -> bufferhub::Result<BufferDescriptor> {
        self.call_buffer(
            "create consumer",
            &Request::CreateConsumer {
                buffer_id: id.get(),
            },
        )
    }

    fn claim_consumer(&self, id: BufferId, slot: ConsumerSlot) -> bufferhub::Result<()> {
        let request = Request::ClaimConsumer {
            buffer_id: id.get(),
            slot: slot.index(),
        };
        self.call_done("claim consumer", 0, &request, &[])
    }

    fn post(&self, id: BufferId, fence: Fence, metadata: &[u8]) -> bufferhub::Result<()> {
        if metadata.len() > MAX_METADATA_SIZE {
            return Err(BufferHubError::MetadataSize {
                requested: metadata.len(),
                capacity: MAX_METADATA_SIZE,
            });
        }
        let (kind, fd) = fence.into_parts();
        let request = Request::Post {
            buffer_id: id.get(),
            fence: fence_to_wire(kind),
            metadata,
        };
        let fds: Vec<BorrowedFd<'_>> = fd.iter().map(|fd| fd.as_fd()).collect();
        self.call_done("post", metadata.len(), &request, &fds)
    }

    fn gain(&self, id: BufferId) -> bufferhub::Result<Fence> {
        let request = Request::Gain {
            buffer_id: id.get(),
        };
        let (fence, _) = self.call_fence("gain", 0, &request)?;
        Ok(fence)
    }

    fn acquire(
        &self,
        id: BufferId,
        slot: ConsumerSlot,
        metadata_len: usize,
    ) -> bufferhub::Result<(Fence, Vec<u8>)> {
        let request = Request::Acquire {
            buffer_id: id.get(),
            slot: slot.index(),
            metadata_len: metadata_len as u64,
        };
        self.call_fence("acquire", metadata_len, &request)
    }

    fn release(&self, id: BufferId, slot: ConsumerSlot, fence: Fence) -> bufferhub::Result<()> {
        let (kind, fd) = fence.into_parts();
        let request = Request::Release {
            buffer_id: id.get(),
            slot: slot.index(),
            fence: fence_to_wire(kind),
        };
        let fds: Vec<BorrowedFd<'_>> = fd.iter().map(|fd| fd.as_fd()).collect();
        self.call_done("release", 0, &request, &fds)
    }

    fn remove_persistence(&self, id: BufferId) -> bufferhub::Result<()> {
        let request = Request::RemovePersistence {
            buffer_id: id.get(),
        };
        self.call_done("remove persistence", 0, &request, &[])
    }

    fn detach_producer(&self, id: BufferId) -> bufferhub::Result<()> {
        let request = Request::DetachProducer {
            buffer_id: id.get(),
        };
        self.call_done("detach producer", 0, &request, &[])
    }

    fn detach_consumer(&self, id: BufferId, slot: ConsumerSlot) -> bufferhub::Result<()> {
        let request = Request::DetachConsumer {
            buffer_id: id.get(),
            slot: slot.index(),
        };
        self.call_done("detach consumer", 0, &request, &[])
    }
}
