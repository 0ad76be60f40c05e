use bufferhub::{BufferDescriptor, BufferHub, BufferHubError, BufferId, Fence, Liveness, PeerId};
use protocol::{ArchivedRequest, Response};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use tracing::debug;

use crate::convert::{
    error_to_wire, fence_from_wire, fence_to_wire, slot_from_wire, spec_from_wire, spec_to_wire,
};
use crate::Result;

/// An encoded response and the descriptors that go with it.
pub(crate) struct Reply {
    pub(crate) bytes: Vec<u8>,
    pub(crate) fds: Vec<OwnedFd>,
}

enum Outcome {
    Buffer(BufferDescriptor),
    Done,
    Fence(Fence, Vec<u8>),
}

/// One connected peer. Dropping the session reports the peer as gone, which
/// reclaims whatever it still held.
pub(crate) struct Session {
    hub: Arc<BufferHub>,
    peer: PeerId,
}

impl Session {
    pub(crate) fn new(hub: Arc<BufferHub>) -> Self {
        let peer = hub.register_peer();
        Session { hub, peer }
    }

    pub(crate) fn peer(&self) -> PeerId {
        self.peer
    }

    /// Runs one request. Failures of the request itself become an error
    /// response; only encoding problems are returned as errors.
    pub(crate) fn handle(&self, request: &ArchivedRequest, fds: Vec<OwnedFd>) -> Result<Reply> {
        match self.dispatch(request, fds) {
            Ok(Outcome::Buffer(descriptor)) => {
                let (id, client, spec, fds) = descriptor.into_parts();
                let response = Response::Buffer {
                    buffer_id: id.get(),
                    client: client.bit_index(),
                    spec: spec_to_wire(&spec),
                };
                Ok(Reply {
                    bytes: protocol::encode(&response)?,
                    fds,
                })
            }
            Ok(Outcome::Done) => Ok(Reply {
                bytes: protocol::encode(&Response::Done)?,
                fds: Vec::new(),
            }),
            Ok(Outcome::Fence(fence, metadata)) => {
                let (kind, fd) = fence.into_parts();
                let response = Response::Fence {
                    fence: fence_to_wire(kind),
                    metadata: &metadata,
                };
                Ok(Reply {
                    bytes: protocol::encode(&response)?,
                    fds: fd.into_iter().collect(),
                })
            }
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "request failed");
                let (code, detail, message) = error_to_wire(&e);
                let response = Response::Error {
                    code,
                    detail,
                    message: &message,
                };
                Ok(Reply {
                    bytes: protocol::encode(&response)?,
                    fds: Vec::new(),
                })
            }
        }
    }

    fn dispatch(
        &self,
        request: &ArchivedRequest,
        mut fds: Vec<OwnedFd>,
    ) -> std::result::Result<Outcome, BufferHubError> {
        let hub = &self.hub;
        let peer = self.peer;

        let outcome = match request {
            ArchivedRequest::CreateProducer { spec } => {
                let spec = spec_from_wire(spec.to_native())?;
                Outcome::Buffer(hub.create_producer(peer, &spec, None)?)
            }
            ArchivedRequest::CreatePersistentProducer { name, spec } => {
                let spec = spec_from_wire(spec.to_native())?;
                Outcome::Buffer(hub.create_producer(peer, &spec, Some(&**name))?)
            }
            ArchivedRequest::CreateConsumer { buffer_id: id } => {
                Outcome::Buffer(hub.create_consumer(peer, buffer_id(id))?)
            }
            ArchivedRequest::ClaimConsumer { buffer_id: id, slot } => {
                hub.claim_consumer(peer, buffer_id(id), slot_from_wire(*slot)?)?;
                Outcome::Done
            }
            ArchivedRequest::Post {
                buffer_id: id,
                fence,
                metadata,
            } => {
                let fence = take_fence(fence.to_native(), &mut fds)?;
                hub.post(peer, buffer_id(id), fence, metadata)?;
                Outcome::Done
            }
            ArchivedRequest::Gain { buffer_id: id } => {
                Outcome::Fence(hub.gain(peer, buffer_id(id))?, Vec::new())
            }
            ArchivedRequest::Acquire {
                buffer_id: id,
                slot,
                metadata_len,
            } => {
                let len = usize::try_from(metadata_len.to_native()).unwrap_or(usize::MAX);
                let (fence, metadata) =
                    hub.acquire(peer, buffer_id(id), slot_from_wire(*slot)?, len)?;
                Outcome::Fence(fence, metadata)
            }
            ArchivedRequest::Release {
                buffer_id: id,
                slot,
                fence,
            } => {
                let fence = take_fence(fence.to_native(), &mut fds)?;
                hub.release(peer, buffer_id(id), slot_from_wire(*slot)?, fence)?;
                Outcome::Done
            }
            ArchivedRequest::RemovePersistence { buffer_id: id } => {
                hub.remove_persistence(peer, buffer_id(id))?;
                Outcome::Done
            }
            ArchivedRequest::DetachProducer { buffer_id: id } => {
                hub.detach_producer(peer, buffer_id(id))?;
                Outcome::Done
            }
            ArchivedRequest::DetachConsumer { buffer_id: id, slot } => {
                hub.detach_consumer(peer, buffer_id(id), slot_from_wire(*slot)?)?;
                Outcome::Done
            }
        };
        Ok(outcome)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!(peer = %self.peer, "peer disconnected");
        self.hub.peer_disconnected(self.peer);
    }
}

fn buffer_id(id: &rkyv::Archived<u64>) -> BufferId {
    BufferId::new(id.to_native())
}

fn take_fence(
    kind: protocol::FenceKind,
    fds: &mut Vec<OwnedFd>,
) -> std::result::Result<Fence, BufferHubError> {
    if fds.len() != kind.fd_count() {
        return Err(BufferHubError::InvalidDescriptor(format!(
            "fence {kind:?} arrived with {} fds",
            fds.len()
        )));
    }
    Fence::from_parts(fence_from_wire(kind), fds.pop())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{message_buf, MessageBuf};
    use bufferhub::{BufferSpec, MemfdAllocator};
    use protocol::{ArchivedResponse, ErrorCode, FenceKind, Request, WireSpec};
    use rstest::*;

    #[fixture]
    fn hub() -> Arc<BufferHub> {
        Arc::new(BufferHub::new(MemfdAllocator::default()))
    }

    fn run(session: &Session, request: &Request<'_>, fds: Vec<OwnedFd>) -> Reply {
        let bytes = protocol::encode(request).unwrap();
        let mut buf = message_buf();
        buf.extend_from_slice(&bytes);
        let archived = rkyv::access::<ArchivedRequest, rkyv::rancor::Error>(&buf).unwrap();
        session.handle(archived, fds).unwrap()
    }

    fn aligned(reply: &Reply) -> MessageBuf {
        let mut buf = message_buf();
        buf.extend_from_slice(&reply.bytes);
        buf
    }

    fn response(buf: &MessageBuf) -> &ArchivedResponse {
        rkyv::access::<ArchivedResponse, rkyv::rancor::Error>(buf).unwrap()
    }

    fn spec() -> WireSpec {
        WireSpec {
            width: 64,
            height: 64,
            format: 1,
            usage: 0,
            metadata_size: 8,
        }
    }

    #[rstest]
    fn test_create_producer_sends_descriptor(hub: Arc<BufferHub>) {
        let session = Session::new(Arc::clone(&hub));
        let reply = run(&session, &Request::CreateProducer { spec: spec() }, vec![]);

        assert_eq!(reply.fds.len(), protocol::BUFFER_FD_COUNT);
        match response(&aligned(&reply)) {
            ArchivedResponse::Buffer { client, spec, .. } => {
                assert_eq!(*client, 0);
                assert_eq!(spec.to_native(), self::spec());
            }
            _ => panic!("expected a buffer response"),
        }
        assert_eq!(hub.buffer_count(), 1);
    }

    #[rstest]
    fn test_failures_become_error_responses(hub: Arc<BufferHub>) {
        let session = Session::new(hub);
        let reply = run(&session, &Request::Gain { buffer_id: 41 }, vec![]);

        assert!(reply.fds.is_empty());
        match response(&aligned(&reply)) {
            ArchivedResponse::Error { code, detail, .. } => {
                assert_eq!(code.to_native(), ErrorCode::UnknownBuffer);
                assert_eq!(detail.to_native(), 41);
            }
            _ => panic!("expected an error response"),
        }
    }

    #[rstest]
    fn test_fence_fd_count_is_checked(hub: Arc<BufferHub>) {
        let session = Session::new(Arc::clone(&hub));
        let descriptor = hub
            .create_producer(session.peer(), &BufferSpec::new(4, 4, 1, 0), None)
            .unwrap();

        let request = Request::Post {
            buffer_id: descriptor.id().get(),
            fence: FenceKind::Plain,
            metadata: &[],
        };
        let reply = run(&session, &request, vec![]);
        match response(&aligned(&reply)) {
            ArchivedResponse::Error { code, .. } => {
                assert_eq!(code.to_native(), ErrorCode::InvalidDescriptor)
            }
            _ => panic!("expected an error response"),
        }
        assert!(hub.buffer_state(descriptor.id()).unwrap().is_gained());
    }

    #[rstest]
    fn test_dropping_session_disconnects_peer(hub: Arc<BufferHub>) {
        let session = Session::new(Arc::clone(&hub));
        run(&session, &Request::CreateProducer { spec: spec() }, vec![]);
        assert_eq!(hub.buffer_count(), 1);

        drop(session);
        assert_eq!(hub.buffer_count(), 0);
    }
}
