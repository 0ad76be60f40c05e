//! One message per `sendmsg`, descriptors attached as `SCM_RIGHTS`.

use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use protocol::{BUFFER_FD_COUNT, MAX_MESSAGE_SIZE};
use rkyv::util::AlignedVec;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use crate::{HubdError, Result};

pub(crate) type MessageBuf = AlignedVec<16>;

pub(crate) fn message_buf() -> MessageBuf {
    MessageBuf::with_capacity(MAX_MESSAGE_SIZE)
}

pub(crate) fn send_message(
    socket: BorrowedFd<'_>,
    bytes: &[u8],
    fds: &[BorrowedFd<'_>],
) -> Result<()> {
    let raw_fds: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let iov = [IoSlice::new(bytes)];
    let cmsgs = [ControlMessage::ScmRights(&raw_fds)];
    let cmsgs: &[ControlMessage<'_>] = if raw_fds.is_empty() { &[] } else { &cmsgs };

    loop {
        match sendmsg::<()>(
            socket.as_raw_fd(),
            &iov,
            cmsgs,
            MsgFlags::MSG_NOSIGNAL,
            None,
        ) {
            Ok(sent) if sent == bytes.len() => return Ok(()),
            Ok(sent) => {
                return Err(HubdError::Protocol(format!(
                    "short send: {sent} of {} bytes",
                    bytes.len()
                )))
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => return Err(HubdError::Disconnected),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Reads one message into `buf`. Returns `None` once the peer closed the
/// connection.
pub(crate) fn recv_message(
    socket: BorrowedFd<'_>,
    buf: &mut MessageBuf,
) -> Result<Option<Vec<OwnedFd>>> {
    buf.clear();
    buf.resize(MAX_MESSAGE_SIZE, 0);
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; BUFFER_FD_COUNT]);

    let (bytes, fds, truncated) = loop {
        let mut iov = [IoSliceMut::new(buf.as_mut_slice())];
        match recvmsg::<()>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => {
                let mut fds = Vec::new();
                for cmsg in msg.cmsgs()? {
                    if let ControlMessageOwned::ScmRights(raw) = cmsg {
                        fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
                    }
                }
                let truncated = msg
                    .flags
                    .intersects(MsgFlags::MSG_TRUNC | MsgFlags::MSG_CTRUNC);
                break (msg.bytes, fds, truncated);
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECONNRESET) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    };

    if bytes == 0 {
        return Ok(None);
    }
    if truncated {
        return Err(HubdError::Protocol("truncated message".to_string()));
    }
    buf.resize(bytes, 0);
    Ok(Some(fds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_fds_travel_with_message() {
        let (left, right) = UnixStream::pair().unwrap();
        let (mut near, far) = UnixStream::pair().unwrap();

        send_message(left.as_fd(), b"hello", &[far.as_fd()]).unwrap();
        drop(far);

        let mut buf = message_buf();
        let mut fds = recv_message(right.as_fd(), &mut buf).unwrap().unwrap();
        assert_eq!(buf.as_slice(), b"hello");
        assert_eq!(fds.len(), 1);

        let mut received = File::from(fds.remove(0));
        received.write_all(b"x").unwrap();
        let mut byte = [0u8; 1];
        near.read_exact(&mut byte).unwrap();
        assert_eq!(&byte, b"x");
    }

    #[test]
    fn test_closed_peer_reads_none() {
        let (left, right) = UnixStream::pair().unwrap();
        drop(left);

        let mut buf = message_buf();
        assert!(recv_message(right.as_fd(), &mut buf).unwrap().is_none());
    }

    #[test]
    fn test_message_without_fds() {
        let (left, right) = UnixStream::pair().unwrap();
        send_message(left.as_fd(), &[7u8; 32], &[]).unwrap();

        let mut buf = message_buf();
        let fds = recv_message(right.as_fd(), &mut buf).unwrap().unwrap();
        assert!(fds.is_empty());
        assert_eq!(buf.len(), 32);
    }
}
