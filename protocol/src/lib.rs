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

//! Messages spoken on the broker socket. One request, one response; file
//! descriptors ride alongside as `SCM_RIGHTS`.

use std::error::Error;
use std::fmt::Display;

use rkyv::api::high::{to_bytes_in, HighSerializer};
use rkyv::rancor::{fail, Fallible};
use rkyv::ser::allocator::ArenaHandle;
use rkyv::ser::{Positional, Writer};
use rkyv::with::InlineAsBox;
use rkyv::{Archive, Deserialize, Serialize};

pub const VERSION: u32 = 1;

/// Descriptors attached to every `Response::Buffer`.
pub const BUFFER_FD_COUNT: usize = 6;

/// Upper bound on an encoded message. Fits the largest metadata record.
pub const MAX_MESSAGE_SIZE: usize = 20 * 1024;

#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct WireSpec {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub usage: u64,
    pub metadata_size: u64,
}

impl ArchivedWireSpec {
    pub fn to_native(&self) -> WireSpec {
        WireSpec {
            width: self.width.to_native(),
            height: self.height.to_native(),
            format: self.format.to_native(),
            usage: self.usage.to_native(),
            metadata_size: self.metadata_size.to_native(),
        }
    }
}

/// How to rebuild a fence from the descriptors that came with the message.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub enum FenceKind {
    Invalid,
    Plain,
    Relay { wanted: u64, generation: u64 },
}

impl FenceKind {
    pub fn fd_count(self) -> usize {
        match self {
            FenceKind::Invalid => 0,
            FenceKind::Plain | FenceKind::Relay { .. } => 1,
        }
    }
}

impl ArchivedFenceKind {
    pub fn to_native(&self) -> FenceKind {
        match self {
            ArchivedFenceKind::Invalid => FenceKind::Invalid,
            ArchivedFenceKind::Plain => FenceKind::Plain,
            ArchivedFenceKind::Relay { wanted, generation } => FenceKind::Relay {
                wanted: wanted.to_native(),
                generation: generation.to_native(),
            },
        }
    }
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub enum ErrorCode {
    Busy,
    AlreadyDone,
    NoFreeSlots,
    MetadataSize,
    BrokenPipe,
    ParameterMismatch,
    ProducerExists,
    InvalidSpec,
    InvalidDescriptor,
    InvalidSlot,
    NotProducer,
    UnknownBuffer,
    Internal,
}

impl ArchivedErrorCode {
    pub fn to_native(&self) -> ErrorCode {
        match self {
            ArchivedErrorCode::Busy => ErrorCode::Busy,
            ArchivedErrorCode::AlreadyDone => ErrorCode::AlreadyDone,
            ArchivedErrorCode::NoFreeSlots => ErrorCode::NoFreeSlots,
            ArchivedErrorCode::MetadataSize => ErrorCode::MetadataSize,
            ArchivedErrorCode::BrokenPipe => ErrorCode::BrokenPipe,
            ArchivedErrorCode::ParameterMismatch => ErrorCode::ParameterMismatch,
            ArchivedErrorCode::ProducerExists => ErrorCode::ProducerExists,
            ArchivedErrorCode::InvalidSpec => ErrorCode::InvalidSpec,
            ArchivedErrorCode::InvalidDescriptor => ErrorCode::InvalidDescriptor,
            ArchivedErrorCode::InvalidSlot => ErrorCode::InvalidSlot,
            ArchivedErrorCode::NotProducer => ErrorCode::NotProducer,
            ArchivedErrorCode::UnknownBuffer => ErrorCode::UnknownBuffer,
            ArchivedErrorCode::Internal => ErrorCode::Internal,
        }
    }
}

/// Client to broker. `Post` and `Release` carry the fence fd when
/// `fence.fd_count()` is 1.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Request<'a> {
    CreateProducer {
        spec: WireSpec,
    },
    CreatePersistentProducer {
        #[rkyv(with = InlineAsBox)]
        name: &'a str,
        spec: WireSpec,
    },
    CreateConsumer {
        buffer_id: u64,
    },
    ClaimConsumer {
        buffer_id: u64,
        slot: u8,
    },
    Post {
        buffer_id: u64,
        fence: FenceKind,
        #[rkyv(with = InlineAsBox)]
        metadata: &'a [u8],
    },
    Gain {
        buffer_id: u64,
    },
    Acquire {
        buffer_id: u64,
        slot: u8,
        metadata_len: u64,
    },
    Release {
        buffer_id: u64,
        slot: u8,
        fence: FenceKind,
    },
    RemovePersistence {
        buffer_id: u64,
    },
    DetachProducer {
        buffer_id: u64,
    },
    DetachConsumer {
        buffer_id: u64,
        slot: u8,
    },
}

/// Broker to client.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Response<'a> {
    /// Carries [`BUFFER_FD_COUNT`] descriptors. `client` is the state-word
    /// bit the descriptor speaks for.
    Buffer {
        buffer_id: u64,
        client: u8,
        spec: WireSpec,
    },
    Done,
    Fence {
        fence: FenceKind,
        #[rkyv(with = InlineAsBox)]
        metadata: &'a [u8],
    },
    /// `detail` carries the number the error is about: a slot, a buffer
    /// id, a capacity or a limit. Zero when there is none.
    Error {
        code: ErrorCode,
        detail: u64,
        #[rkyv(with = InlineAsBox)]
        message: &'a str,
    },
}

pub struct CountingWriter {
    write_count: usize,
    total_bytes: usize,
}

impl CountingWriter {
    pub fn new() -> Self {
        Self {
            write_count: 0,
            total_bytes: 0,
        }
    }

    pub fn write_count(&self) -> usize {
        self.write_count
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}

impl Default for CountingWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Fallible for CountingWriter {
    type Error = rkyv::rancor::Error;
}

impl Positional for CountingWriter {
    fn pos(&self) -> usize {
        self.total_bytes
    }
}

impl Writer<rkyv::rancor::Error> for CountingWriter {
    fn write(&mut self, bytes: &[u8]) -> Result<(), rkyv::rancor::Error> {
        self.write_count += 1;
        self.total_bytes += bytes.len();
        Ok(())
    }
}

pub struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> SliceWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn written(&self) -> usize {
        self.pos
    }
}

impl<'a> Fallible for SliceWriter<'a> {
    type Error = rkyv::rancor::Error;
}

impl<'a> Positional for SliceWriter<'a> {
    fn pos(&self) -> usize {
        self.pos
    }
}

#[derive(Debug)]
pub struct OutOfSpaceError;

impl Display for OutOfSpaceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "not enough space in the buffer")
    }
}

impl Error for OutOfSpaceError {}

#[derive(Debug)]
pub struct MessageTooLarge(pub usize);

impl Display for MessageTooLarge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "message of {} bytes exceeds the {} byte limit",
            self.0, MAX_MESSAGE_SIZE
        )
    }
}

impl Error for MessageTooLarge {}

impl<'a> Writer<rkyv::rancor::Error> for SliceWriter<'a> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), rkyv::rancor::Error> {
        if self.pos + bytes.len() > self.buf.len() {
            fail!(OutOfSpaceError);
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }
}

/// Serializes `value` into `buf`, which must hold at least
/// `compute_length(value)` bytes.
///
/// # Errors
/// Returns `rkyv::rancor::Error` if the buffer is too small or serialization fails.
pub fn serialize_to_buf<'b, T>(value: &T, buf: &'b mut [u8]) -> Result<(), rkyv::rancor::Error>
where
    T: for<'a> Serialize<HighSerializer<SliceWriter<'b>, ArenaHandle<'a>, rkyv::rancor::Error>>,
{
    let writer = SliceWriter::new(buf);
    let _ = to_bytes_in(value, writer)?;
    Ok(())
}

pub fn compute_length<'a, T>(value: &'a T) -> Result<usize, rkyv::rancor::Error>
where
    T: for<'b> Serialize<HighSerializer<CountingWriter, ArenaHandle<'b>, rkyv::rancor::Error>>,
{
    let writer = CountingWriter::new();
    let w = to_bytes_in(value, writer)?;
    Ok(w.total_bytes())
}

/// Sizes and serializes one message, refusing anything over
/// [`MAX_MESSAGE_SIZE`].
pub fn encode<T>(value: &T) -> Result<Vec<u8>, rkyv::rancor::Error>
where
    T: for<'b> Serialize<HighSerializer<CountingWriter, ArenaHandle<'b>, rkyv::rancor::Error>>,
    T: for<'a, 'b> Serialize<HighSerializer<SliceWriter<'a>, ArenaHandle<'b>, rkyv::rancor::Error>>,
{
    let len = compute_length(value)?;
    if len > MAX_MESSAGE_SIZE {
        fail!(MessageTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    serialize_to_buf(value, &mut buf)?;
    Ok(buf)
}
