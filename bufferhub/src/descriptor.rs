use crate::common::MAX_METADATA_SIZE;
use crate::error::{BufferHubError, Result};
use crate::slot::Client;
use std::fmt;
use std::os::fd::OwnedFd;

/// Number of fds carried by a [`BufferDescriptor`].
pub const BUFFER_FD_COUNT: usize = 6;

/// Stable identity of a buffer. Survives producer re-attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    pub fn new(raw: u64) -> Self {
        BufferId(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocation parameters, fixed for the buffer's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferSpec {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub usage: u64,
    /// Capacity of the shared metadata record in bytes. Zero is allowed.
    pub metadata_size: usize,
}

impl BufferSpec {
    pub fn new(width: u32, height: u32, format: u32, usage: u64) -> Self {
        BufferSpec {
            width,
            height,
            format,
            usage,
            metadata_size: 0,
        }
    }

    pub fn with_metadata_size(mut self, metadata_size: usize) -> Self {
        self.metadata_size = metadata_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(BufferHubError::InvalidSpec(format!(
                "dimensions must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.metadata_size > MAX_METADATA_SIZE {
            return Err(BufferHubError::InvalidSpec(format!(
                "metadata size {} exceeds the {} byte limit",
                self.metadata_size, MAX_METADATA_SIZE
            )));
        }
        Ok(())
    }
}

/// Everything a process needs to map a buffer as one client: the identity,
/// the client's bit and the shared fds. Handed out by buffer and consumer
/// creation and consumed by import.
#[derive(Debug)]
pub struct BufferDescriptor {
    pub(crate) id: BufferId,
    pub(crate) client: Client,
    pub(crate) spec: BufferSpec,
    pub(crate) fds: DescriptorFds,
}

#[derive(Debug)]
pub(crate) struct DescriptorFds {
    pub(crate) header: OwnedFd,
    pub(crate) graphics: OwnedFd,
    pub(crate) producer_event: OwnedFd,
    pub(crate) consumer_event: OwnedFd,
    pub(crate) post_fences: OwnedFd,
    pub(crate) release_fences: OwnedFd,
}

impl BufferDescriptor {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn client(&self) -> Client {
        self.client
    }

    pub fn spec(&self) -> &BufferSpec {
        &self.spec
    }

    /// Splits the descriptor for `SCM_RIGHTS` transfer. The fds come out in
    /// the order [`BufferDescriptor::from_parts`] expects.
    pub fn into_parts(self) -> (BufferId, Client, BufferSpec, Vec<OwnedFd>) {
        let DescriptorFds {
            header,
            graphics,
            producer_event,
            consumer_event,
            post_fences,
            release_fences,
        } = self.fds;
        let fds = vec![
            header,
            graphics,
            producer_event,
            consumer_event,
            post_fences,
            release_fences,
        ];
        (self.id, self.client, self.spec, fds)
    }

    pub fn from_parts(
        id: BufferId,
        client: Client,
        spec: BufferSpec,
        fds: Vec<OwnedFd>,
    ) -> Result<Self> {
        let count = fds.len();
        let fds: [OwnedFd; BUFFER_FD_COUNT] = fds.try_into().map_err(|_| {
            BufferHubError::InvalidDescriptor(format!(
                "expected {BUFFER_FD_COUNT} fds, got {count}"
            ))
        })?;
        let [header, graphics, producer_event, consumer_event, post_fences, release_fences] = fds;

        Ok(BufferDescriptor {
            id,
            client,
            spec,
            fds: DescriptorFds {
                header,
                graphics,
                producer_event,
                consumer_event,
                post_fences,
                release_fences,
            },
        })
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(BufferSpec::new(640, 480, 1, 0), true)]
    #[case(BufferSpec::new(1, 1, 0, 0).with_metadata_size(MAX_METADATA_SIZE), true)]
    #[case(BufferSpec::new(0, 480, 1, 0), false)]
    #[case(BufferSpec::new(640, 0, 1, 0), false)]
    #[case(BufferSpec::new(640, 480, 1, 0).with_metadata_size(MAX_METADATA_SIZE + 1), false)]
    fn test_validate(#[case] spec: BufferSpec, #[case] valid: bool) {
        assert_eq!(spec.validate().is_ok(), valid);
    }

    #[test]
    fn test_from_parts_requires_every_fd() {
        let spec = BufferSpec::new(4, 4, 1, 0);
        let fds = (0..BUFFER_FD_COUNT - 1)
            .map(|_| crate::memory::create_memfd(c"descriptor-test", 0).unwrap())
            .collect();
        let err = BufferDescriptor::from_parts(BufferId::new(1), Client::Producer, spec, fds)
            .unwrap_err();
        assert!(matches!(err, BufferHubError::InvalidDescriptor(_)));
    }
}
