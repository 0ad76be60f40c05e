use thiserror::Error;

#[derive(Error, Debug)]
pub enum BufferHubError {
    /// The verb is not legal in the caller's current state.
    #[error("buffer busy: {0} is not allowed in the current state")]
    Busy(&'static str),

    /// `gain` on a buffer the producer already owns.
    #[error("buffer already gained")]
    AlreadyDone,

    /// Every consumer bit of the state word is taken.
    #[error("no free consumer slots (limit {0})")]
    NoFreeSlots(usize),

    #[error("metadata size {requested} exceeds buffer capacity {capacity}")]
    MetadataSize { requested: usize, capacity: usize },

    /// The producer side was permanently torn down.
    #[error("broken pipe: the buffer producer is gone")]
    BrokenPipe,

    /// Re-attaching to a persistent buffer with different parameters.
    #[error("persistent buffer {0:?} exists with different parameters")]
    ParameterMismatch(String),

    #[error("persistent buffer {0:?} already has a live producer")]
    ProducerExists(String),

    #[error("invalid buffer spec: {0}")]
    InvalidSpec(String),

    #[error("invalid buffer descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("consumer slot {0} is not owned by this peer")]
    InvalidSlot(u8),

    #[error("peer does not own the producer of buffer {0}")]
    NotProducer(u64),

    #[error("unknown buffer {0}")]
    UnknownBuffer(u64),

    #[error("interrupted while waiting")]
    Interrupted,

    #[error("shared memory setup failed: {0}")]
    Memory(String),

    #[error("eventfd creation failed: {0}")]
    EventfdCreation(String),

    #[error("eventfd write failed: {0}")]
    EventfdWrite(String),

    #[error("fence operation failed: {0}")]
    Fence(nix::errno::Errno),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("system error: {0}")]
    Nix(#[from] nix::errno::Errno),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl BufferHubError {
    pub(crate) fn memory(report: eyre::Report) -> Self {
        BufferHubError::Memory(format!("{report:#}"))
    }
}

pub type Result<T> = std::result::Result<T, BufferHubError>;
