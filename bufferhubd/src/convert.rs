//! Mapping between library types and their wire form.

use bufferhub::{
    BufferHubError, BufferSpec, Client, ConsumerSlot, FenceKind, RelayWait, MAX_CONSUMERS,
};
use protocol::{ErrorCode, FenceKind as WireFence, WireSpec};

pub(crate) fn spec_to_wire(spec: &BufferSpec) -> WireSpec {
    WireSpec {
        width: spec.width,
        height: spec.height,
        format: spec.format,
        usage: spec.usage,
        metadata_size: spec.metadata_size as u64,
    }
}

pub(crate) fn spec_from_wire(spec: WireSpec) -> Result<BufferSpec, BufferHubError> {
    let metadata_size = usize::try_from(spec.metadata_size).map_err(|_| {
        BufferHubError::InvalidSpec(format!("metadata size {}", spec.metadata_size))
    })?;
    Ok(BufferSpec::new(spec.width, spec.height, spec.format, spec.usage)
        .with_metadata_size(metadata_size))
}

pub(crate) fn fence_to_wire(kind: FenceKind) -> WireFence {
    match kind {
        FenceKind::Invalid => WireFence::Invalid,
        FenceKind::Plain => WireFence::Plain,
        FenceKind::Relay(RelayWait { wanted, generation }) => {
            WireFence::Relay { wanted, generation }
        }
    }
}

pub(crate) fn fence_from_wire(kind: WireFence) -> FenceKind {
    match kind {
        WireFence::Invalid => FenceKind::Invalid,
        WireFence::Plain => FenceKind::Plain,
        WireFence::Relay { wanted, generation } => {
            FenceKind::Relay(RelayWait { wanted, generation })
        }
    }
}

pub(crate) fn slot_from_wire(index: u8) -> Result<ConsumerSlot, BufferHubError> {
    ConsumerSlot::from_index(index).ok_or(BufferHubError::InvalidSlot(index))
}

pub(crate) fn client_from_wire(index: u8) -> Result<Client, BufferHubError> {
    Client::from_bit_index(index).ok_or_else(|| {
        BufferHubError::InvalidDescriptor(format!("client bit {index} out of range"))
    })
}

/// The code, detail and message sent back for a failed request.
pub(crate) fn error_to_wire(error: &BufferHubError) -> (ErrorCode, u64, String) {
    let message = error.to_string();
    let (code, detail) = match error {
        BufferHubError::Busy(_) => (ErrorCode::Busy, 0),
        BufferHubError::AlreadyDone => (ErrorCode::AlreadyDone, 0),
        BufferHubError::NoFreeSlots(limit) => (ErrorCode::NoFreeSlots, *limit as u64),
        BufferHubError::MetadataSize { capacity, .. } => {
            (ErrorCode::MetadataSize, *capacity as u64)
        }
        BufferHubError::BrokenPipe => (ErrorCode::BrokenPipe, 0),
        BufferHubError::ParameterMismatch(name) => {
            return (ErrorCode::ParameterMismatch, 0, name.clone())
        }
        BufferHubError::ProducerExists(name) => {
            return (ErrorCode::ProducerExists, 0, name.clone())
        }
        BufferHubError::InvalidSpec(reason) => return (ErrorCode::InvalidSpec, 0, reason.clone()),
        BufferHubError::InvalidDescriptor(reason) => {
            return (ErrorCode::InvalidDescriptor, 0, reason.clone())
        }
        BufferHubError::InvalidSlot(slot) => (ErrorCode::InvalidSlot, *slot as u64),
        BufferHubError::NotProducer(id) => (ErrorCode::NotProducer, *id),
        BufferHubError::UnknownBuffer(id) => (ErrorCode::UnknownBuffer, *id),
        _ => (ErrorCode::Internal, 0),
    };
    (code, detail, message)
}

/// Rebuilds the error for a request that asked for `requested` metadata
/// bytes while performing `verb`.
pub(crate) fn error_from_wire(
    code: ErrorCode,
    detail: u64,
    message: &str,
    verb: &'static str,
    requested: usize,
) -> BufferHubError {
    match code {
        ErrorCode::Busy => BufferHubError::Busy(verb),
        ErrorCode::AlreadyDone => BufferHubError::AlreadyDone,
        ErrorCode::NoFreeSlots => BufferHubError::NoFreeSlots(MAX_CONSUMERS),
        ErrorCode::MetadataSize => BufferHubError::MetadataSize {
            requested,
            capacity: detail as usize,
        },
        ErrorCode::BrokenPipe => BufferHubError::BrokenPipe,
        ErrorCode::ParameterMismatch => BufferHubError::ParameterMismatch(message.to_string()),
        ErrorCode::ProducerExists => BufferHubError::ProducerExists(message.to_string()),
        ErrorCode::InvalidSpec => BufferHubError::InvalidSpec(message.to_string()),
        ErrorCode::InvalidDescriptor => BufferHubError::InvalidDescriptor(message.to_string()),
        ErrorCode::InvalidSlot => BufferHubError::InvalidSlot(detail as u8),
        ErrorCode::NotProducer => BufferHubError::NotProducer(detail),
        ErrorCode::UnknownBuffer => BufferHubError::UnknownBuffer(detail),
        ErrorCode::Internal => BufferHubError::Broker(message.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(BufferHubError::Busy("post"))]
    #[case(BufferHubError::AlreadyDone)]
    #[case(BufferHubError::NoFreeSlots(MAX_CONSUMERS))]
    #[case(BufferHubError::MetadataSize { requested: 24, capacity: 16 })]
    #[case(BufferHubError::BrokenPipe)]
    #[case(BufferHubError::ParameterMismatch("scanout".to_string()))]
    #[case(BufferHubError::ProducerExists("scanout".to_string()))]
    #[case(BufferHubError::InvalidSlot(12))]
    #[case(BufferHubError::NotProducer(3))]
    #[case(BufferHubError::UnknownBuffer(9))]
    fn test_errors_survive_the_wire(#[case] error: BufferHubError) {
        let (code, detail, message) = error_to_wire(&error);
        let back = error_from_wire(code, detail, &message, "post", 24);
        assert_eq!(back.to_string(), error.to_string());
    }

    #[test]
    fn test_local_failures_are_internal() {
        let error = BufferHubError::Interrupted;
        let (code, _, message) = error_to_wire(&error);
        assert_eq!(code, ErrorCode::Internal);
        assert!(matches!(
            error_from_wire(code, 0, &message, "gain", 0),
            BufferHubError::Broker(_)
        ));
    }

    #[test]
    fn test_spec_round_trip() {
        let spec = BufferSpec::new(640, 480, 1, 0x300).with_metadata_size(16);
        assert_eq!(spec_from_wire(spec_to_wire(&spec)).unwrap(), spec);
    }

    #[rstest]
    #[case(0, true)]
    #[case(1, true)]
    #[case(63, true)]
    #[case(64, false)]
    fn test_client_bits(#[case] index: u8, #[case] valid: bool) {
        assert_eq!(client_from_wire(index).is_ok(), valid);
        assert_eq!(slot_from_wire(index).is_ok(), valid && index != 0);
    }
}
