use crate::bus::TransportStatus;
use crate::reading::{ReadingKey, ValueType};

/// Errors raised by the telemetry model, the bus connection and the protocol adapters.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller broke an API contract. Not retried.
    #[error("Precondition violated: {0}")]
    PreconditionViolation(String),
    /// A pack was constructed from, or would be left with, no elements.
    #[error("A battery pack requires at least one element")]
    EmptyChildSet,
    /// A chip channel outside of the range supported by the chip.
    #[error("Channel {0} is out of range")]
    InvalidChannel(u8),
    /// A valid chip channel without a connected cell.
    #[error("There is no cell connected to channel {0}")]
    ChannelNotConnected(u8),

    #[error("Unknown reading '{0}'")]
    UnknownKey(ReadingKey),
    #[error("Reading '{0}' already exists")]
    DuplicateKey(ReadingKey),
    #[error("Reading '{key}' holds {expected:?} values, got {found:?}")]
    TypeMismatch {
        key: ReadingKey,
        expected: ValueType,
        found: ValueType,
    },
    #[error("Reading '{0}' is derived and cannot be written")]
    NotPrimitive(ReadingKey),

    #[error("Unable to find channel {index} on device with serial number '{serial_number}'")]
    ChannelNotFound { serial_number: String, index: usize },
    #[error("Unable to enumerate bus channels: {0}")]
    DeviceEnumeration(TransportStatus),
    #[error("Unable to open bus channel: {0}")]
    ChannelOpen(TransportStatus),
    #[error("Unable to initialize bus channel: {0}")]
    ChannelInit(TransportStatus),
    #[error("Unable to close bus channel: {0}")]
    ChannelClose(TransportStatus),
    #[error("Error while {direction} device 0x{address:02X}: {failure}")]
    Transfer {
        address: u8,
        direction: Direction,
        failure: TransferFailure,
    },
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("The bus connection is not connected")]
    NotConnected,
    #[error("The bus connection is {0:?}")]
    InvalidState(crate::bus::ConnectionState),

    #[error("Invalid reply size - required={required} received={received}")]
    ReplySize { required: usize, received: usize },
    #[error("Invalid checksum - calculated={calculated:#06X} received={received:#06X}")]
    Checksum { calculated: u16, received: u16 },
    #[error("Invalid reading: {0}")]
    InvalidReading(String),

    #[error("Bus task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Transport and protocol failures can be retried by the caller, everything else is
    /// a programming error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ChannelNotConnected(_)
                | Error::ChannelNotFound { .. }
                | Error::DeviceEnumeration(_)
                | Error::ChannelOpen(_)
                | Error::ChannelInit(_)
                | Error::ChannelClose(_)
                | Error::Transfer { .. }
                | Error::InvalidArgument(_)
                | Error::ReplySize { .. }
                | Error::Checksum { .. }
                | Error::InvalidReading(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Writing,
    Reading,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Writing => write!(f, "writing to"),
            Direction::Reading => write!(f, "reading from"),
        }
    }
}

/// Why a single bus transfer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransferFailure {
    #[error("{0}")]
    Status(TransportStatus),
    #[error("transferred {transferred} of {requested} bytes")]
    Incomplete { requested: usize, transferred: usize },
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
