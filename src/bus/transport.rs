use bitflags::bitflags;

/// Status codes reported by a native I2C transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportStatus {
    #[error("invalid handle")]
    InvalidHandle,
    #[error("device not found")]
    DeviceNotFound,
    #[error("device not opened")]
    DeviceNotOpened,
    #[error("I/O error")]
    IoError,
    #[error("insufficient resources")]
    InsufficientResources,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("device list not ready")]
    DeviceListNotReady,
    #[error("operation not supported")]
    NotSupported,
    #[error("timeout")]
    Timeout,
    #[error("transport error {0}")]
    Other(u32),
}

bitflags! {
    /// Framing of a single raw transfer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TransferOptions: u32 {
        /// Generate a start condition before the transfer.
        const START_BIT = 0x0000_0001;
        /// Generate a stop condition after the transfer.
        const STOP_BIT = 0x0000_0002;
        /// Stop writing as soon as the device does not acknowledge a byte.
        const BREAK_ON_NACK = 0x0000_0004;
        /// Do not acknowledge the last byte read.
        const NACK_LAST_BYTE = 0x0000_0008;
        /// Transfer bytes in bulk instead of one command per byte.
        const FAST_TRANSFER_BYTES = 0x0000_0010;
    }
}

/// Identifies one channel of the transport.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelInfo {
    pub serial_number: String,
    pub description: String,
    pub location: String,
}

/// Settings applied to a channel right after it was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Clock rate in Hz.
    pub clock_rate: u32,
    /// USB latency timer in ms.
    pub latency_timer: u8,
    /// Only drive the lines low and let pull-ups release them.
    pub drive_only_zero: bool,
}

impl ChannelConfig {
    pub const DEFAULT_CLOCK_RATE: u32 = 10_000;
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            clock_rate: Self::DEFAULT_CLOCK_RATE,
            latency_timer: 1,
            drive_only_zero: true,
        }
    }
}

/// The native hardware driver beneath a [`super::Connection`].
///
/// All calls block. Timeouts are the transport's business and surface as a status.
pub trait I2cTransport: Send + 'static {
    type Handle: Send + 'static;

    fn channel_count(&mut self) -> Result<u32, TransportStatus>;

    fn channel_info(&mut self, index: u32) -> Result<ChannelInfo, TransportStatus>;

    fn open_channel(&mut self, index: u32) -> Result<Self::Handle, TransportStatus>;

    fn init_channel(
        &mut self,
        handle: &mut Self::Handle,
        config: &ChannelConfig,
    ) -> Result<(), TransportStatus>;

    fn close_channel(&mut self, handle: Self::Handle) -> Result<(), TransportStatus>;

    /// Returns the number of bytes written.
    fn device_write(
        &mut self,
        handle: &mut Self::Handle,
        address: u8,
        data: &[u8],
        options: TransferOptions,
    ) -> Result<usize, TransportStatus>;

    /// Returns the number of bytes read into the beginning of `buffer`.
    fn device_read(
        &mut self,
        handle: &mut Self::Handle,
        address: u8,
        buffer: &mut [u8],
        options: TransferOptions,
    ) -> Result<usize, TransportStatus>;
}
