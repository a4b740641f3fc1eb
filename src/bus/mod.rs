//! Addressed, half-duplex byte transports.
//!
//! [`Connection`] turns a blocking [`I2cTransport`] into an asynchronous session. Protocol
//! adapters are written against the [`AddressableBus`] capability, not against a concrete
//! connection.

mod connection;
mod transport;

/// Serial attached I2C adapter in binary mode.
#[cfg(feature = "buspirate")]
pub mod buspirate;

pub use connection::Connection;
pub use transport::{
    ChannelConfig, ChannelInfo, I2cTransport, TransferOptions, TransportStatus,
};

use crate::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Session lifecycle of a bus connection.
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Opens the `channel_index`-th channel (zero based) among the channels of the device with
    /// the given serial number, and configures it.
    async fn connect(&self, serial_number: &str, channel_index: usize) -> Result<()>;

    /// Releases the channel. Disconnecting a disconnected connection is a no-op.
    async fn disconnect(&self) -> Result<()>;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

/// Transactions with devices identified by a 7-bit address.
///
/// Each call is atomic with respect to other callers of the same bus.
#[async_trait]
pub trait AddressableBus: Send + Sync {
    /// Writes `data` framed with start and stop condition. A partial write is an error.
    async fn send(&self, address: u8, data: &[u8]) -> Result<()>;

    /// Reads up to `length` bytes. A short read returns the bytes actually transferred.
    async fn receive(&self, address: u8, length: usize) -> Result<Vec<u8>>;

    /// Writes `data` and reads up to `receive_length` bytes in one transaction.
    async fn transceive(&self, address: u8, data: &[u8], receive_length: usize)
        -> Result<Vec<u8>>;
}

#[async_trait]
impl<B: AddressableBus + ?Sized> AddressableBus for std::sync::Arc<B> {
    async fn send(&self, address: u8, data: &[u8]) -> Result<()> {
        (**self).send(address, data).await
    }

    async fn receive(&self, address: u8, length: usize) -> Result<Vec<u8>> {
        (**self).receive(address, length).await
    }

    async fn transceive(
        &self,
        address: u8,
        data: &[u8],
        receive_length: usize,
    ) -> Result<Vec<u8>> {
        (**self).transceive(address, data, receive_length).await
    }
}
