//! System Management Bus transactions on top of an [`AddressableBus`].

mod smart_battery;

pub use smart_battery::{SmartBatteryAdapter, SMART_BATTERY_ADDRESS};

use crate::bus::AddressableBus;
use crate::{Error, Result};

/// Longest block an SMBus device may return.
pub const MAX_BLOCK_SIZE: usize = 32;

/// SMBus packet error code: CRC-8 with polynomial x^8 + x^2 + x + 1.
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |mut crc, byte| {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
        crc
    })
}

/// A device on the bus that speaks SMBus.
#[derive(Debug)]
pub struct SmBus<B> {
    bus: B,
    address: u8,
    pec: bool,
}

impl<B: AddressableBus> SmBus<B> {
    pub fn new(bus: B, address: u8) -> Self {
        Self {
            bus,
            address,
            pec: false,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Enables packet error checking on every transaction.
    pub fn set_pec(&mut self, pec: bool) {
        self.pec = pec;
    }

    fn write_address(&self) -> u8 {
        self.address << 1
    }

    fn read_address(&self) -> u8 {
        (self.address << 1) | 1
    }

    fn validate_pec(&self, command: u8, reply: &[u8]) -> Result<()> {
        let Some((received, data)) = reply.split_last() else {
            return Ok(());
        };
        let mut message = vec![self.write_address(), command, self.read_address()];
        message.extend_from_slice(data);
        let calculated = crc8(&message);
        if calculated != *received {
            log::warn!(
                "Invalid PEC - calculated={:02X?} received={:02X?} buffer={:02X?}",
                calculated,
                received,
                reply
            );
            return Err(Error::Checksum {
                calculated: calculated.into(),
                received: (*received).into(),
            });
        }
        Ok(())
    }

    fn pec_size(&self) -> usize {
        usize::from(self.pec)
    }

    async fn read(&self, command: u8, size: usize) -> Result<Vec<u8>> {
        let reply_size = size + self.pec_size();
        let reply = self
            .bus
            .transceive(self.address, &[command], reply_size)
            .await?;
        if reply.len() < reply_size {
            return Err(Error::ReplySize {
                required: reply_size,
                received: reply.len(),
            });
        }
        if self.pec {
            self.validate_pec(command, &reply)?;
        }
        Ok(reply)
    }

    pub async fn read_word(&self, command: u8) -> Result<u16> {
        let reply = self.read(command, 2).await?;
        Ok(u16::from_le_bytes([reply[0], reply[1]]))
    }

    pub async fn read_signed_word(&self, command: u8) -> Result<i16> {
        let reply = self.read(command, 2).await?;
        Ok(i16::from_le_bytes([reply[0], reply[1]]))
    }

    /// Reads a length prefixed block.
    pub async fn read_block(&self, command: u8) -> Result<Vec<u8>> {
        let reply = self
            .bus
            .transceive(
                self.address,
                &[command],
                1 + MAX_BLOCK_SIZE + self.pec_size(),
            )
            .await?;
        let Some(&length) = reply.first() else {
            return Err(Error::ReplySize {
                required: 1,
                received: 0,
            });
        };
        let length = usize::from(length);
        if length > MAX_BLOCK_SIZE {
            return Err(Error::InvalidReading(format!(
                "block length {length} exceeds {MAX_BLOCK_SIZE}"
            )));
        }
        let reply_size = 1 + length + self.pec_size();
        if reply.len() < reply_size {
            return Err(Error::ReplySize {
                required: reply_size,
                received: reply.len(),
            });
        }
        if self.pec {
            self.validate_pec(command, &reply[..reply_size])?;
        }
        Ok(reply[1..=length].to_vec())
    }

    pub async fn write_word(&self, command: u8, value: u16) -> Result<()> {
        let [low, high] = value.to_le_bytes();
        let mut frame = vec![command, low, high];
        if self.pec {
            frame.push(crc8(&[self.write_address(), command, low, high]));
        }
        self.bus.send(self.address, &frame).await
    }
}
