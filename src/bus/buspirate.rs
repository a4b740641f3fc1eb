//! I2C transport over a Bus Pirate in binary I2C mode.
//!
//! Channels are the USB serial ports present on the system; the channel serial number is the
//! USB serial number of the adapter.

use super::transport::{ChannelConfig, ChannelInfo, I2cTransport, TransferOptions, TransportStatus};
use serialport::{SerialPort, SerialPortType};
use std::io::{Read, Write};
use std::time::Duration;

const BAUD_RATE: u32 = 115_200;
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

const RESET: u8 = 0x00;
const ENTER_I2C: u8 = 0x02;
const EXIT_TO_TERMINAL: u8 = 0x0F;
const START_BIT: u8 = 0x02;
const STOP_BIT: u8 = 0x03;
const READ_BYTE: u8 = 0x04;
const ACK: u8 = 0x06;
const NACK: u8 = 0x07;
const BULK_WRITE: u8 = 0x10;
const CONFIGURE_PERIPHERALS: u8 = 0x40;
const POWER_ON: u8 = 0x08;
const PULLUPS_ON: u8 = 0x04;
const SET_SPEED: u8 = 0x60;
const MAX_BULK_LENGTH: usize = 16;
const COMMAND_OK: u8 = 0x01;

/// Supported bus speeds, slowest first.
const SPEEDS: [(u32, u8); 4] = [(5_000, 0), (50_000, 1), (100_000, 2), (400_000, 3)];

/// Highest supported speed not above `clock_rate`, falling back to the slowest one.
fn speed_code(clock_rate: u32) -> u8 {
    SPEEDS
        .iter()
        .rev()
        .find(|(rate, _)| *rate <= clock_rate)
        .map_or(SPEEDS[0].1, |(_, code)| *code)
}

#[derive(Debug, Clone)]
struct Port {
    name: String,
    info: ChannelInfo,
}

pub struct BusPirate {
    timeout: Duration,
    ports: Vec<Port>,
}

impl BusPirate {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            ports: Vec::new(),
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

impl Default for BusPirate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BusPirate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusPirate")
            .field("timeout", &self.timeout)
            .field("ports", &self.ports)
            .finish()
    }
}

/// An open serial port in binary I2C mode.
pub struct Handle {
    serial: Box<dyn SerialPort>,
}

fn io_status(err: std::io::Error) -> TransportStatus {
    log::warn!("Bus Pirate I/O error: {err}");
    match err.kind() {
        std::io::ErrorKind::TimedOut => TransportStatus::Timeout,
        _ => TransportStatus::IoError,
    }
}

impl Handle {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportStatus> {
        log::trace!("write bytes: {bytes:02X?}");
        self.serial.write_all(bytes).map_err(io_status)
    }

    fn read_byte(&mut self) -> Result<u8, TransportStatus> {
        let mut byte = [0; 1];
        self.serial.read_exact(&mut byte).map_err(io_status)?;
        Ok(byte[0])
    }

    fn read_exact(&mut self, size: usize) -> Result<Vec<u8>, TransportStatus> {
        let mut rx_buffer = vec![0; size];
        self.serial.read_exact(&mut rx_buffer).map_err(io_status)?;
        log::trace!("receive_bytes: {rx_buffer:02X?}");
        Ok(rx_buffer)
    }

    /// Sends a single byte command answered by `0x01`.
    fn command(&mut self, command: u8) -> Result<(), TransportStatus> {
        self.write(&[command])?;
        match self.read_byte()? {
            COMMAND_OK => Ok(()),
            other => {
                log::warn!("Command {command:02X} rejected with {other:02X}");
                Err(TransportStatus::Other(other.into()))
            }
        }
    }

    fn discard_pending(&mut self) -> Result<(), TransportStatus> {
        self.serial
            .clear(serialport::ClearBuffer::Input)
            .map_err(|err| io_status(err.into()))
    }

    fn enter_binary_i2c(&mut self) -> Result<(), TransportStatus> {
        // The adapter answers "BBIO1" after up to 20 resets.
        for _ in 0..20 {
            self.write(&[RESET])?;
            std::thread::sleep(Duration::from_millis(10));
            if self.serial.bytes_to_read().unwrap_or(0) >= 5 {
                let reply = self.read_exact(5)?;
                if reply == b"BBIO1" {
                    self.discard_pending()?;
                    self.write(&[ENTER_I2C])?;
                    return match self.read_exact(4)?.as_slice() {
                        b"I2C1" => Ok(()),
                        _ => Err(TransportStatus::NotSupported),
                    };
                }
            }
        }
        Err(TransportStatus::DeviceNotFound)
    }

    /// Writes `bytes` in bulk, returns how many bytes were acknowledged before the first
    /// NACK, or all of them if `break_on_nack` is not set.
    fn bulk_write(&mut self, bytes: &[u8], break_on_nack: bool) -> Result<usize, TransportStatus> {
        let mut acknowledged = 0;
        for chunk in bytes.chunks(MAX_BULK_LENGTH) {
            self.command(BULK_WRITE | (chunk.len() as u8 - 1))?;
            self.write(chunk)?;
            let replies = self.read_exact(chunk.len())?;
            for reply in replies {
                if reply != 0x00 && break_on_nack {
                    return Ok(acknowledged);
                }
                acknowledged += 1;
            }
        }
        Ok(acknowledged)
    }
}

impl I2cTransport for BusPirate {
    type Handle = Handle;

    fn channel_count(&mut self) -> Result<u32, TransportStatus> {
        let ports = serialport::available_ports().map_err(|err| {
            log::warn!("Cannot list serial ports: {err}");
            TransportStatus::DeviceListNotReady
        })?;
        self.ports = ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                SerialPortType::UsbPort(usb) => Some(Port {
                    info: ChannelInfo {
                        serial_number: usb.serial_number.unwrap_or_default(),
                        description: usb.product.unwrap_or_default(),
                        location: port.port_name.clone(),
                    },
                    name: port.port_name,
                }),
                _ => None,
            })
            .collect();
        Ok(self.ports.len() as u32)
    }

    fn channel_info(&mut self, index: u32) -> Result<ChannelInfo, TransportStatus> {
        self.ports
            .get(index as usize)
            .map(|port| port.info.clone())
            .ok_or(TransportStatus::DeviceListNotReady)
    }

    fn open_channel(&mut self, index: u32) -> Result<Handle, TransportStatus> {
        let port = self
            .ports
            .get(index as usize)
            .ok_or(TransportStatus::DeviceNotFound)?;
        let serial = serialport::new(&port.name, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(self.timeout)
            .open()
            .map_err(|err| {
                log::warn!("Cannot open serial port '{}': {err}", port.name);
                TransportStatus::DeviceNotOpened
            })?;
        let mut handle = Handle { serial };
        handle.discard_pending()?;
        handle.enter_binary_i2c()?;
        Ok(handle)
    }

    fn init_channel(
        &mut self,
        handle: &mut Handle,
        config: &ChannelConfig,
    ) -> Result<(), TransportStatus> {
        handle.command(SET_SPEED | speed_code(config.clock_rate))?;
        let mut peripherals = CONFIGURE_PERIPHERALS | POWER_ON;
        if config.drive_only_zero {
            peripherals |= PULLUPS_ON;
        }
        handle.command(peripherals)
    }

    fn close_channel(&mut self, mut handle: Handle) -> Result<(), TransportStatus> {
        handle.write(&[RESET, EXIT_TO_TERMINAL])
    }

    fn device_write(
        &mut self,
        handle: &mut Handle,
        address: u8,
        data: &[u8],
        options: TransferOptions,
    ) -> Result<usize, TransportStatus> {
        if options.contains(TransferOptions::START_BIT) {
            handle.command(START_BIT)?;
        }
        let break_on_nack = options.contains(TransferOptions::BREAK_ON_NACK);
        let mut written = 0;
        if handle.bulk_write(&[address << 1], true)? == 1 {
            written = handle.bulk_write(data, break_on_nack)?;
        } else {
            log::debug!("device 0x{address:02X} did not acknowledge its write address");
        }
        if options.contains(TransferOptions::STOP_BIT) {
            handle.command(STOP_BIT)?;
        }
        Ok(written)
    }

    fn device_read(
        &mut self,
        handle: &mut Handle,
        address: u8,
        buffer: &mut [u8],
        options: TransferOptions,
    ) -> Result<usize, TransportStatus> {
        if options.contains(TransferOptions::START_BIT) {
            handle.command(START_BIT)?;
        }
        let mut read = 0;
        if handle.bulk_write(&[(address << 1) | 1], true)? == 1 {
            let last = buffer.len().saturating_sub(1);
            for (i, byte) in buffer.iter_mut().enumerate() {
                handle.write(&[READ_BYTE])?;
                *byte = handle.read_byte()?;
                read += 1;
                if i == last && options.contains(TransferOptions::NACK_LAST_BYTE) {
                    handle.command(NACK)?;
                } else {
                    handle.command(ACK)?;
                }
            }
        } else {
            log::debug!("device 0x{address:02X} did not acknowledge its read address");
        }
        if options.contains(TransferOptions::STOP_BIT) {
            handle.command(STOP_BIT)?;
        }
        Ok(read)
    }
}
