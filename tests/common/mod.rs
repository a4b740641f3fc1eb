#![allow(dead_code)]

pub mod ltc6804;
pub mod smart_battery;

use battmon_lib::bus::{
    ChannelConfig, ChannelInfo, I2cTransport, TransferOptions, TransportStatus,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A device attached to the scripted bus.
pub trait Device: Send {
    /// Returns the number of bytes the device acknowledged.
    fn write(&mut self, data: &[u8]) -> usize;

    /// Returns the bytes the device clocks out, at most `length` are used.
    fn read(&mut self, length: usize) -> Vec<u8>;
}

impl<D: Device> Device for Arc<Mutex<D>> {
    fn write(&mut self, data: &[u8]) -> usize {
        self.lock().unwrap().write(data)
    }

    fn read(&mut self, length: usize) -> Vec<u8> {
        self.lock().unwrap().read(length)
    }
}

/// Replies with fixed bytes and records what was written to it.
#[derive(Default)]
pub struct Echo {
    pub reply: Vec<u8>,
    pub written: Vec<Vec<u8>>,
}

impl Device for Echo {
    fn write(&mut self, data: &[u8]) -> usize {
        self.written.push(data.to_vec());
        data.len()
    }

    fn read(&mut self, _length: usize) -> Vec<u8> {
        self.reply.clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    ChannelCount,
    ChannelInfo(u32),
    Open(u32),
    Init(u32, ChannelConfig),
    Close(u32),
    Write {
        address: u8,
        data: Vec<u8>,
        options: TransferOptions,
    },
    Read {
        address: u8,
        length: usize,
        options: TransferOptions,
    },
}

#[derive(Default)]
pub struct MockState {
    pub channels: Vec<ChannelInfo>,
    pub devices: HashMap<u8, Box<dyn Device>>,
    pub calls: Vec<Call>,
    pub enumeration_fault: Option<TransportStatus>,
    pub init_fault: Option<TransportStatus>,
    pub close_fault: Option<TransportStatus>,
    /// Blocks `open_channel` this long before it returns.
    pub open_delay: Option<Duration>,
    /// Consumed by the next writes, one per write.
    pub write_faults: VecDeque<TransportStatus>,
    /// Consumed by the next reads, one per read.
    pub read_faults: VecDeque<TransportStatus>,
    /// Caps the bytes transferred by every write.
    pub write_limit: Option<usize>,
    /// Caps the bytes transferred by every read.
    pub read_limit: Option<usize>,
    pub open_handles: Vec<u32>,
}

impl MockState {
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Write { address, data, .. } => Some((*address, data.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn transfers(&self) -> Vec<&Call> {
        self.calls
            .iter()
            .filter(|call| matches!(call, Call::Write { .. } | Call::Read { .. }))
            .collect()
    }
}

/// In-memory transport driven by a shared, scriptable [`MockState`].
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

pub type SharedState = Arc<Mutex<MockState>>;

pub fn channel(serial_number: &str) -> ChannelInfo {
    ChannelInfo {
        serial_number: serial_number.to_string(),
        description: "mock adapter".to_string(),
        location: String::new(),
    }
}

impl MockTransport {
    pub fn new(channels: Vec<ChannelInfo>) -> (Self, SharedState) {
        let state = Arc::new(Mutex::new(MockState {
            channels,
            ..MockState::default()
        }));
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl I2cTransport for MockTransport {
    type Handle = u32;

    fn channel_count(&mut self) -> Result<u32, TransportStatus> {
        let mut state = self.state();
        state.calls.push(Call::ChannelCount);
        match state.enumeration_fault {
            Some(status) => Err(status),
            None => Ok(state.channels.len() as u32),
        }
    }

    fn channel_info(&mut self, index: u32) -> Result<ChannelInfo, TransportStatus> {
        let mut state = self.state();
        state.calls.push(Call::ChannelInfo(index));
        state
            .channels
            .get(index as usize)
            .cloned()
            .ok_or(TransportStatus::InvalidParameter)
    }

    fn open_channel(&mut self, index: u32) -> Result<u32, TransportStatus> {
        let delay = self.state().open_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut state = self.state();
        state.calls.push(Call::Open(index));
        state.open_handles.push(index);
        Ok(index)
    }

    fn init_channel(
        &mut self,
        handle: &mut u32,
        config: &ChannelConfig,
    ) -> Result<(), TransportStatus> {
        let mut state = self.state();
        state.calls.push(Call::Init(*handle, *config));
        match state.init_fault {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn close_channel(&mut self, handle: u32) -> Result<(), TransportStatus> {
        let mut state = self.state();
        state.calls.push(Call::Close(handle));
        state.open_handles.retain(|open| *open != handle);
        match state.close_fault {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn device_write(
        &mut self,
        _handle: &mut u32,
        address: u8,
        data: &[u8],
        options: TransferOptions,
    ) -> Result<usize, TransportStatus> {
        let mut state = self.state();
        state.calls.push(Call::Write {
            address,
            data: data.to_vec(),
            options,
        });
        if let Some(status) = state.write_faults.pop_front() {
            return Err(status);
        }
        let limit = state.write_limit.unwrap_or(usize::MAX);
        let acknowledged = match state.devices.get_mut(&address) {
            Some(device) => device.write(data),
            None => 0,
        };
        Ok(acknowledged.min(limit))
    }

    fn device_read(
        &mut self,
        _handle: &mut u32,
        address: u8,
        buffer: &mut [u8],
        options: TransferOptions,
    ) -> Result<usize, TransportStatus> {
        let mut state = self.state();
        state.calls.push(Call::Read {
            address,
            length: buffer.len(),
            options,
        });
        if let Some(status) = state.read_faults.pop_front() {
            return Err(status);
        }
        let limit = state.read_limit.unwrap_or(usize::MAX);
        let reply = match state.devices.get_mut(&address) {
            Some(device) => device.read(buffer.len()),
            None => Vec::new(),
        };
        let transferred = reply.len().min(buffer.len()).min(limit);
        buffer[..transferred].copy_from_slice(&reply[..transferred]);
        Ok(transferred)
    }
}
