//! LTC6804-2 command framing and register decoding.
//!
//! Commands are sent in address mode: the first command byte carries the position of the chip
//! in the chain. Every command and every register group is protected by a PEC15.

use crate::{Error, Result};
use std::time::Duration;

const PEC15_POLYNOMIAL: u16 = 0x4599;
const PEC15_SEED: u16 = 0x0010;

const PEC15_TABLE: [u16; 256] = {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut remainder = (i as u16) << 7;
        let mut bit = 0;
        while bit < 8 {
            if remainder & 0x4000 != 0 {
                remainder = (remainder << 1) ^ PEC15_POLYNOMIAL;
            } else {
                remainder <<= 1;
            }
            bit += 1;
        }
        table[i] = remainder;
        i += 1;
    }
    table
};

/// Packet error code over `data`, already shifted into its transmitted form.
pub fn pec15(data: &[u8]) -> u16 {
    let mut remainder = PEC15_SEED;
    for byte in data {
        let index = ((remainder >> 7) ^ u16::from(*byte)) & 0xFF;
        remainder = (remainder << 8) ^ PEC15_TABLE[index as usize];
    }
    remainder << 1
}

/// Highest chain position addressable in address mode.
pub const MAX_CHAIN_INDEX: u8 = 15;

/// Size of a register group read back: six data bytes followed by the PEC.
pub const REGISTER_GROUP_SIZE: usize = 8;

/// Normal (7 kHz) ADC mode.
const MD_NORMAL: u16 = 0b10;

/// Conversion time of all cells in normal mode, with some margin.
pub const CONVERSION_DELAY: Duration = Duration::from_millis(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start cell voltage conversion of all cells, no discharge.
    Adcv,
    /// Start status group conversion (sum of cells, die temperature, supplies).
    Adstat,
    ReadCellVoltages(CellGroup),
    ReadStatusA,
}

impl Command {
    pub fn code(self) -> u16 {
        match self {
            Command::Adcv => 0x260 | (MD_NORMAL << 7),
            Command::Adstat => 0x468 | (MD_NORMAL << 7),
            Command::ReadCellVoltages(group) => group.read_command(),
            Command::ReadStatusA => 0x010,
        }
    }

    /// The four byte frame for the chip at `chain_index`.
    pub fn request(self, chain_index: u8) -> Result<[u8; 4]> {
        if chain_index > MAX_CHAIN_INDEX {
            return Err(Error::PreconditionViolation(format!(
                "chain index {chain_index} exceeds {MAX_CHAIN_INDEX}"
            )));
        }
        let code = self.code();
        let cmd0 = 0x80 | (chain_index << 3) | ((code >> 8) as u8 & 0x07);
        let cmd1 = (code & 0xFF) as u8;
        let pec = pec15(&[cmd0, cmd1]).to_be_bytes();
        Ok([cmd0, cmd1, pec[0], pec[1]])
    }
}

/// Cell voltage register groups, three cells each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellGroup {
    A,
    B,
    C,
    D,
}

impl CellGroup {
    pub const ALL: [CellGroup; 4] = [CellGroup::A, CellGroup::B, CellGroup::C, CellGroup::D];

    fn read_command(self) -> u16 {
        match self {
            CellGroup::A => 0x004,
            CellGroup::B => 0x006,
            CellGroup::C => 0x008,
            CellGroup::D => 0x00A,
        }
    }

    /// Channels measured by this group, 1 based.
    pub fn channels(self) -> [u8; 3] {
        let first = match self {
            CellGroup::A => 1,
            CellGroup::B => 4,
            CellGroup::C => 7,
            CellGroup::D => 10,
        };
        [first, first + 1, first + 2]
    }
}

fn validate_len(buffer: &[u8], reply_size: usize) -> Result<()> {
    if buffer.len() < reply_size {
        log::warn!(
            "Invalid buffer size - required={} received={}",
            reply_size,
            buffer.len()
        );
        return Err(Error::ReplySize {
            required: reply_size,
            received: buffer.len(),
        });
    }
    Ok(())
}

fn validate_pec(buffer: &[u8]) -> Result<()> {
    let calculated = pec15(&buffer[..6]);
    let received = u16::from_be_bytes([buffer[6], buffer[7]]);
    if calculated != received {
        log::warn!(
            "Invalid checksum - calculated={:04X?} received={:04X?} buffer={:02X?}",
            calculated,
            received,
            buffer
        );
        return Err(Error::Checksum {
            calculated,
            received,
        });
    }
    Ok(())
}

/// Checks size and PEC of a register group and returns its six data bytes.
fn register_group(rx_buffer: &[u8]) -> Result<&[u8]> {
    validate_len(rx_buffer, REGISTER_GROUP_SIZE)?;
    validate_pec(&rx_buffer[..REGISTER_GROUP_SIZE])?;
    Ok(&rx_buffer[..6])
}

/// Register value of a cell that was never converted.
const CLEARED: u16 = 0xFFFF;

/// Decodes the three cell voltages of a group in volts. Cells without a conversion result
/// are `None`.
pub fn decode_cell_voltages(rx_buffer: &[u8]) -> Result<[Option<f32>; 3]> {
    let data = register_group(rx_buffer)?;
    let mut voltages = [None; 3];
    for (i, voltage) in voltages.iter_mut().enumerate() {
        let raw = u16::from_le_bytes([data[2 * i], data[2 * i + 1]]);
        if raw != CLEARED {
            *voltage = Some(f32::from(raw) * 0.0001);
        }
    }
    Ok(voltages)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusA {
    /// Sum of all cells measured by the chip, in volts.
    pub sum_of_cells: f32,
    /// Die temperature in °C.
    pub internal_temperature: f32,
    /// Analog supply voltage in volts.
    pub analog_supply: f32,
}

impl StatusA {
    /// Fails with [`Error::InvalidReading`] if any status value was never converted.
    pub fn decode(rx_buffer: &[u8]) -> Result<Self> {
        let data = register_group(rx_buffer)?;
        let raw: [u16; 3] =
            std::array::from_fn(|i| u16::from_le_bytes([data[2 * i], data[2 * i + 1]]));
        if raw.contains(&CLEARED) {
            return Err(Error::InvalidReading(format!(
                "status group was not converted: {raw:04X?}"
            )));
        }
        let [sum_of_cells, internal_temperature, analog_supply] = raw.map(f32::from);
        Ok(Self {
            sum_of_cells: sum_of_cells * 0.0001 * 20.0,
            internal_temperature: internal_temperature * 0.0001 / 0.0075 - 273.0,
            analog_supply: analog_supply * 0.0001,
        })
    }
}
