use super::Device;
use battmon_lib::ltc6804::protocol::pec15;
use std::collections::BTreeMap;

const ADCV: u16 = 0x360;
const ADSTAT: u16 = 0x568;
const RDSTATA: u16 = 0x010;

/// Register contents of one simulated chip, raw 100 µV counts.
#[derive(Debug, Clone, Default)]
pub struct SimChip {
    pub cells: [u16; 12],
    pub sum_of_cells: u16,
    pub internal_temperature: u16,
    pub analog_supply: u16,
    converted: bool,
    status_converted: bool,
}

impl SimChip {
    pub fn with_cells(cells: [u16; 12]) -> Self {
        Self {
            cells,
            // 1 V * 20 = 20 V
            sum_of_cells: 10_000,
            // 15 °C
            internal_temperature: 21_600,
            analog_supply: 50_000,
            ..Self::default()
        }
    }
}

/// A daisy chain of LTC6804 chips in address mode behind one bus address.
#[derive(Default)]
pub struct Ltc6804Chain {
    pub chips: BTreeMap<u8, SimChip>,
    /// Decoded commands as (chain index, command code).
    pub commands: Vec<(u8, u16)>,
    /// Corrupts the PEC of this many reads.
    pub corrupt_reads: usize,
    /// Corrupts the PEC of every read of this command.
    pub always_corrupt: Option<u16>,
    /// Commands the chain does not acknowledge.
    pub nacked: Vec<u16>,
    pending: Option<(u16, [u16; 3])>,
}

impl Ltc6804Chain {
    pub fn new(chips: impl IntoIterator<Item = (u8, SimChip)>) -> Self {
        Self {
            chips: chips.into_iter().collect(),
            ..Self::default()
        }
    }
}

impl Device for Ltc6804Chain {
    fn write(&mut self, data: &[u8]) -> usize {
        self.pending = None;
        let [cmd0, cmd1, pec0, pec1] = data else {
            return data.len();
        };
        if pec15(&[*cmd0, *cmd1]) != u16::from_be_bytes([*pec0, *pec1]) || cmd0 & 0x80 == 0 {
            return data.len();
        }
        let chain_index = (cmd0 >> 3) & 0x0F;
        let code = (u16::from(cmd0 & 0x07) << 8) | u16::from(*cmd1);
        self.commands.push((chain_index, code));
        if self.nacked.contains(&code) {
            return 0;
        }
        let Some(chip) = self.chips.get_mut(&chain_index) else {
            return data.len();
        };
        match code {
            ADCV => chip.converted = true,
            ADSTAT => chip.status_converted = true,
            0x004 | 0x006 | 0x008 | 0x00A => {
                let first = usize::from(code - 0x004) / 2 * 3;
                let mut values = [0xFFFF; 3];
                if chip.converted {
                    values.copy_from_slice(&chip.cells[first..first + 3]);
                }
                self.pending = Some((code, values));
            }
            RDSTATA => {
                let values = if chip.status_converted {
                    [
                        chip.sum_of_cells,
                        chip.internal_temperature,
                        chip.analog_supply,
                    ]
                } else {
                    [0xFFFF; 3]
                };
                self.pending = Some((code, values));
            }
            _ => {}
        }
        data.len()
    }

    fn read(&mut self, _length: usize) -> Vec<u8> {
        let Some((code, values)) = self.pending.take() else {
            return Vec::new();
        };
        let mut reply: Vec<u8> = values.iter().flat_map(|value| value.to_le_bytes()).collect();
        let mut pec = pec15(&reply);
        if self.always_corrupt == Some(code) || self.corrupt_reads > 0 {
            self.corrupt_reads = self.corrupt_reads.saturating_sub(1);
            pec ^= 0x0002;
        }
        reply.extend_from_slice(&pec.to_be_bytes());
        reply
    }
}
