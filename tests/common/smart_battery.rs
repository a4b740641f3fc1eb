use super::Device;
use battmon_lib::smbus::crc8;
use std::collections::HashMap;

/// A smart battery answering word and block reads from its register map.
pub struct SmartBattery {
    pub address: u8,
    pub words: HashMap<u8, u16>,
    pub blocks: HashMap<u8, Vec<u8>>,
    pub pec: bool,
    /// Sends a wrong PEC for this many reads.
    pub corrupt_reads: usize,
    /// Word writes, without the command byte.
    pub written: Vec<(u8, Vec<u8>)>,
    command: Option<u8>,
}

impl SmartBattery {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            words: HashMap::new(),
            blocks: HashMap::new(),
            pec: false,
            corrupt_reads: 0,
            written: Vec::new(),
            command: None,
        }
    }

    /// A 3 cell battery discharging at 1.5 A.
    pub fn charged(address: u8) -> Self {
        let mut battery = Self::new(address);
        battery.words.extend([
            (0x08, 2981),                   // 24.95 °C
            (0x09, 11_850),                 // mV
            (0x0A, (-1500i16) as u16),      // mA
            (0x0B, (-1400i16) as u16),      // mA
            (0x0D, 87),                     // %
            (0x0E, 80),                     // %
            (0x0F, 4_350),                  // mAh
            (0x10, 5_000),                  // mAh
            (0x17, 42),
            (0x18, 5_200),                  // mAh
            (0x19, 11_100),                 // mV
            (0x1B, 21 + 3 * 32 + 36 * 512), // 2016-03-21
            (0x1C, 1234),
            (0x3F, 3_950),
            (0x3E, 3_900),
            (0x3D, 4_000),
        ]);
        battery.blocks.extend([
            (0x20, b"ACME".to_vec()),
            (0x21, b"PowerPack 3S".to_vec()),
            (0x22, b"LION".to_vec()),
        ]);
        battery
    }
}

impl Device for SmartBattery {
    fn write(&mut self, data: &[u8]) -> usize {
        self.command = data.first().copied();
        if let [command, payload @ ..] = data {
            if !payload.is_empty() {
                self.written.push((*command, payload.to_vec()));
            }
        }
        data.len()
    }

    fn read(&mut self, _length: usize) -> Vec<u8> {
        let Some(command) = self.command.take() else {
            return Vec::new();
        };
        let mut reply = if let Some(word) = self.words.get(&command) {
            word.to_le_bytes().to_vec()
        } else if let Some(block) = self.blocks.get(&command) {
            let mut reply = vec![block.len() as u8];
            reply.extend_from_slice(block);
            reply
        } else {
            return Vec::new();
        };
        if self.pec {
            let mut message = vec![self.address << 1, command, (self.address << 1) | 1];
            message.extend_from_slice(&reply);
            let mut pec = crc8(&message);
            if self.corrupt_reads > 0 {
                self.corrupt_reads -= 1;
                pec ^= 0xFF;
            }
            reply.push(pec);
        }
        reply
    }
}
