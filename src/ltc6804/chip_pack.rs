use super::protocol::MAX_CHAIN_INDEX;
use crate::battery::{BatteryElement, BatteryPack, ProductDefinition, SingleCell};
use crate::notify::Notifier;
use crate::reading::{keys, ReadingStore};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Cell inputs of one LTC6804.
pub const CHANNELS: RangeInclusive<u8> = 1..=12;

/// The cells measured by a single LTC6804 in a daisy chain.
///
/// Children are ordered by channel. The pack carries the chip measured sum of its cells in
/// `Voltage`, the sum of the individual cell readings in `SumOfCellVoltages` and the die
/// temperature in `Temperature`.
pub struct ChipPack {
    pack: BatteryPack,
    chain_index: u8,
    cells: BTreeMap<u8, Arc<SingleCell>>,
}

fn check_channel(channel: u8) -> Result<()> {
    if CHANNELS.contains(&channel) {
        Ok(())
    } else {
        Err(Error::InvalidChannel(channel))
    }
}

impl ChipPack {
    pub fn new(chain_index: u8, cells: BTreeMap<u8, Arc<SingleCell>>) -> Result<Self> {
        if chain_index > MAX_CHAIN_INDEX {
            return Err(Error::PreconditionViolation(format!(
                "chain index {chain_index} exceeds {MAX_CHAIN_INDEX}"
            )));
        }
        for channel in cells.keys() {
            check_channel(*channel)?;
        }
        let pack = BatteryPack::new(
            cells
                .values()
                .map(|cell| cell.clone() as Arc<dyn BatteryElement>)
                .collect(),
        )?;
        pack.readings().create_slot(keys::VOLTAGE)?;
        pack.create_sum_value(keys::SUM_OF_CELL_VOLTAGES, keys::VOLTAGE)?;
        pack.readings().create_slot(keys::TEMPERATURE)?;
        Ok(Self {
            pack,
            chain_index,
            cells,
        })
    }

    /// Builds a chip pack with a fresh cell on every listed channel.
    pub fn with_channels(chain_index: u8, channels: impl IntoIterator<Item = u8>) -> Result<Self> {
        let cells = channels
            .into_iter()
            .map(|channel| (channel, Arc::new(SingleCell::new())))
            .collect();
        Self::new(chain_index, cells)
    }

    pub fn chain_index(&self) -> u8 {
        self.chain_index
    }

    /// Populated channels in ascending order.
    pub fn connected_channels(&self) -> impl Iterator<Item = u8> + '_ {
        self.cells.keys().copied()
    }

    pub fn is_channel_connected(&self, channel: u8) -> Result<bool> {
        check_channel(channel)?;
        Ok(self.cells.contains_key(&channel))
    }

    pub fn get_cell(&self, channel: u8) -> Result<Arc<SingleCell>> {
        check_channel(channel)?;
        self.cells
            .get(&channel)
            .cloned()
            .ok_or(Error::ChannelNotConnected(channel))
    }
}

impl BatteryElement for ChipPack {
    fn readings(&self) -> &ReadingStore {
        self.pack.readings()
    }

    fn notifier(&self) -> &Arc<Notifier> {
        self.pack.notifier()
    }

    fn product(&self) -> ProductDefinition {
        self.pack.product()
    }

    fn sub_elements(&self) -> Vec<Arc<dyn BatteryElement>> {
        self.pack.sub_elements()
    }
}

impl fmt::Debug for ChipPack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChipPack")
            .field("chain_index", &self.chain_index)
            .field("channels", &self.cells.keys().collect::<Vec<_>>())
            .field("pack", &self.pack)
            .finish()
    }
}
