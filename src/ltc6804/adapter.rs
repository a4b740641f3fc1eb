use super::chip_pack::ChipPack;
use super::protocol::{self, CellGroup, Command, StatusA, REGISTER_GROUP_SIZE};
use crate::acquisition::{request_with_retry, AcquisitionReport, DEFAULT_RETRIES};
use crate::battery::BatteryElement;
use crate::bus::AddressableBus;
use crate::reading::{keys, ReadingValue};
use crate::{Error, Result};
use std::time::Duration;

/// Reads LTC6804 chips sharing one bus address, each chip selected by its chain index.
#[derive(Debug)]
pub struct Ltc6804Adapter<B> {
    bus: B,
    address: u8,
    retries: u8,
    conversion_delay: Duration,
}

impl<B: AddressableBus> Ltc6804Adapter<B> {
    pub fn new(bus: B, address: u8) -> Self {
        Self {
            bus,
            address,
            retries: DEFAULT_RETRIES,
            conversion_delay: protocol::CONVERSION_DELAY,
        }
    }

    pub fn set_retry(&mut self, retries: u8) {
        self.retries = retries;
    }

    /// Time between starting a conversion and reading its results.
    pub fn set_conversion_delay(&mut self, delay: Duration) {
        self.conversion_delay = delay;
    }

    async fn start_conversion(&self, chain_index: u8, command: Command) -> Result<()> {
        let frame = command.request(chain_index)?;
        log::trace!("chip {chain_index}: {command:?}");
        self.bus.send(self.address, &frame).await
    }

    async fn read_register_group(&self, chain_index: u8, command: Command) -> Result<Vec<u8>> {
        let frame = command.request(chain_index)?;
        self.bus
            .transceive(self.address, &frame, REGISTER_GROUP_SIZE)
            .await
    }

    async fn read_cell_group(
        &self,
        chain_index: u8,
        group: CellGroup,
    ) -> Result<[Option<f32>; 3]> {
        let reply = self
            .read_register_group(chain_index, Command::ReadCellVoltages(group))
            .await?;
        protocol::decode_cell_voltages(&reply)
    }

    async fn read_status_a(&self, chain_index: u8) -> Result<StatusA> {
        let reply = self
            .read_register_group(chain_index, Command::ReadStatusA)
            .await?;
        StatusA::decode(&reply)
    }

    /// Converts all cells of `chip` and writes each connected cell's voltage.
    ///
    /// Groups that cannot be read are skipped and reported; only a failure to start the
    /// conversion aborts the acquisition.
    pub async fn read_cell_voltages(&self, chip: &ChipPack) -> Result<AcquisitionReport> {
        let chain_index = chip.chain_index();
        request_with_retry!(self.retries, self.start_conversion(chain_index, Command::Adcv))?;
        tokio::time::sleep(self.conversion_delay).await;

        let mut report = AcquisitionReport::default();
        for group in CellGroup::ALL {
            let channels = group.channels();
            let connected: Vec<u8> = channels
                .iter()
                .copied()
                .filter(|channel| chip.is_channel_connected(*channel).unwrap_or(false))
                .collect();
            if connected.is_empty() {
                continue;
            }

            let voltages =
                match request_with_retry!(self.retries, self.read_cell_group(chain_index, group)) {
                    Ok(voltages) => voltages,
                    Err(err) => {
                        report.skip(format!("chip {chain_index} cell group {group:?}"), err);
                        continue;
                    }
                };
            for (channel, voltage) in channels.into_iter().zip(voltages) {
                if !connected.contains(&channel) {
                    continue;
                }
                let target = format!("chip {chain_index} cell {channel}");
                match voltage {
                    Some(voltage) => {
                        let cell = chip.get_cell(channel)?;
                        report.record(
                            target,
                            cell.readings(),
                            &keys::VOLTAGE,
                            ReadingValue::Float(voltage),
                        )?;
                    }
                    None => report.skip(
                        target,
                        Error::InvalidReading(format!("channel {channel} was not converted")),
                    ),
                }
            }
        }
        Ok(report)
    }

    /// Converts the status group of `chip` and writes the chip measured sum of cells and the
    /// die temperature into the chip's own readings.
    pub async fn read_status(&self, chip: &ChipPack) -> Result<AcquisitionReport> {
        let chain_index = chip.chain_index();
        request_with_retry!(self.retries, self.start_conversion(chain_index, Command::Adstat))?;
        tokio::time::sleep(self.conversion_delay).await;

        let mut report = AcquisitionReport::default();
        let target = format!("chip {chain_index}");
        match request_with_retry!(self.retries, self.read_status_a(chain_index)) {
            Ok(status) => {
                log::debug!("chip {chain_index} status: {status:?}");
                report.record(
                    target.as_str(),
                    chip.readings(),
                    &keys::VOLTAGE,
                    ReadingValue::Float(status.sum_of_cells),
                )?;
                report.record(
                    target,
                    chip.readings(),
                    &keys::TEMPERATURE,
                    ReadingValue::Float(status.internal_temperature),
                )?;
            }
            Err(err) => report.skip(target, err),
        }
        Ok(report)
    }

    /// Cell voltages followed by the status group. Once the cell voltages were read, a
    /// failing status conversion is reported as a skipped target.
    pub async fn read_actuals(&self, chip: &ChipPack) -> Result<AcquisitionReport> {
        let mut report = self.read_cell_voltages(chip).await?;
        match self.read_status(chip).await {
            Ok(status) => report.merge(status),
            Err(err) => report.skip(format!("chip {} status", chip.chain_index()), err),
        }
        Ok(report)
    }
}
