use super::SmBus;
use crate::acquisition::{request_with_retry, AcquisitionReport, DEFAULT_RETRIES};
use crate::battery::{BatteryElement, BatteryPack, SingleCell};
use crate::bus::AddressableBus;
use crate::reading::{keys, ReadingKey, ReadingStore, ReadingValue};
use crate::{Error, Result};
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Bus address of a smart battery.
pub const SMART_BATTERY_ADDRESS: u8 = 0x0B;

/// Series cells a smart battery reports voltages for.
pub const CELLS: RangeInclusive<usize> = 1..=4;

const TEMPERATURE: u8 = 0x08;
const VOLTAGE: u8 = 0x09;
const CURRENT: u8 = 0x0A;
const AVERAGE_CURRENT: u8 = 0x0B;
const RELATIVE_STATE_OF_CHARGE: u8 = 0x0D;
const ABSOLUTE_STATE_OF_CHARGE: u8 = 0x0E;
const REMAINING_CAPACITY: u8 = 0x0F;
const FULL_CHARGE_CAPACITY: u8 = 0x10;
const CYCLE_COUNT: u8 = 0x17;
const DESIGN_CAPACITY: u8 = 0x18;
const DESIGN_VOLTAGE: u8 = 0x19;
const MANUFACTURE_DATE: u8 = 0x1B;
const SERIAL_NUMBER: u8 = 0x1C;
const MANUFACTURER_NAME: u8 = 0x20;
const DEVICE_NAME: u8 = 0x21;
const DEVICE_CHEMISTRY: u8 = 0x22;
/// Cell 1 voltage; the following cells count downwards.
const CELL_VOLTAGE_1: u8 = 0x3F;

/// How a register word maps to a reading.
#[derive(Debug, Clone, Copy)]
enum Word {
    /// Unsigned, multiplied by the factor.
    Unsigned(f32),
    /// Two's complement, multiplied by the factor.
    Signed(f32),
    /// Tenths of a Kelvin, read as °C.
    DeciKelvin,
    Count,
}

struct Register {
    command: u8,
    key: ReadingKey,
    word: Word,
}

const fn register(command: u8, key: ReadingKey, word: Word) -> Register {
    Register { command, key, word }
}

static ACTUALS: [Register; 9] = [
    register(VOLTAGE, keys::VOLTAGE, Word::Unsigned(0.001)),
    register(CURRENT, keys::CURRENT, Word::Signed(0.001)),
    register(AVERAGE_CURRENT, keys::AVERAGE_CURRENT, Word::Signed(0.001)),
    register(TEMPERATURE, keys::TEMPERATURE, Word::DeciKelvin),
    register(RELATIVE_STATE_OF_CHARGE, keys::RELATIVE_STATE_OF_CHARGE, Word::Unsigned(1.0)),
    register(ABSOLUTE_STATE_OF_CHARGE, keys::ABSOLUTE_STATE_OF_CHARGE, Word::Unsigned(1.0)),
    register(REMAINING_CAPACITY, keys::REMAINING_CAPACITY, Word::Unsigned(0.001)),
    register(FULL_CHARGE_CAPACITY, keys::FULL_CHARGE_CAPACITY, Word::Unsigned(0.001)),
    register(CYCLE_COUNT, keys::CYCLE_COUNT, Word::Count),
];

static DESIGN: [Register; 2] = [
    register(DESIGN_CAPACITY, keys::DESIGN_CAPACITY, Word::Unsigned(0.001)),
    register(DESIGN_VOLTAGE, keys::DESIGN_VOLTAGE, Word::Unsigned(0.001)),
];

/// Decodes the packed manufacture date into `YYYY-MM-DD`.
fn manufacture_date(raw: u16) -> String {
    let day = raw & 0x1F;
    let month = (raw >> 5) & 0x0F;
    let year = 1980 + (raw >> 9);
    format!("{year:04}-{month:02}-{day:02}")
}

fn text(block: &[u8]) -> String {
    String::from_utf8_lossy(block)
        .trim_end_matches('\0')
        .trim()
        .to_owned()
}

/// Reads a battery implementing the Smart Battery Data Specification.
///
/// The battery is a pack of series cells; pack level readings live on the pack, cell
/// voltages on its children.
#[derive(Debug)]
pub struct SmartBatteryAdapter<B> {
    smbus: SmBus<B>,
    retries: u8,
}

impl<B: AddressableBus> SmartBatteryAdapter<B> {
    pub fn new(bus: B, address: u8) -> Self {
        Self {
            smbus: SmBus::new(bus, address),
            retries: DEFAULT_RETRIES,
        }
    }

    pub fn set_retry(&mut self, retries: u8) {
        self.retries = retries;
    }

    pub fn set_pec(&mut self, pec: bool) {
        self.smbus.set_pec(pec);
    }

    async fn read_register(&self, register: &Register) -> Result<ReadingValue> {
        let command = register.command;
        Ok(match register.word {
            Word::Unsigned(factor) => {
                let raw = request_with_retry!(self.retries, self.smbus.read_word(command))?;
                ReadingValue::Float(f32::from(raw) * factor)
            }
            Word::Signed(factor) => {
                let raw =
                    request_with_retry!(self.retries, self.smbus.read_signed_word(command))?;
                ReadingValue::Float(f32::from(raw) * factor)
            }
            Word::DeciKelvin => {
                let raw = request_with_retry!(self.retries, self.smbus.read_word(command))?;
                ReadingValue::Float(f32::from(raw) / 10.0 - 273.15)
            }
            Word::Count => {
                let raw = request_with_retry!(self.retries, self.smbus.read_word(command))?;
                ReadingValue::Integer(raw.into())
            }
        })
    }

    async fn read_text(&self, command: u8) -> Result<ReadingValue> {
        let block = request_with_retry!(self.retries, self.smbus.read_block(command))?;
        Ok(ReadingValue::Text(text(&block)))
    }

    /// Identifies the battery and builds its pack of `cells` series cells.
    ///
    /// Fails if the battery does not answer, so this doubles as presence detection.
    pub async fn recognize_battery(&self, cells: usize) -> Result<Arc<BatteryPack>> {
        if !CELLS.contains(&cells) {
            return Err(Error::PreconditionViolation(format!(
                "a smart battery reports {CELLS:?} cells, got {cells}"
            )));
        }
        let pack = BatteryPack::new(
            (0..cells)
                .map(|_| Arc::new(SingleCell::new()) as Arc<dyn BatteryElement>)
                .collect(),
        )?;
        let store = pack.readings();
        for register in ACTUALS.iter().chain(&DESIGN) {
            store.create_slot(register.key.clone())?;
        }
        for key in keys::PRODUCT_KEYS {
            store.create_slot(key)?;
        }
        pack.create_sum_value(keys::SUM_OF_CELL_VOLTAGES, keys::VOLTAGE)?;

        store.set(&keys::MANUFACTURER, self.read_text(MANUFACTURER_NAME).await?)?;
        store.set(&keys::PRODUCT, self.read_text(DEVICE_NAME).await?)?;
        store.set(&keys::CHEMISTRY, self.read_text(DEVICE_CHEMISTRY).await?)?;
        let serial_number =
            request_with_retry!(self.retries, self.smbus.read_word(SERIAL_NUMBER))?;
        store.set(&keys::SERIAL_NUMBER, serial_number.to_string().into())?;
        let date = request_with_retry!(self.retries, self.smbus.read_word(MANUFACTURE_DATE))?;
        store.set(&keys::MANUFACTURE_DATE, manufacture_date(date).into())?;
        for register in &DESIGN {
            store.set(&register.key, self.read_register(register).await?)?;
        }

        log::info!(
            "Recognized smart battery at 0x{:02X}: {:?}",
            self.smbus.address(),
            pack.product()
        );
        Ok(Arc::new(pack))
    }

    async fn read_into(
        &self,
        report: &mut AcquisitionReport,
        target: String,
        store: &ReadingStore,
        register: &Register,
    ) -> Result<()> {
        match self.read_register(register).await {
            Ok(value) => report.record(target, store, &register.key, value),
            Err(err) => {
                report.skip(format!("{target} {}", register.key), err);
                Ok(())
            }
        }
    }

    /// Reads the live values of a pack built by [`Self::recognize_battery`].
    pub async fn read_actuals(&self, pack: &BatteryPack) -> Result<AcquisitionReport> {
        let cells = pack.sub_elements();
        if cells.len() > *CELLS.end() {
            return Err(Error::PreconditionViolation(format!(
                "pack has {} cells, a smart battery reports at most {}",
                cells.len(),
                CELLS.end()
            )));
        }

        let mut report = AcquisitionReport::default();
        let target = format!("battery 0x{:02X}", self.smbus.address());
        for register in &ACTUALS {
            self.read_into(&mut report, target.clone(), pack.readings(), register)
                .await?;
        }

        for (index, cell) in cells.iter().enumerate() {
            let cell_register = register(
                CELL_VOLTAGE_1 - index as u8,
                keys::VOLTAGE,
                Word::Unsigned(0.001),
            );
            self.read_into(
                &mut report,
                format!("{target} cell {}", index + 1),
                cell.readings(),
                &cell_register,
            )
            .await?;
        }
        Ok(report)
    }
}
