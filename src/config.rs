use anyhow::{bail, Context, Result};
use battmon_lib::acquisition::DEFAULT_RETRIES;
use battmon_lib::bus::ChannelConfig;
use battmon_lib::ltc6804::protocol::CONVERSION_DELAY;
use battmon_lib::smbus::SMART_BATTERY_ADDRESS;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeSet;
use std::time::Duration;

fn humantime_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

/// Batteries to monitor and the bus they are attached to.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    /// Serial number of the bus adapter.
    #[serde(default)]
    pub serial_number: String,
    /// Zero based index among the channels with that serial number.
    #[serde(default)]
    pub channel: usize,
    #[serde(default = "MonitorConfig::default_clock_rate")]
    pub clock_rate: u32,
    #[serde(default = "MonitorConfig::default_drive_only_zero")]
    pub drive_only_zero: bool,
    #[serde(default = "MonitorConfig::default_retries")]
    pub retries: u8,
    #[serde(
        default = "MonitorConfig::default_conversion_delay",
        deserialize_with = "humantime_duration"
    )]
    pub conversion_delay: Duration,
    /// Packet error checking for SMBus devices.
    #[serde(default)]
    pub pec: bool,
    pub batteries: Vec<BatteryConfig>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatteryConfig {
    /// A smart battery.
    Smbus {
        #[serde(default = "BatteryConfig::default_smbus_address")]
        address: u8,
        #[serde(default = "BatteryConfig::default_cells")]
        cells: usize,
    },
    /// A daisy chain of LTC6804 chips.
    Ltc6804 { address: u8, chips: Vec<ChipConfig> },
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ChipConfig {
    pub chain_index: u8,
    /// Populated cell channels, 1 to 12.
    pub channels: Vec<u8>,
}

impl BatteryConfig {
    fn default_smbus_address() -> u8 {
        SMART_BATTERY_ADDRESS
    }

    fn default_cells() -> usize {
        1
    }
}

impl MonitorConfig {
    pub const DEFAULT_CONFIG_FILE: &str = "battmon.yaml";

    fn default_clock_rate() -> u32 {
        ChannelConfig::DEFAULT_CLOCK_RATE
    }

    fn default_drive_only_zero() -> bool {
        true
    }

    fn default_retries() -> u8 {
        DEFAULT_RETRIES
    }

    fn default_conversion_delay() -> Duration {
        CONVERSION_DELAY
    }

    /// Default bus settings for the given adapter, without batteries.
    pub fn for_adapter(serial_number: String, channel: usize) -> Self {
        Self {
            serial_number,
            channel,
            clock_rate: Self::default_clock_rate(),
            drive_only_zero: Self::default_drive_only_zero(),
            retries: Self::default_retries(),
            conversion_delay: Self::default_conversion_delay(),
            pec: false,
            batteries: Vec::new(),
        }
    }

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read config from file: {config_file_path:?}"))?;
        config
            .validate()
            .with_context(|| format!("Invalid config in file: {config_file_path:?}"))?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for battery in &self.batteries {
            let BatteryConfig::Ltc6804 { address, chips } = battery else {
                continue;
            };
            for chip in chips {
                let mut seen = BTreeSet::new();
                if let Some(channel) = chip.channels.iter().find(|channel| !seen.insert(**channel))
                {
                    bail!(
                        "Channel {channel} listed twice for chip {} of the LTC6804 chain at 0x{address:02X}",
                        chip.chain_index
                    );
                }
            }
        }
        Ok(())
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            clock_rate: self.clock_rate,
            drive_only_zero: self.drive_only_zero,
            ..ChannelConfig::default()
        }
    }
}
