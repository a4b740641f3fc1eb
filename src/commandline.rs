use crate::config::MonitorConfig;
use battmon_lib::smbus::SMART_BATTERY_ADDRESS;
use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    /// Human readable tree of readings
    Console,
    /// One JSON document per acquisition
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// List the serial ports a bus adapter may be attached to
    Ports,
    /// Identify a smart battery and print its readings once
    Probe {
        /// Bus address of the battery (e.g., 0x0B or 11)
        #[arg(long, value_parser = maybe_hex::<u8>, default_value_t = SMART_BATTERY_ADDRESS)]
        address: u8,
        /// Number of series cells
        #[arg(long, default_value_t = 1)]
        cells: usize,
    },
    /// Read all configured batteries once and print their readings
    Read {
        #[arg(long, value_enum, default_value_t = OutputFormat::Console)]
        format: OutputFormat,
    },
    /// Periodically read all configured batteries
    Monitor {
        /// Interval between acquisitions (e.g., "10s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "10s")]
        interval: Duration,
        #[arg(long, value_enum, default_value_t = OutputFormat::Console)]
        format: OutputFormat,
    },
}

const fn about_text() -> &'static str {
    "battery pack monitoring command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// The monitoring configuration file
    #[arg(short, long, default_value_t = MonitorConfig::DEFAULT_CONFIG_FILE.to_string())]
    pub config: String,

    /// Serial number of the bus adapter, overrides the configuration file
    #[arg(short, long)]
    pub serial: Option<String>,

    /// Channel index among the adapters with that serial number, overrides the configuration file
    #[arg(long)]
    pub channel: Option<usize>,

    /// Timeout for serial I/O operations (e.g., "100ms", "1s", "2s 500ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "100ms")]
    pub timeout: Duration,

    /// Number of retries for failed bus transactions
    #[arg(long)]
    pub retries: Option<u8>,
}
