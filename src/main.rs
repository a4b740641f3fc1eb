use anyhow::{Context, Result};
use battmon_lib::battery::{BatteryElement, ElementSnapshot};
use battmon_lib::bus::buspirate::BusPirate;
use battmon_lib::bus::{BusConnection, Connection, I2cTransport};
use battmon_lib::smbus::SmartBatteryAdapter;
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic, sync::Arc};

mod commandline;
mod config;
mod monitor;

use commandline::{CliArgs, CliCommands, OutputFormat};
use config::MonitorConfig;

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .context("Cannot init logging")?
        .start()
        .context("Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

fn load_config(args: &CliArgs) -> Result<MonitorConfig> {
    let mut config = MonitorConfig::load(&args.config)?;
    if let Some(serial) = &args.serial {
        config.serial_number = serial.clone();
    }
    if let Some(channel) = args.channel {
        config.channel = channel;
    }
    if let Some(retries) = args.retries {
        config.retries = retries;
    }
    Ok(config)
}

fn list_ports(transport: &mut BusPirate) -> Result<()> {
    let count = transport
        .channel_count()
        .map_err(battmon_lib::Error::DeviceEnumeration)
        .context("Cannot list serial ports")?;
    if count == 0 {
        println!("No USB serial ports found");
    }
    for index in 0..count {
        let info = transport
            .channel_info(index)
            .map_err(battmon_lib::Error::DeviceEnumeration)?;
        println!(
            "{index}: serial number '{}', {} at {}",
            info.serial_number, info.description, info.location
        );
    }
    Ok(())
}

async fn connect(
    transport: BusPirate,
    config: &MonitorConfig,
) -> Result<Arc<Connection<BusPirate>>> {
    let connection = Connection::with_config(transport, config.channel_config());
    connection
        .connect(&config.serial_number, config.channel)
        .await
        .with_context(|| {
            format!(
                "Cannot connect to channel {} of adapter '{}'",
                config.channel, config.serial_number
            )
        })?;
    Ok(Arc::new(connection))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;

    let mut transport = BusPirate::new();
    transport.set_timeout(args.timeout);

    let (connection, result) = match args.command.clone() {
        CliCommands::Ports => return list_ports(&mut transport),
        CliCommands::Probe { address, cells } => {
            let config = match &args.serial {
                Some(serial) => {
                    MonitorConfig::for_adapter(serial.clone(), args.channel.unwrap_or_default())
                }
                None => load_config(&args)?,
            };
            let connection = connect(transport, &config).await?;
            let mut adapter = SmartBatteryAdapter::new(connection.clone(), address);
            adapter.set_pec(config.pec);
            let result: Result<()> = async {
                let pack = adapter
                    .recognize_battery(cells)
                    .await
                    .with_context(|| format!("No smart battery at 0x{address:02X}"))?;
                let report = adapter.read_actuals(&pack).await?;
                monitor::print(&pack, &report, OutputFormat::Console)
            }
            .await;
            (connection, result)
        }
        CliCommands::Read { format } => {
            let config = load_config(&args)?;
            let connection = connect(transport, &config).await?;
            let result: Result<()> = async {
                let monitor = monitor::Monitor::new(connection.clone(), &config).await?;
                let report = monitor.acquire().await;
                monitor::print(monitor.root(), &report, format)
            }
            .await;
            (connection, result)
        }
        CliCommands::Monitor { interval, format } => {
            let config = load_config(&args)?;
            let connection = connect(transport, &config).await?;
            let result: Result<()> = async {
                let monitor = monitor::Monitor::new(connection.clone(), &config).await?;
                debug!(
                    "Battery tree: {}",
                    serde_json::to_string(&ElementSnapshot::of(monitor.root().as_ref()))?
                );
                info!("Monitoring {:?}", monitor.root().product());
                monitor::run(monitor, interval, format).await
            }
            .await;
            (connection, result)
        }
    };

    if let Err(err) = connection.disconnect().await {
        warn!("Cannot disconnect: {err}");
    }
    result
}
