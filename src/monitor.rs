use crate::commandline::OutputFormat;
use crate::config::{BatteryConfig, MonitorConfig};
use anyhow::{Context, Result};
use battmon_lib::acquisition::{AcquisitionFailure, AcquisitionReport};
use battmon_lib::battery::{BatteryElement, BatteryPack, ElementSnapshot};
use battmon_lib::bus::AddressableBus;
use battmon_lib::ltc6804::{ChipPack, Ltc6804Adapter};
use battmon_lib::reading::keys;
use battmon_lib::smbus::SmartBatteryAdapter;
use log::{error, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

enum Battery<B> {
    Smart {
        adapter: SmartBatteryAdapter<B>,
        pack: Arc<BatteryPack>,
    },
    Ltc6804 {
        adapter: Ltc6804Adapter<B>,
        chips: Vec<Arc<ChipPack>>,
    },
}

impl<B: AddressableBus> Battery<B> {
    /// Reads into `report`. An LTC6804 chip that aborts is listed as a failure and the
    /// following chips are still read.
    async fn read_actuals(&self, report: &mut AcquisitionReport) -> battmon_lib::Result<()> {
        match self {
            Battery::Smart { adapter, pack } => report.merge(adapter.read_actuals(pack).await?),
            Battery::Ltc6804 { adapter, chips } => {
                for chip in chips {
                    match adapter.read_actuals(chip).await {
                        Ok(chip_report) => report.merge(chip_report),
                        Err(error) => {
                            error!("Reading chip {} failed: {error}", chip.chain_index());
                            report.failures.push(AcquisitionFailure {
                                target: format!("chip {}", chip.chain_index()),
                                error,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// The configured batteries below one root pack.
pub struct Monitor<B> {
    root: Arc<BatteryPack>,
    batteries: Vec<Battery<B>>,
}

impl<B: AddressableBus + Clone> Monitor<B> {
    /// Builds the battery tree. Smart batteries are recognized on the bus right away.
    pub async fn new(bus: B, config: &MonitorConfig) -> Result<Self> {
        let mut elements: Vec<Arc<dyn BatteryElement>> = Vec::new();
        let mut batteries = Vec::new();
        for battery in &config.batteries {
            match battery {
                BatteryConfig::Smbus { address, cells } => {
                    let mut adapter = SmartBatteryAdapter::new(bus.clone(), *address);
                    adapter.set_retry(config.retries);
                    adapter.set_pec(config.pec);
                    let pack = adapter.recognize_battery(*cells).await.with_context(|| {
                        format!("Cannot recognize smart battery at 0x{address:02X}")
                    })?;
                    elements.push(pack.clone());
                    batteries.push(Battery::Smart { adapter, pack });
                }
                BatteryConfig::Ltc6804 { address, chips } => {
                    let mut adapter = Ltc6804Adapter::new(bus.clone(), *address);
                    adapter.set_retry(config.retries);
                    adapter.set_conversion_delay(config.conversion_delay);
                    let chips = chips
                        .iter()
                        .map(|chip| {
                            ChipPack::with_channels(chip.chain_index, chip.channels.iter().copied())
                                .map(Arc::new)
                                .with_context(|| {
                                    format!("Invalid layout of chip {}", chip.chain_index)
                                })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    let pack = BatteryPack::new(
                        chips
                            .iter()
                            .map(|chip| chip.clone() as Arc<dyn BatteryElement>)
                            .collect(),
                    )
                    .with_context(|| format!("LTC6804 chain at 0x{address:02X} has no chips"))?;
                    pack.create_sum_value(keys::VOLTAGE, keys::VOLTAGE)?;
                    pack.create_sum_value(keys::SUM_OF_CELL_VOLTAGES, keys::SUM_OF_CELL_VOLTAGES)?;
                    elements.push(Arc::new(pack));
                    batteries.push(Battery::Ltc6804 { adapter, chips });
                }
            }
        }
        let root = BatteryPack::new(elements).context("No batteries configured")?;
        info!("Monitoring {} cells", root.cell_count());
        Ok(Self {
            root: Arc::new(root),
            batteries,
        })
    }

    pub fn root(&self) -> &Arc<BatteryPack> {
        &self.root
    }

    /// Reads every battery. A battery that aborts is reported as a failure, the others are
    /// still read.
    pub async fn acquire(&self) -> AcquisitionReport {
        let mut report = AcquisitionReport::default();
        for (index, battery) in self.batteries.iter().enumerate() {
            if let Err(error) = battery.read_actuals(&mut report).await {
                error!("Reading battery {index} failed: {error}");
                report.failures.push(AcquisitionFailure {
                    target: format!("battery {index}"),
                    error,
                });
            }
        }
        report
    }
}

fn print_console(element: &dyn BatteryElement, depth: usize) {
    let indent = "  ".repeat(depth);
    let product = element.product();
    match &product.product {
        Some(name) => println!("{indent}{name} ({} cells)", product.cell_count),
        None if element.sub_elements().is_empty() => println!("{indent}Cell"),
        None => println!("{indent}Pack ({} cells)", product.cell_count),
    }
    for (key, value) in element.readings().snapshot() {
        println!("{indent}  {key}: {value}");
    }
    for child in element.sub_elements() {
        print_console(child.as_ref(), depth + 1);
    }
}

pub fn print(root: &BatteryPack, report: &AcquisitionReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Console => {
            println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
            print_console(root, 0);
            for failure in &report.failures {
                println!("Skipped {}: {}", failure.target, failure.error);
            }
            println!("--------------------------");
        }
        OutputFormat::Json => {
            let failures: Vec<_> = report
                .failures
                .iter()
                .map(|failure| json!({ "target": failure.target, "error": failure.error.to_string() }))
                .collect();
            let document = json!({
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "batteries": ElementSnapshot::of(root),
                "failures": failures,
            });
            println!(
                "{}",
                serde_json::to_string(&document).context("Cannot serialize readings")?
            );
        }
    }
    Ok(())
}

pub async fn run<B: AddressableBus + Clone>(
    monitor: Monitor<B>,
    interval: Duration,
    format: OutputFormat,
) -> Result<()> {
    info!("Starting monitor mode: interval={interval:?}, format={format:?}");

    let mut changes = monitor.root().watch();
    tokio::spawn(async move {
        while let Some(change) = changes.recv().await {
            log::debug!("{} = {}", change.key, change.value);
        }
    });

    loop {
        let report = monitor.acquire().await;
        if !report.is_complete() {
            warn!(
                "Acquisition incomplete: {} readings updated, {} targets skipped",
                report.updated.len(),
                report.failures.len()
            );
        }
        print(monitor.root(), &report, format)?;
        tokio::time::sleep(interval).await;
    }
}
