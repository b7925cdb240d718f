//! labdev - operate the configured lab devices from the command line.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use lab_devices::config::{DeviceConfig, Settings};
use lab_devices::device::{share, Device};
use lab_devices::devices::{self, ElliptecBoard, Kdc101};
use lab_devices::poller::Poller;
use lab_devices::state::{DesiredState, StateMap, Value};
use lab_devices::units::parse_frequency;
use lab_devices::{logging, ProgramMode};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "labdev", version, about = "Smart-programming drivers for lab instruments")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/labdev.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List configured devices and their attributes
    List,
    /// Read every attribute of a device once
    Status {
        device: String,
        /// Print the front panel as JSON
        #[arg(long)]
        json: bool,
    },
    /// Program attributes, e.g. `program synth freq=400MHz gate=on`
    Program {
        device: String,
        /// `attribute=value` pairs; mounts also accept `deg`
        #[arg(required = true)]
        values: Vec<String>,
        /// Write every value even when the hardware is already there
        #[arg(long)]
        fresh: bool,
    },
    /// Poll a device and print front-panel changes until Ctrl-C
    Watch {
        device: String,
        /// Poll period (defaults to application.poll_interval)
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        interval: Option<Duration>,
    },
    /// Home a motor controller, or one Elliptec mount
    Home {
        device: String,
        /// Mount name (Elliptec boards only)
        child: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init(&settings.application)?;

    match cli.command {
        Commands::List => list(&settings),
        Commands::Status { device, json } => status(&settings, &device, json).await,
        Commands::Program { device, values, fresh } => program(&settings, &device, &values, fresh).await,
        Commands::Watch { device, interval } => {
            watch(&settings, &device, interval.unwrap_or(settings.application.poll_interval)).await
        }
        Commands::Home { device, child } => home(&settings, &device, child.as_deref()).await,
    }
}

fn device_config<'a>(settings: &'a Settings, name: &str) -> Result<&'a DeviceConfig> {
    let config = settings
        .device(name)
        .ok_or_else(|| anyhow!("no device named '{name}' in configuration"))?;
    if !config.connection().enabled {
        bail!("device '{name}' is disabled in configuration");
    }
    Ok(config)
}

async fn open(config: &DeviceConfig) -> Result<Box<dyn Device>> {
    let mut device = devices::build(config).await?;
    device
        .configure()
        .await
        .with_context(|| format!("configuring {}", config.name()))?;
    Ok(device)
}

fn list(settings: &Settings) -> Result<()> {
    for config in &settings.devices {
        let connection = config.connection();
        let link = if connection.mock { "mock" } else { connection.port.as_str() };
        let state = if connection.enabled { "" } else { " (disabled)" };
        println!("{} [{}] on {}{}", connection.name, config.kind(), link, state);
        match config {
            DeviceConfig::Elliptec(cfg) => {
                for child in &cfg.children {
                    println!("  {} @ {} ({}, serial {})", child.name, child.address, child.model, child.serial_number);
                }
            }
            DeviceConfig::Kdc101(cfg) => {
                println!("  position [mm], serial {}, homing {:?}", cfg.serial_number, cfg.homing);
            }
            DeviceConfig::Agilent83650b(cfg) => {
                let ramp = cfg.ramp.map_or("no ramp".to_string(), |r| {
                    format!("ramp {} Hz / {:?}", r.step_size, r.min_step_duration)
                });
                println!("  freq [Hz], amp [dBm], gate; GPIB {}, {}", cfg.gpib_address, ramp);
            }
        }
    }
    Ok(())
}

fn print_state(name: &str, values: &StateMap) {
    println!("{name}:");
    for (attribute, value) in values {
        println!("  {attribute} = {value}");
    }
}

async fn status(settings: &Settings, name: &str, json: bool) -> Result<()> {
    let config = device_config(settings, name)?;
    let mut device = open(config).await?;
    let snapshot = device.front_panel().snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_state(name, &snapshot.values);
    }
    device.shutdown().await?;
    Ok(())
}

/// Parse one `attribute=value` argument for `config`.
///
/// Plain numbers and `on`/`off` pass through. Frequencies may carry a unit
/// (`400MHz`); Elliptec mounts may be given in degrees (`45deg`).
fn parse_assignment(config: &DeviceConfig, text: &str) -> Result<(String, Value)> {
    let (attribute, raw) = text
        .split_once('=')
        .ok_or_else(|| anyhow!("expected attribute=value, got '{text}'"))?;
    let attribute = attribute.trim();
    let raw = raw.trim();

    if let Some(value) = Value::parse(raw) {
        return Ok((attribute.to_string(), value));
    }

    let value = match config {
        DeviceConfig::Elliptec(cfg) => {
            let degrees: f64 = raw
                .strip_suffix("deg")
                .and_then(|d| d.trim().parse().ok())
                .ok_or_else(|| anyhow!("cannot parse '{raw}' as counts or degrees"))?;
            let child = cfg
                .children
                .iter()
                .find(|c| c.name == attribute)
                .ok_or_else(|| anyhow!("no mount named '{attribute}'"))?;
            Value::Number(child.calibration.degrees_to_counts(degrees).round())
        }
        DeviceConfig::Agilent83650b(_) if attribute == devices::agilent::FREQUENCY => {
            Value::Number(parse_frequency(raw).ok_or_else(|| anyhow!("cannot parse '{raw}' as a frequency"))?)
        }
        _ => bail!("cannot parse '{raw}' for '{attribute}'"),
    };
    Ok((attribute.to_string(), value))
}

async fn program(settings: &Settings, name: &str, values: &[String], fresh: bool) -> Result<()> {
    let config = device_config(settings, name)?;
    let desired: DesiredState = values
        .iter()
        .map(|text| parse_assignment(config, text))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .collect();

    let mut device = open(config).await?;
    let mode = if fresh { ProgramMode::Fresh } else { ProgramMode::Smart };
    let report = device.reconcile(&desired, mode).await;
    device.shutdown().await?;
    let report = report?;

    if report.changed {
        info!(device = name, written = ?report.written, "Programmed");
    } else {
        info!(device = name, "Already in requested state; nothing written");
    }
    for mismatch in &report.mismatches {
        warn!(
            attribute = %mismatch.attribute,
            desired = %mismatch.desired,
            observed = %mismatch.observed,
            "Hardware did not reach requested value"
        );
    }
    print_state(name, &report.observed);
    Ok(())
}

async fn watch(settings: &Settings, name: &str, period: Duration) -> Result<()> {
    let config = device_config(settings, name)?;
    let device = open(config).await?;
    let mut updates = device.front_panel().subscribe();
    let device = share(device);
    let poller = Poller::spawn(device.clone(), period);

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                let read_at = snapshot.read_at.map(|t| t.to_rfc3339()).unwrap_or_default();
                let line = snapshot
                    .values
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                println!("{read_at} {line}");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, stopping");
                break;
            }
        }
    }

    let refreshes = poller.stop().await;
    info!(refreshes, "Polling stopped");
    device.lock().await.shutdown().await?;
    Ok(())
}

async fn home(settings: &Settings, name: &str, child: Option<&str>) -> Result<()> {
    let config = device_config(settings, name)?;
    let transport = devices::connect(config).await?;
    match (config, child) {
        (DeviceConfig::Kdc101(cfg), None) => {
            let mut stage = Kdc101::from_config(cfg, transport);
            stage.configure().await?;
            stage.home().await?;
            print_state(name, &stage.front_panel().snapshot().values);
            stage.shutdown().await?;
        }
        (DeviceConfig::Elliptec(cfg), Some(child)) => {
            let mut board = ElliptecBoard::from_config(cfg, transport)?;
            board.configure().await?;
            board.home(child).await?;
            print_state(name, &board.front_panel().snapshot().values);
            board.shutdown().await?;
        }
        (DeviceConfig::Elliptec(_), None) => bail!("name the mount to home"),
        _ => bail!("device '{name}' cannot be homed"),
    }
    Ok(())
}
