//! Device drivers and the factory that builds them from configuration.
//!
//! `mock = true` in a device's configuration wires the driver to the matching
//! simulator from [`crate::sim`]; otherwise a serial port is opened, retrying
//! while the adapter is not available.

pub mod agilent;
pub mod elliptec;
pub mod kdc101;

pub use agilent::Agilent83650B;
pub use elliptec::ElliptecBoard;
pub use kdc101::Kdc101;

use crate::config::{ConnectionConfig, DeviceConfig};
use crate::device::Device;
use crate::error::{DeviceError, Result};
use crate::protocol::elliptec::Address;
use crate::sim::{AgilentSimHandle, ElliptecSimHandle, Kdc101SimHandle};
use crate::transport::Transport;
use tracing::info;

/// Elliptec interface board line rate.
pub const ELLIPTEC_BAUD_RATE: u32 = 9_600;
/// Prologix GPIB-USB line rate (ignored by the converter's virtual COM port).
pub const PROLOGIX_BAUD_RATE: u32 = 115_200;

/// Build the driver for one configured device. The returned driver is not
/// configured yet.
pub async fn build(config: &DeviceConfig) -> Result<Box<dyn Device>> {
    let transport = connect(config).await?;
    let device: Box<dyn Device> = match config {
        DeviceConfig::Elliptec(cfg) => Box::new(ElliptecBoard::from_config(cfg, transport)?),
        DeviceConfig::Kdc101(cfg) => Box::new(Kdc101::from_config(cfg, transport)),
        DeviceConfig::Agilent83650b(cfg) => Box::new(Agilent83650B::from_config(cfg, transport)),
    };
    Ok(device)
}

/// Open the link for one configured device: a fresh simulator in mock mode,
/// otherwise the serial port at the family's default baud rate.
pub async fn connect(config: &DeviceConfig) -> Result<Box<dyn Transport>> {
    let connection = config.connection();
    info!(device = %connection.name, kind = config.kind(), mock = connection.mock, "Creating device");

    if connection.mock {
        let transport: Box<dyn Transport> = match config {
            DeviceConfig::Elliptec(cfg) => {
                let sim = ElliptecSimHandle::new();
                for child in &cfg.children {
                    sim.add_mount(Address::parse(&child.address)?.value(), child.serial_number.clone());
                }
                Box::new(sim.connect())
            }
            DeviceConfig::Kdc101(cfg) => {
                let serial_number = cfg.serial_number.trim().parse().map_err(|_| {
                    DeviceError::InvalidResponse(format!(
                        "KDC101 serial number '{}' is not numeric",
                        cfg.serial_number
                    ))
                })?;
                Box::new(Kdc101SimHandle::new(serial_number).connect())
            }
            DeviceConfig::Agilent83650b(cfg) => Box::new(AgilentSimHandle::new(cfg.gpib_address).connect()),
        };
        return Ok(transport);
    }

    let default_baud_rate = match config {
        DeviceConfig::Elliptec(_) => ELLIPTEC_BAUD_RATE,
        DeviceConfig::Kdc101(_) => kdc101::BAUD_RATE,
        DeviceConfig::Agilent83650b(_) => PROLOGIX_BAUD_RATE,
    };
    open(connection, default_baud_rate).await
}

#[cfg(feature = "serial")]
async fn open(connection: &ConnectionConfig, default_baud_rate: u32) -> Result<Box<dyn Transport>> {
    use crate::transport::{RetryPolicy, SerialSettings, SerialTransport};

    let settings = SerialSettings::new(&connection.port, connection.baud_rate.unwrap_or(default_baud_rate))
        .with_timeout(connection.timeout);
    let policy = RetryPolicy {
        max_attempts: connection.connect_attempts,
        ..RetryPolicy::default()
    };
    let transport = SerialTransport::open_with_retry(settings, &policy).await?;
    Ok(Box::new(transport))
}

#[cfg(not(feature = "serial"))]
async fn open(_connection: &ConnectionConfig, _default_baud_rate: u32) -> Result<Box<dyn Transport>> {
    Err(crate::error::DeviceError::FeatureNotEnabled("serial".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::state::Value;

    const MOCK_CONFIG: &str = r#"
[[devices]]
type = "elliptec"
name = "waveplates"
mock = true

[[devices.children]]
name = "hwp"
address = "2"
serial_number = "11400101"

[[devices]]
type = "kdc101"
name = "stage"
mock = true
serial_number = "27000001"
homing = "auto"

[[devices]]
type = "agilent83650b"
name = "synth"
mock = true
gpib_address = 19
"#;

    #[tokio::test]
    async fn test_build_mock_devices() {
        let settings = Settings::from_toml(MOCK_CONFIG).unwrap();
        for config in &settings.devices {
            let mut device = build(config).await.unwrap();
            assert_eq!(device.name(), config.name());
            device.configure().await.unwrap();
            assert_eq!(device.front_panel().snapshot().values.len(), device.attributes().len());
        }
    }

    #[tokio::test]
    async fn test_mock_synth_starts_at_one_gigahertz() {
        let settings = Settings::from_toml(MOCK_CONFIG).unwrap();
        let config = settings.device("synth").unwrap();
        let mut synth = build(config).await.unwrap();
        let observed = synth.refresh().await.unwrap();
        assert_eq!(observed.get(agilent::FREQUENCY), Some(&Value::Number(1e9)));
    }
}
