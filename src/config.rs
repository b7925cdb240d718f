//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/labdev.toml` by default)
//! 2. Environment variables (prefixed with `LABDEV_`)
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! LABDEV_APPLICATION__LOG_LEVEL=debug
//! LABDEV_APPLICATION__LOG_FORMAT=json
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! log_level = "info"
//!
//! [[devices]]
//! type = "agilent83650b"
//! name = "synth"
//! port = "/dev/ttyUSB0"
//! gpib_address = 19
//! ```

use crate::homing::HomingPolicy;
use crate::protocol::elliptec::Address;
use crate::ramp::RampConfig;
use crate::units::Ell14Calibration;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    Load(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationSettings,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Period of the front-panel refresh in `watch`.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            poll_interval: default_poll_interval(),
        }
    }
}

/// One configured device, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceConfig {
    Elliptec(ElliptecConfig),
    Kdc101(Kdc101Config),
    #[serde(rename = "agilent83650b")]
    Agilent83650b(Agilent83650bConfig),
}

impl DeviceConfig {
    pub fn connection(&self) -> &ConnectionConfig {
        match self {
            DeviceConfig::Elliptec(c) => &c.connection,
            DeviceConfig::Kdc101(c) => &c.connection,
            DeviceConfig::Agilent83650b(c) => &c.connection,
        }
    }

    pub fn name(&self) -> &str {
        &self.connection().name
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DeviceConfig::Elliptec(_) => "elliptec",
            DeviceConfig::Kdc101(_) => "kdc101",
            DeviceConfig::Agilent83650b(_) => "agilent83650b",
        }
    }
}

/// Settings shared by every device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Unique device name
    pub name: String,
    /// Serial port (e.g., "/dev/ttyUSB0", "COM3"); unused in mock mode
    #[serde(default)]
    pub port: String,
    /// Defaults to the device family's rate
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// Longest wait for a single reply
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Talk to a simulated device instead of hardware
    #[serde(default)]
    pub mock: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Wait after the last write before the confirmation read
    #[serde(default, with = "humantime_serde")]
    pub settle_time: Option<Duration>,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
}

/// Elliptec interface board
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElliptecConfig {
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub children: Vec<ElliptecChildConfig>,
}

/// One mount on an Elliptec bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElliptecChildConfig {
    pub name: String,
    /// Bus address, one hex digit
    pub address: String,
    pub serial_number: String,
    #[serde(default = "default_elliptec_model")]
    pub model: String,
    #[serde(default)]
    pub home_on_startup: bool,
    #[serde(default)]
    pub calibration: Ell14Calibration,
}

/// KDC101 with a Z812 actuator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kdc101Config {
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    pub serial_number: String,
    #[serde(default)]
    pub homing: HomingPolicy,
    /// Position tolerance in mm
    #[serde(default = "default_kdc101_tolerance")]
    pub tolerance: f64,
    /// Longest wait for a move or homing to complete
    #[serde(default = "default_move_timeout", with = "humantime_serde")]
    pub move_timeout: Duration,
}

/// Agilent 83650B behind a Prologix converter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agilent83650bConfig {
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    pub gpib_address: u8,
    /// Step the frequency instead of jumping
    #[serde(default)]
    pub ramp: Option<RampConfig>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_enabled() -> bool {
    true
}

fn default_connect_attempts() -> u32 {
    10
}

fn default_elliptec_model() -> String {
    "ELL14".to_string()
}

fn default_kdc101_tolerance() -> f64 {
    0.0005
}

fn default_move_timeout() -> Duration {
    Duration::from_secs(60)
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load `config/labdev.toml` plus `LABDEV_` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/labdev.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables take precedence over the file. The result is
    /// validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABDEV_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let settings: Self = Figment::new().merge(Toml::string(text)).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name() == name)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Device names are unique
    /// - Real (non-mock) devices have a port
    /// - Elliptec addresses are single hex digits, unique per board
    /// - GPIB addresses are 0-30
    /// - Ramp steps and tolerances are positive
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.application.poll_interval.is_zero() {
            return Err(ConfigError::Validation("poll_interval must be non-zero".into()));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate device name: '{}'",
                    device.name()
                )));
            }
            self.validate_device(device)?;
        }

        Ok(())
    }

    fn validate_device(&self, device: &DeviceConfig) -> Result<(), ConfigError> {
        let connection = device.connection();
        if connection.name.trim().is_empty() {
            return Err(ConfigError::Validation("Device name cannot be empty".into()));
        }
        if !connection.mock && connection.port.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "Device '{}': 'port' is required unless mock = true",
                connection.name
            )));
        }

        match device {
            DeviceConfig::Elliptec(config) => {
                let mut addresses = HashSet::new();
                for child in &config.children {
                    let address = Address::parse(&child.address).map_err(|_| {
                        ConfigError::Validation(format!(
                            "Device '{}': child '{}' has invalid address '{}'. Must be 0-9 or A-F",
                            connection.name, child.name, child.address
                        ))
                    })?;
                    if !addresses.insert(address) {
                        return Err(ConfigError::Validation(format!(
                            "Device '{}': address {} used twice",
                            connection.name, address
                        )));
                    }
                    if child.serial_number.trim().is_empty() {
                        return Err(ConfigError::Validation(format!(
                            "Device '{}': child '{}' needs a serial_number",
                            connection.name, child.name
                        )));
                    }
                    if child.calibration.slope == 0.0 {
                        return Err(ConfigError::Validation(format!(
                            "Device '{}': child '{}' has a zero calibration slope",
                            connection.name, child.name
                        )));
                    }
                }
            }
            DeviceConfig::Kdc101(config) => {
                if config.serial_number.trim().is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "Device '{}': 'serial_number' cannot be empty",
                        connection.name
                    )));
                }
                if config.serial_number.trim().parse::<u32>().is_err() {
                    return Err(ConfigError::Validation(format!(
                        "Device '{}': KDC101 serial_number '{}' must be numeric",
                        connection.name, config.serial_number
                    )));
                }
                if config.tolerance.is_nan() || config.tolerance <= 0.0 {
                    return Err(ConfigError::Validation(format!(
                        "Device '{}': tolerance must be positive",
                        connection.name
                    )));
                }
            }
            DeviceConfig::Agilent83650b(config) => {
                if config.gpib_address > 30 {
                    return Err(ConfigError::Validation(format!(
                        "Device '{}': gpib_address {} outside 0-30",
                        connection.name, config.gpib_address
                    )));
                }
                if let Some(ramp) = &config.ramp {
                    if ramp.step_size.is_nan() || ramp.step_size <= 0.0 {
                        return Err(ConfigError::Validation(format!(
                            "Device '{}': ramp step_size must be positive",
                            connection.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const EXAMPLE: &str = r#"
[application]
log_level = "debug"
log_format = "json"
poll_interval = "250ms"

[[devices]]
type = "elliptec"
name = "waveplates"
port = "/dev/ttyUSB0"

[[devices.children]]
name = "hwp"
address = "0"
serial_number = "11400101"
home_on_startup = true

[[devices.children]]
name = "qwp"
address = "A"
serial_number = "11400102"

[[devices]]
type = "kdc101"
name = "stage"
mock = true
serial_number = "27000001"
homing = "auto"

[[devices]]
type = "agilent83650b"
name = "synth"
port = "/dev/ttyUSB1"
gpib_address = 19
settle_time = "50ms"

[devices.ramp]
step_size = 10e6
min_step_duration = "10ms"
"#;

    #[test]
    fn test_parse_example() {
        let settings = Settings::from_toml(EXAMPLE).unwrap();
        assert_eq!(settings.application.log_format, LogFormat::Json);
        assert_eq!(settings.application.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.devices.len(), 3);

        let DeviceConfig::Elliptec(board) = &settings.devices[0] else {
            panic!("expected elliptec");
        };
        assert_eq!(board.children.len(), 2);
        assert_eq!(board.children[0].model, "ELL14");
        assert!(board.children[0].home_on_startup);
        assert!(!board.children[1].home_on_startup);

        let DeviceConfig::Kdc101(stage) = settings.device("stage").unwrap() else {
            panic!("expected kdc101");
        };
        assert_eq!(stage.homing, HomingPolicy::Auto);
        assert_eq!(stage.tolerance, 0.0005);
        assert_eq!(stage.move_timeout, Duration::from_secs(60));

        let DeviceConfig::Agilent83650b(synth) = settings.device("synth").unwrap() else {
            panic!("expected agilent83650b");
        };
        assert_eq!(synth.connection.settle_time, Some(Duration::from_millis(50)));
        let ramp = synth.ramp.as_ref().unwrap();
        assert_eq!(ramp.step_size, 10e6);
        assert_eq!(ramp.min_step_duration, Duration::from_millis(10));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(EXAMPLE.as_bytes()).unwrap();
        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.devices[2].kind(), "agilent83650b");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let settings = Settings::load_from("/nonexistent/labdev.toml").unwrap();
        assert_eq!(settings.application.log_level, "info");
        assert!(settings.devices.is_empty());
    }

    #[test]
    fn test_invalid_log_level() {
        let err = Settings::from_toml("[application]\nlog_level = \"loud\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let text = r#"
[[devices]]
type = "kdc101"
name = "stage"
mock = true
serial_number = "1"

[[devices]]
type = "kdc101"
name = "stage"
mock = true
serial_number = "2"
"#;
        let err = Settings::from_toml(text).unwrap_err();
        assert!(err.to_string().contains("Duplicate device name"));
    }

    #[test]
    fn test_bad_elliptec_address_rejected() {
        let text = r#"
[[devices]]
type = "elliptec"
name = "board"
mock = true

[[devices.children]]
name = "m"
address = "G"
serial_number = "11400101"
"#;
        assert!(matches!(Settings::from_toml(text), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_non_numeric_kdc101_serial_rejected() {
        let text = r#"
[[devices]]
type = "kdc101"
name = "stage"
mock = true
serial_number = "KDC-27000001"
"#;
        let err = Settings::from_toml(text).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("must be numeric"));
    }

    #[test]
    fn test_port_required_for_hardware() {
        let text = "[[devices]]\ntype = \"agilent83650b\"\nname = \"synth\"\ngpib_address = 19\n";
        let err = Settings::from_toml(text).unwrap_err();
        assert!(err.to_string().contains("port"));
    }
}
