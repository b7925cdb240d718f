//! Unit conversions between operator units and hardware base units.
//!
//! Drivers speak base units (encoder counts, Hz, dBm). These helpers convert
//! for the CLI and for configuration files written in degrees, mm or MHz.

use crate::protocol::elliptec::ELL14_COUNTS_PER_TURN;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Linear ELL14 calibration: `degrees = slope * counts + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ell14Calibration {
    /// Degrees per encoder count.
    pub slope: f64,
    /// Degrees at zero counts.
    pub offset: f64,
}

impl Default for Ell14Calibration {
    fn default() -> Self {
        Self {
            slope: 360.0 / ELL14_COUNTS_PER_TURN as f64,
            offset: 0.0,
        }
    }
}

impl Ell14Calibration {
    /// Degrees are first wrapped into `[0, 360)`.
    pub fn degrees_to_counts(&self, degrees: f64) -> f64 {
        (degrees.rem_euclid(360.0) - self.offset) / self.slope
    }

    pub fn counts_to_degrees(&self, counts: f64) -> f64 {
        self.slope * counts + self.offset
    }
}

/// Z812 actuator on a KDC101: encoder counts per mm.
pub const Z812_COUNTS_PER_MM: f64 = 34_554.96;

/// Travel range of the Z812 in mm.
pub const Z812_TRAVEL_MM: (f64, f64) = (0.0, 12.0);

pub fn z812_mm_to_counts(mm: f64) -> i32 {
    (mm * Z812_COUNTS_PER_MM).round() as i32
}

pub fn z812_counts_to_mm(counts: i32) -> f64 {
    counts as f64 / Z812_COUNTS_PER_MM
}

/// Frequency units accepted by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyUnit {
    Hz,
    KHz,
    MHz,
    GHz,
}

impl FrequencyUnit {
    pub fn factor(&self) -> f64 {
        match self {
            FrequencyUnit::Hz => 1.0,
            FrequencyUnit::KHz => 1e3,
            FrequencyUnit::MHz => 1e6,
            FrequencyUnit::GHz => 1e9,
        }
    }

    pub fn to_hz(&self, value: f64) -> f64 {
        value * self.factor()
    }

    pub fn from_hz(&self, hz: f64) -> f64 {
        hz / self.factor()
    }
}

impl FromStr for FrequencyUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hz" => Ok(FrequencyUnit::Hz),
            "khz" => Ok(FrequencyUnit::KHz),
            "mhz" => Ok(FrequencyUnit::MHz),
            "ghz" => Ok(FrequencyUnit::GHz),
            other => Err(format!("unknown frequency unit '{other}'")),
        }
    }
}

impl fmt::Display for FrequencyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrequencyUnit::Hz => "Hz",
            FrequencyUnit::KHz => "kHz",
            FrequencyUnit::MHz => "MHz",
            FrequencyUnit::GHz => "GHz",
        };
        f.write_str(name)
    }
}

/// Parse `"450 MHz"`, `"1.2GHz"` or a bare number of Hz.
pub fn parse_frequency(text: &str) -> Option<f64> {
    let lower = text.trim().to_ascii_lowercase();
    for unit in [FrequencyUnit::GHz, FrequencyUnit::MHz, FrequencyUnit::KHz, FrequencyUnit::Hz] {
        let suffix = unit.to_string().to_ascii_lowercase();
        if let Some(number) = lower.strip_suffix(suffix.as_str()) {
            return number.trim().parse::<f64>().ok().map(|v| unit.to_hz(v));
        }
    }
    lower.parse().ok()
}
