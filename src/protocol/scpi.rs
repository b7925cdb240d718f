//! SCPI commands for the Agilent 83650B, sent through a Prologix GPIB-USB
//! converter.
//!
//! Lines starting with `++` configure the converter itself and never reach
//! the GPIB bus. Every other line is forwarded to the instrument selected
//! with `++addr`.

use crate::error::{DeviceError, Result};

/// Line terminator for both the converter and the instrument.
pub const TERMINATOR: &str = "\n";

/// Converter set-up: controller mode, no auto-read, LF termination, EOI on.
pub const PROLOGIX_SETUP: [&str; 4] = ["++mode 1", "++auto 0", "++eos 2", "++eoi 1"];

/// Ask the converter to read the instrument's reply until EOI.
pub const PROLOGIX_READ: &str = "++read eoi";

pub const FREQUENCY_QUERY: &str = ":FREQuency:CW?";
pub const POWER_QUERY: &str = ":POWer:LEVel?";
pub const OUTPUT_QUERY: &str = ":POWer:STATe?";

/// Select a GPIB primary address.
pub fn select_address(address: u8) -> Result<String> {
    if address > 30 {
        return Err(DeviceError::OutOfRange {
            attribute: "gpib_address".into(),
            value: address as f64,
            min: 0.0,
            max: 30.0,
        });
    }
    Ok(format!("++addr {address}"))
}

/// Set the CW frequency in Hz. The synthesizer resolves 1 Hz.
pub fn set_frequency(hz: f64) -> String {
    format!(":FREQuency:CW {:.0} Hz", hz)
}

/// Set the output level in dBm, two decimals.
pub fn set_power(dbm: f64) -> String {
    format!(":POWer:LEVel {:.2} dBm", dbm)
}

pub fn set_output(enabled: bool) -> String {
    format!(":POWer:STATe {}", if enabled { "ON" } else { "OFF" })
}

/// Parse a numeric reply such as `+1.00000000000E+010`.
pub fn parse_number(reply: &str) -> Result<f64> {
    let reply = reply.trim();
    reply
        .parse::<f64>()
        .map_err(|_| DeviceError::InvalidResponse(format!("Failed to parse numeric reply '{reply}'")))
}

/// Parse a boolean reply (`1`/`0`, `ON`/`OFF`).
pub fn parse_bool(reply: &str) -> Result<bool> {
    match reply.trim().to_ascii_uppercase().as_str() {
        "1" | "+1" | "ON" => Ok(true),
        "0" | "+0" | "OFF" => Ok(false),
        other => Err(DeviceError::InvalidResponse(format!("Failed to parse state reply '{other}'"))),
    }
}
