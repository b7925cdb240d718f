//! Thorlabs Elliptec ASCII protocol
//!
//! Reference: ELLx modules protocol manual Issue 7-6
//!
//! Protocol Overview:
//! - Format: [Address][Command][Data (optional)] (ASCII encoded)
//! - Address: 0-9, A-F, one per device on the interface board's bus
//! - Replies: [Address][COMMAND][Data]\r\n, command in upper case
//! - Encoding: positions as 32-bit two's complement integers, 8 hex digits
//! - Timing: half-duplex request-response
//!
//! Commands used here: `in` (info), `gs` (status), `gp` (position),
//! `ma` (move absolute), `mr` (move relative), `ho` (home).

use crate::error::{DeviceError, Result};
use std::fmt;

/// Encoder counts per full turn of an ELL14.
pub const ELL14_COUNTS_PER_TURN: i64 = 143_360;

/// Bus address of one device on an interface board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u8);

impl Address {
    pub fn new(address: u8) -> Result<Self> {
        if address > 0xF {
            return Err(DeviceError::InvalidResponse(format!(
                "Elliptec address {address} outside 0-F"
            )));
        }
        Ok(Self(address))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// Parse a single hex digit ("0".."F", case-insensitive).
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.len() != 1 {
            return Err(DeviceError::InvalidResponse(format!(
                "Elliptec address must be one hex digit, got '{text}'"
            )));
        }
        let value = u8::from_str_radix(text, 16)
            .map_err(|_| DeviceError::InvalidResponse(format!("invalid Elliptec address '{text}'")))?;
        Self::new(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

/// Build an addressed command, e.g. `0gp`.
pub fn command(address: Address, instruction: &str) -> String {
    format!("{}{}", address, instruction)
}

/// Encode a position in encoder counts as 8 upper-case hex digits.
///
/// Negative values use 32-bit two's complement. Fractional counts round to
/// the nearest count.
pub fn encode_position(counts: f64) -> Result<String> {
    let rounded = counts.round();
    if !rounded.is_finite() || rounded < i32::MIN as f64 || rounded > i32::MAX as f64 {
        return Err(DeviceError::OutOfRange {
            attribute: "position".into(),
            value: counts,
            min: i32::MIN as f64,
            max: i32::MAX as f64,
        });
    }
    Ok(format!("{:08X}", rounded as i32 as u32))
}

/// Decode a two's complement hex position. The width is 4 bits per digit, so
/// short replies such as `F` decode as -1.
pub fn decode_position(hex: &str) -> Result<i64> {
    let hex = hex.trim();
    if hex.is_empty() {
        return Ok(0);
    }
    if hex.len() > 16 {
        return Err(DeviceError::InvalidResponse(format!("position too long: '{hex}'")));
    }
    let raw = u64::from_str_radix(hex, 16)
        .map_err(|e| DeviceError::InvalidResponse(format!("failed to parse position hex '{hex}': {e}")))?;
    let bits = 4 * hex.len() as u32;
    if bits == 64 {
        return Ok(raw as i64);
    }
    let wrap = 1u64 << (bits - 1);
    Ok(if raw >= wrap {
        raw as i64 - (1i64 << bits)
    } else {
        raw as i64
    })
}

/// Parsed reply: `[address][CODE][data]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub address: Address,
    pub code: String,
    pub data: String,
}

impl Reply {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.len() < 3 || !line.is_ascii() {
            return Err(DeviceError::InvalidResponse(format!("Response too short: '{line}'")));
        }
        Ok(Self {
            address: Address::parse(&line[..1])?,
            code: line[1..3].to_string(),
            data: line[3..].to_string(),
        })
    }

    /// Raise a device error when this is a `GS` reply with a non-zero code.
    pub fn check_status(&self) -> Result<()> {
        if self.code != "GS" {
            return Ok(());
        }
        match Status::from_hex(&self.data)? {
            Status::Ok => Ok(()),
            status => Err(status.into_error(self.address)),
        }
    }

    /// Position carried by a `PO` reply.
    pub fn position(&self) -> Result<i64> {
        self.check_status()?;
        if self.code != "PO" {
            return Err(DeviceError::InvalidResponse(format!(
                "expected position reply, got {}{}",
                self.code, self.data
            )));
        }
        decode_position(&self.data)
    }
}

/// Device status codes reported through `GS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error(u8),
}

impl Status {
    pub fn from_hex(data: &str) -> Result<Self> {
        let data = data.trim();
        if data.is_empty() {
            return Ok(Status::Ok);
        }
        let code = u8::from_str_radix(data, 16)
            .map_err(|_| DeviceError::InvalidResponse(format!("invalid status code '{data}'")))?;
        Ok(if code == 0 { Status::Ok } else { Status::Error(code) })
    }

    pub fn message(&self) -> &'static str {
        match self {
            Status::Ok => "No error.",
            Status::Error(code) => match code {
                1 => "Communication time out.",
                2 => "Mechanical time out.",
                3 => "Command error or not supported.",
                4 => "Value out of range.",
                5 => "Module isolated.",
                6 => "Module out of isolation.",
                7 => "Initializing error.",
                8 => "Thermal error.",
                9 => "Busy.",
                10 => "Sensor Error (May appear during self test. If code persists there is an error).",
                11 => "Motor Error (May appear during self test. If code persists there is an error).",
                12 => "Out of Range (e.g. stage has been instructed to move beyond its travel range).",
                13 => "Over Current error.",
                _ => "Undefined Error.",
            },
        }
    }

    fn into_error(self, address: Address) -> DeviceError {
        DeviceError::DeviceReported {
            address: address.to_string(),
            code: match self {
                Status::Ok => 0,
                Status::Error(code) => code,
            },
            message: self.message().to_string(),
        }
    }
}

/// Decoded `IN` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// ELL model number, e.g. 14 (0x0E) for an ELL14.
    pub model: u8,
    pub serial_number: String,
    pub year: String,
    pub firmware: String,
    /// Travel in mm or degrees.
    pub travel: u32,
    /// Encoder counts per mm or per full travel.
    pub pulses_per_unit: u32,
}

impl DeviceInfo {
    /// Layout after `IN`: type(2) serial(8) year(4) fw(2) hw(2) travel(4) pulses(8).
    pub fn parse(reply: &Reply) -> Result<Self> {
        reply.check_status()?;
        let data = reply.data.as_str();
        if reply.code != "IN" || data.len() < 30 {
            return Err(DeviceError::InvalidResponse(format!(
                "invalid info reply: {}{}{}",
                reply.address, reply.code, data
            )));
        }
        let hex = |range: std::ops::Range<usize>| {
            u32::from_str_radix(&data[range.clone()], 16).map_err(|_| {
                DeviceError::InvalidResponse(format!("invalid hex field '{}' in info reply", &data[range]))
            })
        };
        Ok(Self {
            model: hex(0..2)? as u8,
            serial_number: data[2..10].to_string(),
            year: data[10..14].to_string(),
            firmware: data[14..16].to_string(),
            travel: hex(18..22)?,
            pulses_per_unit: hex(22..30)?,
        })
    }
}
