//! Custom error types for the device drivers.
//!
//! This module defines the primary error type, `DeviceError`, shared by every
//! transport, protocol codec and driver in the crate. Using the `thiserror`
//! crate, it provides a consistent way to surface failures to whoever drives
//! the devices (the CLI, a poller, or an embedding experiment controller).
//!
//! ## Error Hierarchy
//!
//! - **`Transport`** / **`Timeout`** / **`Io`**: the underlying read/write
//!   round-trip failed. Never retried by the reconciler; the caller decides
//!   whether to abort the run.
//! - **`NotHomed`**: a motor controller configured for manual-only homing has
//!   not been homed since power-up. No motion is attempted.
//! - **`IdentityMismatch`**: the device answering at a bus address is not the
//!   configured one. No write is issued.
//! - **`DeviceReported`**: the device itself reported an error code.
//! - **`RampAborted`** / **`RampInterrupted`**: a stepped transition stopped
//!   part way; the last value reached is carried along.
//! - Validation variants (`UnknownAttribute`, `OutOfRange`, `TypeMismatch`)
//!   are raised before any hardware I/O takes place.

use thiserror::Error;

/// Convenience alias for results using the device error type.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Every failure a transport, codec or driver can report.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Operating system I/O failure, e.g. opening a serial port.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A read or write on the link failed.
    #[error("Transport error on {transport}: {message}")]
    Transport {
        /// Description of the link.
        transport: String,
        /// What went wrong.
        message: String,
    },

    /// No reply arrived in time.
    #[error("Timed out after {elapsed_ms} ms waiting for {operation}")]
    Timeout {
        /// What was being waited for.
        operation: String,
        /// How long the wait lasted.
        elapsed_ms: u64,
    },

    /// A reply could not be decoded.
    #[error("Invalid response from device: {0}")]
    InvalidResponse(String),

    /// Motion refused on an unhomed controller with manual homing.
    #[error("Device '{device}' is not homed and homing policy is manual")]
    NotHomed {
        /// Configured device name.
        device: String,
    },

    /// The device at an address is not the configured one.
    #[error(
        "Identity mismatch at address {address}: expected serial '{expected}', device reports '{actual}'"
    )]
    IdentityMismatch {
        /// Bus address or identity key that was checked.
        address: String,
        /// Configured serial number.
        expected: String,
        /// Serial number the device reported.
        actual: String,
    },

    /// The device answered with an error status.
    #[error("Device at address {address} reported error {code}: {message}")]
    DeviceReported {
        /// Address of the reporting device.
        address: String,
        /// Raw status code.
        code: u8,
        /// Human-readable meaning of `code`.
        message: String,
    },

    /// The attribute is not declared by the device.
    #[error("Unknown attribute '{0}'")]
    UnknownAttribute(String),

    /// A desired number lies outside the attribute's limits.
    #[error("Value {value} for '{attribute}' outside limits [{min}, {max}]")]
    OutOfRange {
        /// Attribute name.
        attribute: String,
        /// Rejected value.
        value: f64,
        /// Lower limit.
        min: f64,
        /// Upper limit.
        max: f64,
    },

    /// A desired value has the wrong kind for the attribute.
    #[error("Attribute '{attribute}' expects a {expected} value")]
    TypeMismatch {
        /// Attribute name.
        attribute: String,
        /// Kind the attribute takes.
        expected: &'static str,
    },

    /// A ramp step failed; the hardware stays where the last step left it.
    #[error("Ramp of '{attribute}' aborted at {last_reached}: {source}")]
    RampAborted {
        /// Ramped attribute.
        attribute: String,
        /// Last value successfully written.
        last_reached: f64,
        /// Failure of the step that did not complete.
        #[source]
        source: Box<DeviceError>,
    },

    /// A ramp was stopped through its interrupt handle.
    #[error("Ramp of '{attribute}' interrupted at {last_reached}")]
    RampInterrupted {
        /// Ramped attribute.
        attribute: String,
        /// Last value successfully written.
        last_reached: f64,
    },

    /// The crate was built without a feature the configuration needs.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DeviceError {
    /// Shorthand for a transport failure with a description of the link.
    pub fn transport(transport: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            transport: transport.into(),
            message: message.into(),
        }
    }

    /// Whether the error means the hardware link itself is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeviceError::NotHomed {
            device: "beam_steering".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Device 'beam_steering' is not homed and homing policy is manual"
        );
    }

    #[test]
    fn test_ramp_aborted_keeps_source() {
        let err = DeviceError::RampAborted {
            attribute: "freq".into(),
            last_reached: 4.2e8,
            source: Box::new(DeviceError::transport("gpib", "no listener")),
        };
        assert!(err.to_string().contains("aborted at 420000000"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_transport_classification() {
        assert!(DeviceError::transport("COM3", "unplugged").is_transport());
        assert!(!DeviceError::UnknownAttribute("x".into()).is_transport());
    }
}
