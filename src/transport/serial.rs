//! Serial port transport (`tokio-serial`).
//!
//! Used for the Elliptec interface board, the KDC101's USB-serial port and
//! the Prologix GPIB-USB converter. All three run 8N1 without flow control;
//! only the baud rate differs.

use super::{RetryPolicy, Transport};
use crate::error::{DeviceError, Result};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, trace};

/// Port settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Serial port path (e.g., "/dev/ttyUSB0" on Linux, "COM3" on Windows)
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Longest wait for a single reply.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

impl SerialSettings {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            timeout: default_timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// An open serial port.
pub struct SerialTransport {
    settings: SerialSettings,
    port: Option<SerialStream>,
    /// Bytes received past the last delimiter.
    pending: BytesMut,
}

impl SerialTransport {
    /// Open the port once.
    pub fn open(settings: SerialSettings) -> Result<Self> {
        // Configure serial settings with no flow control
        let port = tokio_serial::new(&settings.port, settings.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                DeviceError::transport(&settings.port, format!("failed to open serial port: {e}"))
            })?;

        debug!(port = %settings.port, baud_rate = settings.baud_rate, "Serial port opened");
        Ok(Self {
            settings,
            port: Some(port),
            pending: BytesMut::with_capacity(256),
        })
    }

    /// Open the port, retrying while the adapter is not available yet.
    pub async fn open_with_retry(settings: SerialSettings, policy: &RetryPolicy) -> Result<Self> {
        let what = format!("Connection to {}", settings.port);
        policy
            .run(&what, || {
                let settings = settings.clone();
                async move { Self::open(settings) }
            })
            .await
    }

    fn port(&mut self) -> Result<&mut SerialStream> {
        let name = self.settings.port.clone();
        self.port
            .as_mut()
            .ok_or_else(|| DeviceError::transport(name, "serial port not connected"))
    }

    async fn fill(&mut self) -> Result<()> {
        let timeout = self.settings.timeout;
        let name = self.settings.port.clone();
        let mut buf = [0u8; 64];
        let port = self.port()?;
        let n = tokio::time::timeout(timeout, port.read(&mut buf))
            .await
            .map_err(|_| DeviceError::Timeout {
                operation: format!("reply on {name}"),
                elapsed_ms: timeout.as_millis() as u64,
            })??;
        if n == 0 {
            return Err(DeviceError::transport(name, "unexpected EOF from serial port"));
        }
        self.pending.extend_from_slice(&buf[..n]);
        Ok(())
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn describe(&self) -> String {
        format!("{} @ {} baud", self.settings.port, self.settings.baud_rate)
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        trace!(port = %self.settings.port, bytes = ?String::from_utf8_lossy(bytes), "write");
        let port = self.port()?;
        port.write_all(bytes).await?;
        port.flush().await?;
        Ok(())
    }

    async fn read_until(&mut self, delimiter: u8) -> Result<Vec<u8>> {
        loop {
            if let Some(idx) = self.pending.iter().position(|b| *b == delimiter) {
                let line = self.pending.split_to(idx + 1).to_vec();
                trace!(port = %self.settings.port, bytes = ?String::from_utf8_lossy(&line), "read");
                return Ok(line);
            }
            self.fill().await?;
        }
    }

    async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        while self.pending.len() < len {
            self.fill().await?;
        }
        let mut out = vec![0u8; len];
        self.pending.copy_to_slice(&mut out);
        Ok(out)
    }

    async fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!(port = %self.settings.port, "Serial port closed");
        }
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults_from_toml() {
        let settings: SerialSettings = toml::from_str(r#"port = "COM3""#).unwrap();
        assert_eq!(settings.baud_rate, 9600);
        assert_eq!(settings.timeout, Duration::from_secs(30));

        let settings: SerialSettings =
            toml::from_str("port = \"/dev/ttyUSB0\"\nbaud_rate = 115200\ntimeout = \"500ms\"\n").unwrap();
        assert_eq!(settings.baud_rate, 115200);
        assert_eq!(settings.timeout, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let result = SerialTransport::open(SerialSettings::new("/dev/does-not-exist-labdev", 9600));
        assert!(matches!(result, Err(DeviceError::Transport { .. })));
    }
}
