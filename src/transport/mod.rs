//! Byte-level links to hardware.
//!
//! A [`Transport`] is exclusively owned by one driver. Drivers layer their
//! protocol codec on top of it; whether the bytes reach a real serial port or
//! a simulated device is decided when the driver is constructed.

pub mod retry;
#[cfg(feature = "serial")]
pub mod serial;

use crate::error::Result;
use async_trait::async_trait;

pub use retry::RetryPolicy;
#[cfg(feature = "serial")]
pub use serial::{SerialSettings, SerialTransport};

/// Half-duplex byte stream to one piece of hardware.
#[async_trait]
pub trait Transport: Send {
    /// Human-readable description of the link (port name, simulator name).
    fn describe(&self) -> String;

    /// Send all bytes.
    async fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read up to and including `delimiter`. The delimiter is kept.
    async fn read_until(&mut self, delimiter: u8) -> Result<Vec<u8>>;

    /// Read exactly `len` bytes.
    async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>>;

    /// Release the underlying resource.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).write_all(bytes).await
    }

    async fn read_until(&mut self, delimiter: u8) -> Result<Vec<u8>> {
        (**self).read_until(delimiter).await
    }

    async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        (**self).read_exact(len).await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }
}

/// Write a text command followed by `terminator`.
pub async fn write_line<T: Transport + ?Sized>(transport: &mut T, command: &str, terminator: &str) -> Result<()> {
    let mut bytes = Vec::with_capacity(command.len() + terminator.len());
    bytes.extend_from_slice(command.as_bytes());
    bytes.extend_from_slice(terminator.as_bytes());
    transport.write_all(&bytes).await
}

/// Read one `\n`-terminated line, trimmed of surrounding whitespace.
pub async fn read_line<T: Transport + ?Sized>(transport: &mut T) -> Result<String> {
    let bytes = transport.read_until(b'\n').await?;
    Ok(String::from_utf8_lossy(&bytes).trim().to_string())
}
