//! Simulated hardware.
//!
//! Each simulator implements [`Transport`](crate::transport::Transport) and
//! speaks the real wire protocol, so drivers run unchanged in mock mode and
//! in tests. Simulator state lives behind a `parking_lot` mutex shared with a
//! cloneable handle, which tests use to inspect the command log, preset
//! positions, make the hardware settle slightly off target, or inject faults.
//!
//! A missing reply (e.g. nobody at the addressed bus slot) surfaces as
//! [`DeviceError::Timeout`] immediately rather than after a real timeout.

pub mod agilent;
pub mod elliptec;
pub mod kdc101;

pub use agilent::{AgilentSim, AgilentSimHandle};
pub use elliptec::{ElliptecSim, ElliptecSimHandle};
pub use kdc101::{Kdc101Sim, Kdc101SimHandle};

use crate::error::{DeviceError, Result};
use bytes::{Buf, BytesMut};

/// Replies queued by a simulator until the driver reads them.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    pending: BytesMut,
}

impl Outbox {
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    pub(crate) fn read_until(&mut self, source: &str, delimiter: u8) -> Result<Vec<u8>> {
        match self.pending.iter().position(|b| *b == delimiter) {
            Some(idx) => Ok(self.pending.split_to(idx + 1).to_vec()),
            None => Err(no_reply(source)),
        }
    }

    pub(crate) fn read_exact(&mut self, source: &str, len: usize) -> Result<Vec<u8>> {
        if self.pending.len() < len {
            return Err(no_reply(source));
        }
        let mut out = vec![0u8; len];
        self.pending.copy_to_slice(&mut out);
        Ok(out)
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }
}

fn no_reply(source: &str) -> DeviceError {
    DeviceError::Timeout {
        operation: format!("reply from {source}"),
        elapsed_ms: 0,
    }
}

/// Fails every set command after the first `n` succeeded.
#[derive(Debug, Default, Clone)]
pub(crate) struct FaultInjector {
    fail_after: Option<usize>,
    sets: usize,
}

impl FaultInjector {
    pub(crate) fn fail_after(&mut self, n: usize) {
        self.fail_after = Some(n);
        self.sets = 0;
    }

    pub(crate) fn disarm(&mut self) {
        self.fail_after = None;
    }

    /// Account for one set command; `Err` when it must fail.
    pub(crate) fn record_set(&mut self, source: &str) -> Result<()> {
        if let Some(limit) = self.fail_after {
            if self.sets >= limit {
                return Err(DeviceError::transport(source, "simulated write failure"));
            }
        }
        self.sets += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_missing_reply_times_out() {
        let mut outbox = Outbox::default();
        outbox.push(b"0PO00000000\r\n1PO");
        assert_eq!(outbox.read_until("sim", b'\n').unwrap(), b"0PO00000000\r\n");
        assert!(matches!(
            outbox.read_until("sim", b'\n'),
            Err(DeviceError::Timeout { .. })
        ));
        assert_eq!(outbox.read_exact("sim", 3).unwrap(), b"1PO");
    }

    #[test]
    fn test_fault_injector_counts_sets() {
        let mut faults = FaultInjector::default();
        faults.fail_after(2);
        assert!(faults.record_set("sim").is_ok());
        assert!(faults.record_set("sim").is_ok());
        assert!(faults.record_set("sim").unwrap_err().is_transport());
        faults.disarm();
        assert!(faults.record_set("sim").is_ok());
    }
}
