//! Simulated Elliptec interface board with ELL14 mounts on it.

use super::{FaultInjector, Outbox};
use crate::error::Result;
use crate::protocol::elliptec::{decode_position, Address, ELL14_COUNTS_PER_TURN};
use crate::transport::Transport;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone)]
struct Mount {
    serial_number: String,
    position: i64,
    /// Added to every commanded target.
    settle_offset: i64,
}

#[derive(Debug, Default)]
struct BoardState {
    mounts: BTreeMap<u8, Mount>,
    log: Vec<String>,
    faults: FaultInjector,
}

/// Test-side view of a simulated board.
#[derive(Clone, Default)]
pub struct ElliptecSimHandle {
    state: Arc<Mutex<BoardState>>,
}

impl ElliptecSimHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put an ELL14 with `serial_number` at `address`, at position 0.
    pub fn add_mount(&self, address: u8, serial_number: impl Into<String>) -> &Self {
        self.state.lock().mounts.insert(
            address,
            Mount {
                serial_number: serial_number.into(),
                position: 0,
                settle_offset: 0,
            },
        );
        self
    }

    /// Attach a transport to this board.
    pub fn connect(&self) -> ElliptecSim {
        ElliptecSim {
            state: self.state.clone(),
            outbox: Outbox::default(),
        }
    }

    pub fn position(&self, address: u8) -> Option<i64> {
        self.state.lock().mounts.get(&address).map(|m| m.position)
    }

    pub fn set_position(&self, address: u8, counts: i64) {
        if let Some(mount) = self.state.lock().mounts.get_mut(&address) {
            mount.position = counts;
        }
    }

    pub fn set_settle_offset(&self, address: u8, counts: i64) {
        if let Some(mount) = self.state.lock().mounts.get_mut(&address) {
            mount.settle_offset = counts;
        }
    }

    /// Every command received, e.g. `0gp`, `1ma00002000`.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Commands that move a mount (`ma`, `mr`, `ho`).
    pub fn move_commands(&self) -> Vec<String> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|c| is_move(c))
            .cloned()
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    pub fn fail_after_moves(&self, n: usize) {
        self.state.lock().faults.fail_after(n);
    }
}

fn is_move(command: &str) -> bool {
    matches!(command.get(1..3), Some("ma") | Some("mr") | Some("ho"))
}

/// Transport end of a simulated board.
pub struct ElliptecSim {
    state: Arc<Mutex<BoardState>>,
    outbox: Outbox,
}

impl ElliptecSim {
    fn handle(&mut self, command: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.log.push(command.to_string());
        if is_move(command) {
            state.faults.record_set("elliptec-sim")?;
        }

        let Some(address) = command.get(..1).and_then(|a| Address::parse(a).ok()) else {
            return Ok(());
        };
        let Some(mount) = state.mounts.get_mut(&address.value()) else {
            // Nobody listening at this address.
            return Ok(());
        };

        let instruction = command.get(1..3).unwrap_or_default();
        let data = command.get(3..).unwrap_or_default();
        let reply = match instruction {
            "in" => format!(
                "{address}IN0E{:0>8}2023{:02X}{:02X}{:04X}{:08X}",
                mount.serial_number,
                0x17,
                0x01,
                360,
                ELL14_COUNTS_PER_TURN
            ),
            "gs" => format!("{address}GS00"),
            "gp" => format!("{address}PO{:08X}", mount.position as i32 as u32),
            "ma" => match decode_position(data) {
                Ok(target) => {
                    mount.position = target + mount.settle_offset;
                    format!("{address}PO{:08X}", mount.position as i32 as u32)
                }
                Err(_) => format!("{address}GS03"),
            },
            "mr" => match decode_position(data) {
                Ok(delta) => {
                    mount.position += delta + mount.settle_offset;
                    format!("{address}PO{:08X}", mount.position as i32 as u32)
                }
                Err(_) => format!("{address}GS03"),
            },
            "ho" => {
                mount.position = 0;
                format!("{address}PO00000000")
            }
            _ => format!("{address}GS03"),
        };
        trace!(command, reply = %reply, "elliptec-sim");
        self.outbox.push(reply.as_bytes());
        self.outbox.push(b"\r\n");
        Ok(())
    }
}

#[async_trait]
impl Transport for ElliptecSim {
    fn describe(&self) -> String {
        "elliptec-sim".to_string()
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(bytes);
        let command = text.trim();
        if command.is_empty() {
            return Ok(());
        }
        self.handle(command)
    }

    async fn read_until(&mut self, delimiter: u8) -> Result<Vec<u8>> {
        self.outbox.read_until("elliptec-sim", delimiter)
    }

    async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        self.outbox.read_exact("elliptec-sim", len)
    }

    async fn close(&mut self) -> Result<()> {
        self.outbox.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::elliptec::{DeviceInfo, Reply};
    use crate::transport::{read_line, write_line};

    #[tokio::test]
    async fn test_info_reply_decodes() {
        let board = ElliptecSimHandle::new();
        board.add_mount(3, "11400101");
        let mut link = board.connect();

        write_line(&mut link, "3in", "").await.unwrap();
        let info = DeviceInfo::parse(&Reply::parse(&read_line(&mut link).await.unwrap()).unwrap()).unwrap();
        assert_eq!(info.serial_number, "11400101");
        assert_eq!(info.pulses_per_unit as i64, ELL14_COUNTS_PER_TURN);
    }

    #[tokio::test]
    async fn test_move_applies_settle_offset() {
        let board = ElliptecSimHandle::new();
        board.add_mount(0, "11400101");
        board.set_settle_offset(0, 2);
        let mut link = board.connect();

        write_line(&mut link, "0ma00002000", "").await.unwrap();
        let reply = Reply::parse(&read_line(&mut link).await.unwrap()).unwrap();
        assert_eq!(reply.position().unwrap(), 8194);
        assert_eq!(board.position(0), Some(8194));
        assert_eq!(board.move_commands(), vec!["0ma00002000".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_address_does_not_answer() {
        let board = ElliptecSimHandle::new();
        let mut link = board.connect();
        write_line(&mut link, "5gp", "").await.unwrap();
        assert!(read_line(&mut link).await.is_err());
    }
}
