//! Simulated KDC101 DC-servo controller speaking APT.

use super::{FaultInjector, Outbox};
use crate::error::Result;
use crate::protocol::apt::{self, status, DcStatus, HardwareInfo, Message, HEADER_LEN};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug)]
struct ControllerState {
    serial_number: u32,
    position: i32,
    homed: bool,
    enabled: bool,
    settle_offset: i32,
    stalled: bool,
    log: Vec<u16>,
    faults: FaultInjector,
}

/// Test-side view of a simulated controller.
#[derive(Clone)]
pub struct Kdc101SimHandle {
    state: Arc<Mutex<ControllerState>>,
}

impl Kdc101SimHandle {
    /// A powered-up controller: not homed, channel disabled, at 0.
    pub fn new(serial_number: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(ControllerState {
                serial_number,
                position: 0,
                homed: false,
                enabled: false,
                settle_offset: 0,
                stalled: false,
                log: Vec::new(),
                faults: FaultInjector::default(),
            })),
        }
    }

    pub fn connect(&self) -> Kdc101Sim {
        Kdc101Sim {
            state: self.state.clone(),
            inbound: BytesMut::new(),
            outbox: Outbox::default(),
        }
    }

    pub fn is_homed(&self) -> bool {
        self.state.lock().homed
    }

    pub fn set_homed(&self, homed: bool) {
        self.state.lock().homed = homed;
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn position(&self) -> i32 {
        self.state.lock().position
    }

    pub fn set_position(&self, counts: i32) {
        self.state.lock().position = counts;
    }

    pub fn set_settle_offset(&self, counts: i32) {
        self.state.lock().settle_offset = counts;
    }

    /// While stalled, absolute moves never report completion.
    pub fn stall_moves(&self, stalled: bool) {
        self.state.lock().stalled = stalled;
    }

    /// Message ids received, in order.
    pub fn messages(&self) -> Vec<u16> {
        self.state.lock().log.clone()
    }

    /// Number of messages that start a motion (home or absolute move).
    pub fn motion_count(&self) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|id| matches!(**id, apt::MOT_MOVE_HOME | apt::MOT_MOVE_ABSOLUTE))
            .count()
    }

    pub fn fail_after_moves(&self, n: usize) {
        self.state.lock().faults.fail_after(n);
    }
}

/// Transport end of a simulated controller.
pub struct Kdc101Sim {
    state: Arc<Mutex<ControllerState>>,
    inbound: BytesMut,
    outbox: Outbox,
}

impl Kdc101Sim {
    /// Length of the first complete frame in `inbound`, if any.
    fn complete_frame(&self) -> Result<Option<usize>> {
        if self.inbound.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = apt::Header::decode(&self.inbound)?;
        let len = HEADER_LEN + header.data_len;
        Ok((self.inbound.len() >= len).then_some(len))
    }

    fn handle(&mut self, message: Message) -> Result<()> {
        let mut state = self.state.lock();
        state.log.push(message.id());

        let status_of = |state: &ControllerState| DcStatus {
            channel: apt::CHANNEL_1 as u16,
            position: state.position,
            velocity: 0,
            status_bits: (if state.homed { status::HOMED } else { 0 })
                | (if state.enabled { status::CHANNEL_ENABLED } else { 0 }),
        };

        let reply = match message.id() {
            apt::HW_REQ_INFO => Some(
                HardwareInfo {
                    serial_number: state.serial_number,
                    model: "KDC101".into(),
                    hw_type: 16,
                    firmware: (3, 0, 10),
                }
                .encode(),
            ),
            apt::MOD_SET_CHANENABLESTATE => {
                state.enabled = message.header.param2 == 0x01;
                None
            }
            apt::MOT_MOVE_HOME => {
                state.faults.record_set("kdc101-sim")?;
                state.position = 0;
                state.homed = true;
                Some(Message::short(apt::MOT_MOVE_HOMED, apt::CHANNEL_1, 0).into_reply())
            }
            apt::MOT_MOVE_ABSOLUTE => {
                state.faults.record_set("kdc101-sim")?;
                if !state.enabled || state.stalled {
                    // A disabled channel ignores motion requests.
                    None
                } else {
                    let mut payload = &message.data[..];
                    payload.advance(2);
                    let target = payload.get_i32_le();
                    state.position = target + state.settle_offset;
                    Some(status_of(&*state).encode(apt::MOT_MOVE_COMPLETED))
                }
            }
            apt::MOT_MOVE_STOP => Some(status_of(&*state).encode(apt::MOT_MOVE_STOPPED)),
            apt::MOT_REQ_DCSTATUSUPDATE => Some(status_of(&*state).encode(apt::MOT_GET_DCSTATUSUPDATE)),
            _ => None,
        };

        if let Some(reply) = reply {
            trace!(request = message.id(), reply = reply.id(), "kdc101-sim");
            self.outbox.push(&reply.encode());
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for Kdc101Sim {
    fn describe(&self) -> String {
        "kdc101-sim".to_string()
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.inbound.extend_from_slice(bytes);
        while let Some(len) = self.complete_frame()? {
            let frame = self.inbound.split_to(len);
            let message = Message::decode(&frame)?;
            self.handle(message)?;
        }
        Ok(())
    }

    async fn read_until(&mut self, delimiter: u8) -> Result<Vec<u8>> {
        self.outbox.read_until("kdc101-sim", delimiter)
    }

    async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        self.outbox.read_exact("kdc101-sim", len)
    }

    async fn close(&mut self) -> Result<()> {
        self.inbound.clear();
        self.outbox.clear();
        Ok(())
    }
}
