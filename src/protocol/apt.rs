//! Thorlabs APT binary protocol (KDC101 subset)
//!
//! Every message starts with a 6-byte little-endian header:
//!
//! ```text
//! short: | id u16 | param1 u8 | param2 u8 | dest u8        | source u8 |
//! long:  | id u16 | data length u16      | dest u8 | 0x80 | source u8 |
//! ```
//!
//! Long messages are followed by `data length` bytes of payload.

use crate::error::{DeviceError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 6;
const LONG_FLAG: u8 = 0x80;

/// Source/destination byte of the host PC.
pub const HOST: u8 = 0x01;
/// Destination byte of a single-channel USB controller.
pub const USB_DEVICE: u8 = 0x50;

/// Channel 1 identifier used by single-channel cubes.
pub const CHANNEL_1: u8 = 0x01;

pub const HW_REQ_INFO: u16 = 0x0005;
pub const HW_GET_INFO: u16 = 0x0006;
pub const MOD_SET_CHANENABLESTATE: u16 = 0x0210;
pub const MOT_MOVE_HOME: u16 = 0x0443;
pub const MOT_MOVE_HOMED: u16 = 0x0444;
pub const MOT_MOVE_ABSOLUTE: u16 = 0x0453;
pub const MOT_MOVE_COMPLETED: u16 = 0x0464;
pub const MOT_MOVE_STOP: u16 = 0x0465;
pub const MOT_MOVE_STOPPED: u16 = 0x0466;
pub const MOT_REQ_DCSTATUSUPDATE: u16 = 0x0490;
pub const MOT_GET_DCSTATUSUPDATE: u16 = 0x0491;

/// Status bits reported in `MOT_GET_DCSTATUSUPDATE`.
pub mod status {
    pub const FORWARD_LIMIT: u32 = 0x0000_0001;
    pub const REVERSE_LIMIT: u32 = 0x0000_0002;
    pub const MOVING_FORWARD: u32 = 0x0000_0010;
    pub const MOVING_REVERSE: u32 = 0x0000_0020;
    pub const HOMING: u32 = 0x0000_0200;
    pub const HOMED: u32 = 0x0000_0400;
    pub const CHANNEL_ENABLED: u32 = 0x8000_0000;
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub param1: u8,
    pub param2: u8,
    pub dest: u8,
    pub source: u8,
    /// Payload length for long messages, 0 for short ones.
    pub data_len: usize,
}

impl Header {
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < HEADER_LEN {
            return Err(DeviceError::InvalidResponse(format!(
                "APT header needs {HEADER_LEN} bytes, got {}",
                raw.len()
            )));
        }
        let mut buf = &raw[..HEADER_LEN];
        let id = buf.get_u16_le();
        let p1 = buf.get_u8();
        let p2 = buf.get_u8();
        let dest = buf.get_u8();
        let source = buf.get_u8();
        if dest & LONG_FLAG != 0 {
            Ok(Self {
                id,
                param1: 0,
                param2: 0,
                dest: dest & !LONG_FLAG,
                source,
                data_len: u16::from_le_bytes([p1, p2]) as usize,
            })
        } else {
            Ok(Self {
                id,
                param1: p1,
                param2: p2,
                dest,
                source,
                data_len: 0,
            })
        }
    }
}

/// One APT message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub data: Bytes,
}

impl Message {
    /// Header-only message from the host.
    pub fn short(id: u16, param1: u8, param2: u8) -> Self {
        Self {
            header: Header {
                id,
                param1,
                param2,
                dest: USB_DEVICE,
                source: HOST,
                data_len: 0,
            },
            data: Bytes::new(),
        }
    }

    /// Message with payload from the host.
    pub fn long(id: u16, data: Bytes) -> Self {
        Self {
            header: Header {
                id,
                param1: 0,
                param2: 0,
                dest: USB_DEVICE,
                source: HOST,
                data_len: data.len(),
            },
            data,
        }
    }

    /// Swap source and destination, e.g. when a device answers.
    pub fn into_reply(mut self) -> Self {
        self.header.dest = HOST;
        self.header.source = USB_DEVICE;
        self
    }

    pub fn id(&self) -> u16 {
        self.header.id
    }

    pub fn is_long(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.data.len());
        buf.put_u16_le(self.header.id);
        if self.is_long() {
            buf.put_u16_le(self.data.len() as u16);
            buf.put_u8(self.header.dest | LONG_FLAG);
        } else {
            buf.put_u8(self.header.param1);
            buf.put_u8(self.header.param2);
            buf.put_u8(self.header.dest);
        }
        buf.put_u8(self.header.source);
        buf.extend_from_slice(&self.data);
        buf.freeze()
    }

    /// Decode a complete frame (header plus payload).
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let header = Header::decode(frame)?;
        let payload = &frame[HEADER_LEN..];
        if payload.len() != header.data_len {
            return Err(DeviceError::InvalidResponse(format!(
                "APT message 0x{:04X}: expected {} payload bytes, got {}",
                header.id,
                header.data_len,
                payload.len()
            )));
        }
        Ok(Self {
            header,
            data: Bytes::copy_from_slice(payload),
        })
    }

    pub fn expect_id(&self, id: u16) -> Result<&Self> {
        if self.header.id != id {
            return Err(DeviceError::InvalidResponse(format!(
                "expected APT message 0x{id:04X}, got 0x{:04X}",
                self.header.id
            )));
        }
        Ok(self)
    }
}

pub fn req_info() -> Message {
    Message::short(HW_REQ_INFO, 0, 0)
}

pub fn set_channel_enabled(enabled: bool) -> Message {
    Message::short(MOD_SET_CHANENABLESTATE, CHANNEL_1, if enabled { 0x01 } else { 0x02 })
}

pub fn move_home() -> Message {
    Message::short(MOT_MOVE_HOME, CHANNEL_1, 0)
}

pub fn move_stop() -> Message {
    Message::short(MOT_MOVE_STOP, CHANNEL_1, 0x02)
}

pub fn move_absolute(counts: i32) -> Message {
    let mut data = BytesMut::with_capacity(6);
    data.put_u16_le(CHANNEL_1 as u16);
    data.put_i32_le(counts);
    Message::long(MOT_MOVE_ABSOLUTE, data.freeze())
}

pub fn req_status() -> Message {
    Message::short(MOT_REQ_DCSTATUSUPDATE, CHANNEL_1, 0)
}

/// Payload of `HW_GET_INFO` (84 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareInfo {
    pub serial_number: u32,
    pub model: String,
    pub hw_type: u16,
    pub firmware: (u8, u8, u8),
}

impl HardwareInfo {
    pub const LEN: usize = 84;

    pub fn decode(message: &Message) -> Result<Self> {
        message.expect_id(HW_GET_INFO)?;
        if message.data.len() < 18 {
            return Err(DeviceError::InvalidResponse("HW_GET_INFO payload too short".into()));
        }
        let mut buf = &message.data[..];
        let serial_number = buf.get_u32_le();
        let model = String::from_utf8_lossy(&buf[..8])
            .trim_end_matches('\0')
            .trim()
            .to_string();
        buf.advance(8);
        let hw_type = buf.get_u16_le();
        let minor = buf.get_u8();
        let interim = buf.get_u8();
        let major = buf.get_u8();
        Ok(Self {
            serial_number,
            model,
            hw_type,
            firmware: (major, interim, minor),
        })
    }

    pub fn encode(&self) -> Message {
        let mut data = BytesMut::with_capacity(Self::LEN);
        data.put_u32_le(self.serial_number);
        let mut model = [0u8; 8];
        for (slot, byte) in model.iter_mut().zip(self.model.bytes()) {
            *slot = byte;
        }
        data.extend_from_slice(&model);
        data.put_u16_le(self.hw_type);
        data.put_u8(self.firmware.2);
        data.put_u8(self.firmware.1);
        data.put_u8(self.firmware.0);
        data.put_u8(0);
        data.resize(Self::LEN, 0);
        Message::long(HW_GET_INFO, data.freeze()).into_reply()
    }
}

/// Payload of `MOT_GET_DCSTATUSUPDATE`, `MOT_MOVE_COMPLETED` and
/// `MOT_MOVE_STOPPED` (14 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcStatus {
    pub channel: u16,
    pub position: i32,
    pub velocity: u16,
    pub status_bits: u32,
}

impl DcStatus {
    pub const LEN: usize = 14;

    pub fn decode(message: &Message) -> Result<Self> {
        if message.data.len() < Self::LEN {
            return Err(DeviceError::InvalidResponse(format!(
                "status payload of 0x{:04X} too short: {} bytes",
                message.id(),
                message.data.len()
            )));
        }
        let mut buf = &message.data[..];
        let channel = buf.get_u16_le();
        let position = buf.get_i32_le();
        let velocity = buf.get_u16_le();
        buf.advance(2);
        let status_bits = buf.get_u32_le();
        Ok(Self {
            channel,
            position,
            velocity,
            status_bits,
        })
    }

    pub fn encode(&self, id: u16) -> Message {
        let mut data = BytesMut::with_capacity(Self::LEN);
        data.put_u16_le(self.channel);
        data.put_i32_le(self.position);
        data.put_u16_le(self.velocity);
        data.put_u16_le(0);
        data.put_u32_le(self.status_bits);
        Message::long(id, data.freeze()).into_reply()
    }

    pub fn is_homed(&self) -> bool {
        self.status_bits & status::HOMED != 0
    }

    pub fn is_moving(&self) -> bool {
        self.status_bits & (status::MOVING_FORWARD | status::MOVING_REVERSE | status::HOMING) != 0
    }
}
