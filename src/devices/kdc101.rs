//! Thorlabs KDC101 K-Cube DC servo controller with a Z812 actuator
//!
//! Spoken over the APT binary protocol on the cube's USB-serial port
//! (115200 baud, 8N1). The single attribute `position` is in mm.
//!
//! Moves are only accepted once the stage has been homed. Whether the driver
//! homes on its own or refuses to move is set by [`HomingPolicy`].

use crate::config::Kdc101Config;
use crate::device::Device;
use crate::error::{DeviceError, Result};
use crate::front_panel::FrontPanel;
use crate::homing::{ensure_homed, Homeable, HomingPolicy};
use crate::identity::{IdentityQuery, IdentityVerifier};
use crate::protocol::apt::{self, DcStatus, HardwareInfo, Header, Message, HEADER_LEN};
use crate::ramp::Interrupt;
use crate::reconcile::{Backend, ProgramMode, Reconciler, Reconciliation};
use crate::state::{AttributeSpec, DesiredState, StateMap, Value};
use crate::transport::Transport;
use crate::units::{z812_counts_to_mm, z812_mm_to_counts, Z812_TRAVEL_MM};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

pub const BAUD_RATE: u32 = 115_200;
pub const POSITION: &str = "position";

const IDENTITY_KEY: &str = "controller";

/// How long to wait for `MOT_MOVE_STOPPED` after halting a stalled move.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// APT request/response over the controller's serial port.
pub struct AptLink {
    transport: Box<dyn Transport>,
    move_timeout: Duration,
}

impl AptLink {
    pub fn new(transport: Box<dyn Transport>, move_timeout: Duration) -> Self {
        Self {
            transport,
            move_timeout,
        }
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        trace!(id = message.id(), "APT send");
        self.transport.write_all(&message.encode()).await
    }

    async fn receive(&mut self) -> Result<Message> {
        let mut frame = self.transport.read_exact(HEADER_LEN).await?;
        let header = Header::decode(&frame)?;
        if header.data_len > 0 {
            frame.extend(self.transport.read_exact(header.data_len).await?);
        }
        Message::decode(&frame)
    }

    /// Read messages until one with `id` arrives; others are skipped.
    async fn receive_id(&mut self, id: u16, limit: Duration) -> Result<Message> {
        let wait = async {
            loop {
                let message = self.receive().await?;
                if message.id() == id {
                    return Ok::<Message, DeviceError>(message);
                }
                debug!(expected = id, got = message.id(), "Skipping unsolicited APT message");
            }
        };
        timeout(limit, wait).await.map_err(|_| DeviceError::Timeout {
            operation: format!("APT message 0x{id:04X}"),
            elapsed_ms: limit.as_millis() as u64,
        })?
    }

    pub async fn hardware_info(&mut self) -> Result<HardwareInfo> {
        self.send(&apt::req_info()).await?;
        let reply = self.receive_id(apt::HW_GET_INFO, self.move_timeout).await?;
        HardwareInfo::decode(&reply)
    }

    pub async fn status(&mut self) -> Result<DcStatus> {
        self.send(&apt::req_status()).await?;
        let reply = self.receive_id(apt::MOT_GET_DCSTATUSUPDATE, self.move_timeout).await?;
        DcStatus::decode(&reply)
    }

    /// Moves are ignored while the channel is disabled.
    pub async fn enable_channel(&mut self) -> Result<()> {
        self.send(&apt::set_channel_enabled(true)).await
    }

    /// Home and wait for `MOT_MOVE_HOMED`.
    pub async fn home(&mut self) -> Result<()> {
        self.send(&apt::move_home()).await?;
        self.receive_id(apt::MOT_MOVE_HOMED, self.move_timeout).await?;
        Ok(())
    }

    /// Move and wait for `MOT_MOVE_COMPLETED`. A move that does not complete
    /// in time is stopped before the timeout is returned.
    pub async fn move_to(&mut self, counts: i32) -> Result<DcStatus> {
        self.send(&apt::move_absolute(counts)).await?;
        match self.receive_id(apt::MOT_MOVE_COMPLETED, self.move_timeout).await {
            Ok(reply) => DcStatus::decode(&reply),
            Err(err @ DeviceError::Timeout { .. }) => {
                self.stop().await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn stop(&mut self) {
        let stopped = async {
            self.send(&apt::move_stop()).await?;
            let reply = self.receive_id(apt::MOT_MOVE_STOPPED, STOP_TIMEOUT).await?;
            DcStatus::decode(&reply)
        };
        match stopped.await {
            Ok(status) => warn!(position = status.position, "Stopped a move that did not complete"),
            Err(err) => warn!(error = %err, "Stopping a stalled move failed"),
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        self.transport.close().await
    }
}

#[async_trait]
impl Backend for AptLink {
    async fn read(&mut self, attribute: &str) -> Result<Value> {
        if attribute != POSITION {
            return Err(DeviceError::UnknownAttribute(attribute.to_string()));
        }
        Ok(Value::Number(z812_counts_to_mm(self.status().await?.position)))
    }

    async fn write(&mut self, attribute: &str, value: &Value) -> Result<()> {
        if attribute != POSITION {
            return Err(DeviceError::UnknownAttribute(attribute.to_string()));
        }
        let mm = value.as_f64().ok_or_else(|| DeviceError::TypeMismatch {
            attribute: attribute.to_string(),
            expected: "number",
        })?;
        self.move_to(z812_mm_to_counts(mm)).await?;
        Ok(())
    }
}

#[async_trait]
impl Homeable for AptLink {
    async fn is_homed(&mut self) -> Result<bool> {
        Ok(self.status().await?.is_homed())
    }

    async fn home(&mut self) -> Result<()> {
        AptLink::home(self).await
    }
}

#[async_trait]
impl IdentityQuery for AptLink {
    async fn query_identity(&mut self, _address: &str) -> Result<String> {
        Ok(self.hardware_info().await?.serial_number.to_string())
    }
}

/// KDC101 driver.
pub struct Kdc101 {
    name: String,
    homing: HomingPolicy,
    link: AptLink,
    reconciler: Reconciler,
    identity: IdentityVerifier,
}

impl Kdc101 {
    pub fn new(
        name: impl Into<String>,
        serial_number: impl Into<String>,
        homing: HomingPolicy,
        tolerance: f64,
        link: AptLink,
    ) -> Self {
        let name = name.into();
        let spec = AttributeSpec::number(POSITION, tolerance)
            .with_limits(Z812_TRAVEL_MM.0, Z812_TRAVEL_MM.1)
            .with_units("mm");
        let mut identity = IdentityVerifier::new();
        identity.expect(IDENTITY_KEY, serial_number);
        Self {
            reconciler: Reconciler::new(name.clone(), vec![spec]),
            name,
            homing,
            link,
            identity,
        }
    }

    pub fn from_config(config: &Kdc101Config, transport: Box<dyn Transport>) -> Self {
        let link = AptLink::new(transport, config.move_timeout);
        let mut device = Self::new(
            &config.connection.name,
            &config.serial_number,
            config.homing,
            config.tolerance,
            link,
        );
        device.reconciler = device.reconciler.with_settle_time(config.connection.settle_time);
        device
    }

    pub fn homing_policy(&self) -> HomingPolicy {
        self.homing
    }

    /// Homed flag as reported by the controller right now.
    pub async fn is_homed(&mut self) -> Result<bool> {
        self.link.is_homed().await
    }

    /// Home explicitly, whatever the policy.
    pub async fn home(&mut self) -> Result<()> {
        self.identity.verify_all(&mut self.link).await?;
        info!(device = %self.name, "Homing device...");
        self.link.home().await?;
        info!(device = %self.name, "Device homed.");
        self.refresh().await?;
        Ok(())
    }
}

#[async_trait]
impl Device for Kdc101 {
    fn name(&self) -> &str {
        &self.name
    }

    fn attributes(&self) -> &[AttributeSpec] {
        self.reconciler.specs()
    }

    async fn configure(&mut self) -> Result<()> {
        info!(device = %self.name, policy = ?self.homing, "Configuring KDC101");
        self.identity.start_session();
        self.identity.verify_all(&mut self.link).await?;
        self.link.enable_channel().await?;

        if self.link.is_homed().await? {
            debug!(device = %self.name, "Controller already homed");
        } else if self.homing == HomingPolicy::Auto {
            ensure_homed(&self.name, &mut self.link, self.homing).await?;
        } else {
            warn!(device = %self.name, "Controller not homed; moves are refused until it is");
        }

        self.refresh().await?;
        Ok(())
    }

    async fn reconcile(&mut self, desired: &DesiredState, mode: ProgramMode) -> Result<Reconciliation> {
        self.reconciler.validate(desired)?;
        self.identity.verify_all(&mut self.link).await?;
        ensure_homed(&self.name, &mut self.link, self.homing).await?;
        self.reconciler.reconcile(&mut self.link, desired, mode).await
    }

    async fn refresh(&mut self) -> Result<StateMap> {
        self.reconciler.refresh(&mut self.link).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        info!(device = %self.name, "Closing KDC101");
        self.link.close().await
    }

    fn front_panel(&self) -> FrontPanel {
        self.reconciler.front_panel()
    }

    fn interrupt_handle(&self) -> Interrupt {
        self.reconciler.interrupt_handle()
    }
}
