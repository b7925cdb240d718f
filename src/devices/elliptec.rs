//! Thorlabs Elliptec interface board with ELL14 rotation mounts
//!
//! Several mounts share one serial line; every command is prefixed with the
//! target's bus address. Each child mount is one attribute, named after the
//! child, with values in encoder counts.
//!
//! ## Configuration
//!
//! ```toml
//! [[devices]]
//! type = "elliptec"
//! name = "waveplates"
//! port = "/dev/ttyUSB0"
//!
//! [[devices.children]]
//! name = "hwp"
//! address = "0"
//! serial_number = "11400101"
//! home_on_startup = true
//! ```
//!
//! The serial number answering at every address is checked against the
//! configured one once per session, before anything is written there.

use crate::config::{ElliptecChildConfig, ElliptecConfig};
use crate::device::Device;
use crate::error::{DeviceError, Result};
use crate::front_panel::FrontPanel;
use crate::identity::{IdentityQuery, IdentityVerifier};
use crate::protocol::elliptec::{self, Address, DeviceInfo, Reply, ELL14_COUNTS_PER_TURN};
use crate::ramp::Interrupt;
use crate::reconcile::{Backend, ProgramMode, Reconciler, Reconciliation};
use crate::state::{AttributeSpec, DesiredState, StateMap, Value};
use crate::transport::{read_line, write_line, Transport};
use crate::units::Ell14Calibration;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// One mount on the bus.
#[derive(Debug, Clone)]
pub struct ElliptecChild {
    pub name: String,
    pub address: Address,
    pub serial_number: String,
    pub model: String,
    pub home_on_startup: bool,
    pub calibration: Ell14Calibration,
}

impl ElliptecChild {
    pub fn from_config(config: &ElliptecChildConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            address: Address::parse(&config.address)?,
            serial_number: config.serial_number.clone(),
            model: config.model.clone(),
            home_on_startup: config.home_on_startup,
            calibration: config.calibration,
        })
    }

    fn attribute(&self) -> AttributeSpec {
        AttributeSpec::number(&self.name, 1.0)
            .with_limits(0.0, ELL14_COUNTS_PER_TURN as f64)
            .with_units("counts")
    }
}

/// Addressed request/response on the shared serial line.
pub struct ElliptecLink {
    transport: Box<dyn Transport>,
    addresses: BTreeMap<String, Address>,
}

impl ElliptecLink {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            addresses: BTreeMap::new(),
        }
    }

    fn address_of(&self, attribute: &str) -> Result<Address> {
        self.addresses
            .get(attribute)
            .copied()
            .ok_or_else(|| DeviceError::UnknownAttribute(attribute.to_string()))
    }

    async fn query(&mut self, address: Address, instruction: &str) -> Result<Reply> {
        let command = elliptec::command(address, instruction);
        write_line(&mut self.transport, &command, "").await?;
        let line = read_line(&mut self.transport).await?;
        let reply = Reply::parse(&line)?;
        if reply.address != address {
            return Err(DeviceError::InvalidResponse(format!(
                "Response address mismatch. Expected {address}, got response: {line}"
            )));
        }
        Ok(reply)
    }

    /// Reset the receiving state machine of every device on the bus.
    pub async fn clear(&mut self) -> Result<()> {
        self.transport.write_all(b"\r").await
    }

    pub async fn info(&mut self, address: Address) -> Result<DeviceInfo> {
        let reply = self.query(address, "in").await?;
        DeviceInfo::parse(&reply)
    }

    pub async fn status(&mut self, address: Address) -> Result<()> {
        self.query(address, "gs").await?.check_status()
    }

    pub async fn position(&mut self, address: Address) -> Result<i64> {
        self.query(address, "gp").await?.position()
    }

    /// Move and wait for the position reply.
    pub async fn move_absolute(&mut self, address: Address, counts: f64) -> Result<i64> {
        let hex = elliptec::encode_position(counts)?;
        self.query(address, &format!("ma{hex}")).await?.position()
    }

    pub async fn move_relative(&mut self, address: Address, counts: f64) -> Result<i64> {
        let hex = elliptec::encode_position(counts)?;
        self.query(address, &format!("mr{hex}")).await?.position()
    }

    /// Home clockwise.
    pub async fn home(&mut self, address: Address) -> Result<i64> {
        self.query(address, "ho0").await?.position()
    }

    pub async fn close(&mut self) -> Result<()> {
        self.transport.close().await
    }
}

#[async_trait]
impl Backend for ElliptecLink {
    async fn read(&mut self, attribute: &str) -> Result<Value> {
        let address = self.address_of(attribute)?;
        Ok(Value::Number(self.position(address).await? as f64))
    }

    async fn write(&mut self, attribute: &str, value: &Value) -> Result<()> {
        let address = self.address_of(attribute)?;
        let counts = value.as_f64().ok_or_else(|| DeviceError::TypeMismatch {
            attribute: attribute.to_string(),
            expected: "number",
        })?;
        self.move_absolute(address, counts).await?;
        Ok(())
    }
}

#[async_trait]
impl IdentityQuery for ElliptecLink {
    async fn query_identity(&mut self, address: &str) -> Result<String> {
        let address = Address::parse(address)?;
        Ok(self.info(address).await?.serial_number)
    }
}

/// Elliptec interface board driver.
pub struct ElliptecBoard {
    name: String,
    children: Vec<ElliptecChild>,
    link: ElliptecLink,
    reconciler: Reconciler,
    identity: IdentityVerifier,
}

impl ElliptecBoard {
    pub fn new(name: impl Into<String>, children: Vec<ElliptecChild>, transport: Box<dyn Transport>) -> Self {
        let name = name.into();
        let mut link = ElliptecLink::new(transport);
        let mut identity = IdentityVerifier::new();
        for child in &children {
            link.addresses.insert(child.name.clone(), child.address);
            identity.expect(child.address.to_string(), child.serial_number.clone());
        }
        let specs = children.iter().map(ElliptecChild::attribute).collect();
        Self {
            reconciler: Reconciler::new(name.clone(), specs),
            name,
            children,
            link,
            identity,
        }
    }

    pub fn from_config(config: &ElliptecConfig, transport: Box<dyn Transport>) -> Result<Self> {
        let children = config
            .children
            .iter()
            .map(ElliptecChild::from_config)
            .collect::<Result<Vec<_>>>()?;
        let board = Self::new(&config.connection.name, children, transport);
        Ok(board.with_settle_time(config.connection.settle_time))
    }

    pub fn with_settle_time(mut self, settle_time: Option<std::time::Duration>) -> Self {
        self.reconciler = self.reconciler.with_settle_time(settle_time);
        self
    }

    pub fn children(&self) -> &[ElliptecChild] {
        &self.children
    }

    fn child(&self, name: &str) -> Result<&ElliptecChild> {
        self.children
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| DeviceError::UnknownAttribute(name.to_string()))
    }

    /// Home one mount. The front panel is refreshed afterwards.
    pub async fn home(&mut self, child: &str) -> Result<()> {
        let address = self.child(child)?.address;
        self.identity.verify(&mut self.link, &address.to_string()).await?;
        self.link.home(address).await?;
        self.refresh().await?;
        Ok(())
    }

    /// Shift one mount by `counts`. The front panel is refreshed afterwards.
    pub async fn move_relative(&mut self, child: &str, counts: f64) -> Result<()> {
        let address = self.child(child)?.address;
        self.identity.verify(&mut self.link, &address.to_string()).await?;
        self.link.move_relative(address, counts).await?;
        self.refresh().await?;
        Ok(())
    }
}

#[async_trait]
impl Device for ElliptecBoard {
    fn name(&self) -> &str {
        &self.name
    }

    fn attributes(&self) -> &[AttributeSpec] {
        self.reconciler.specs()
    }

    async fn configure(&mut self) -> Result<()> {
        info!(device = %self.name, children = self.children.len(), "Configuring Elliptec interface board");
        self.link.clear().await?;
        self.identity.start_session();
        self.identity.verify_all(&mut self.link).await?;

        for child in &self.children {
            self.link.status(child.address).await?;
            if child.home_on_startup {
                info!(child = %child.name, address = %child.address, "Homing on startup");
                self.link.home(child.address).await?;
            }
        }

        self.refresh().await?;
        Ok(())
    }

    async fn reconcile(&mut self, desired: &DesiredState, mode: ProgramMode) -> Result<Reconciliation> {
        self.reconciler.validate(desired)?;
        self.identity.verify_all(&mut self.link).await?;
        self.reconciler.reconcile(&mut self.link, desired, mode).await
    }

    async fn refresh(&mut self) -> Result<StateMap> {
        let observed = self.reconciler.refresh(&mut self.link).await?;
        for child in &self.children {
            if let Some(counts) = observed.get(&child.name).and_then(Value::as_f64) {
                debug!(
                    child = %child.name,
                    counts,
                    degrees = child.calibration.counts_to_degrees(counts),
                    "Position"
                );
            }
        }
        Ok(observed)
    }

    async fn shutdown(&mut self) -> Result<()> {
        info!(device = %self.name, "Closing Elliptec interface board");
        self.link.close().await
    }

    fn front_panel(&self) -> FrontPanel {
        self.reconciler.front_panel()
    }

    fn interrupt_handle(&self) -> Interrupt {
        self.reconciler.interrupt_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::ElliptecSimHandle;

    fn child(name: &str, address: u8, serial: &str, home: bool) -> ElliptecChild {
        ElliptecChild {
            name: name.into(),
            address: Address::new(address).unwrap(),
            serial_number: serial.into(),
            model: "ELL14".into(),
            home_on_startup: home,
            calibration: Ell14Calibration::default(),
        }
    }

    fn board(sim: &ElliptecSimHandle) -> ElliptecBoard {
        ElliptecBoard::new(
            "waveplates",
            vec![child("hwp", 0, "11400101", true), child("qwp", 1, "11400102", false)],
            Box::new(sim.connect()),
        )
    }

    #[tokio::test]
    async fn test_configure_homes_selected_children() {
        let sim = ElliptecSimHandle::new();
        sim.add_mount(0, "11400101").add_mount(1, "11400102");
        sim.set_position(0, 5000);
        sim.set_position(1, 7000);

        let mut board = board(&sim);
        board.configure().await.unwrap();

        assert_eq!(sim.position(0), Some(0));
        assert_eq!(sim.position(1), Some(7000));
        assert_eq!(sim.move_commands(), vec!["0ho0".to_string()]);
        assert_eq!(board.front_panel().get("qwp"), Some(Value::Number(7000.0)));
    }

    #[tokio::test]
    async fn test_writes_are_addressed() {
        let sim = ElliptecSimHandle::new();
        sim.add_mount(0, "11400101").add_mount(1, "11400102");
        let mut board = board(&sim);
        board.configure().await.unwrap();
        sim.clear_log();

        let desired: DesiredState = [("qwp", 35_840.0)].into_iter().collect();
        let report = board.transition_to_buffered(&desired).await.unwrap();

        assert_eq!(report.written, vec!["qwp".to_string()]);
        assert_eq!(sim.move_commands(), vec!["1ma00008C00".to_string()]);
        assert_eq!(sim.position(1), Some(35_840));
    }

    #[tokio::test]
    async fn test_relative_move_and_home() {
        let sim = ElliptecSimHandle::new();
        sim.add_mount(0, "11400101").add_mount(1, "11400102");
        let mut board = board(&sim);
        board.configure().await.unwrap();

        board.move_relative("qwp", -100.0).await.unwrap();
        assert_eq!(sim.position(1), Some(-100));
        board.home("qwp").await.unwrap();
        assert_eq!(board.front_panel().get("qwp"), Some(Value::Number(0.0)));
        assert!(board.home("missing").await.is_err());
    }
}
