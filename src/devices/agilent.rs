//! Agilent 83650B swept-signal generator behind a Prologix GPIB-USB converter
//!
//! Attributes, in write order:
//! - `freq`: CW frequency in Hz (10 MHz - 50 GHz), optionally ramped
//! - `amp`: output level in dBm (-20 - +10)
//! - `gate`: RF output on/off
//!
//! The converter is put in controller mode once during `configure`; the
//! instrument's GPIB address is selected again before every transaction so
//! other instruments may share the converter.

use crate::config::Agilent83650bConfig;
use crate::device::Device;
use crate::error::{DeviceError, Result};
use crate::front_panel::FrontPanel;
use crate::protocol::scpi;
use crate::ramp::{Interrupt, RampConfig};
use crate::reconcile::{Backend, ProgramMode, Reconciler, Reconciliation};
use crate::state::{AttributeSpec, DesiredState, StateMap, Value};
use crate::transport::{read_line, write_line, Transport};
use async_trait::async_trait;
use tracing::{debug, info};

pub const FREQUENCY: &str = "freq";
pub const POWER: &str = "amp";
pub const OUTPUT: &str = "gate";

pub const FREQUENCY_LIMITS: (f64, f64) = (10e6, 50e9);
pub const POWER_LIMITS: (f64, f64) = (-20.0, 10.0);

/// SCPI over the Prologix converter.
pub struct ScpiLink {
    transport: Box<dyn Transport>,
    gpib_address: u8,
}

impl ScpiLink {
    pub fn new(transport: Box<dyn Transport>, gpib_address: u8) -> Self {
        Self {
            transport,
            gpib_address,
        }
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        debug!(command = line, "Sending");
        write_line(&mut self.transport, line, scpi::TERMINATOR).await
    }

    /// Controller mode, no auto-read, LF + EOI termination.
    pub async fn setup(&mut self) -> Result<()> {
        for line in scpi::PROLOGIX_SETUP {
            self.send(line).await?;
        }
        Ok(())
    }

    async fn select(&mut self) -> Result<()> {
        let line = scpi::select_address(self.gpib_address)?;
        self.send(&line).await
    }

    pub async fn command(&mut self, command: &str) -> Result<()> {
        self.select().await?;
        self.send(command).await
    }

    pub async fn query(&mut self, command: &str) -> Result<String> {
        self.select().await?;
        self.send(command).await?;
        self.send(scpi::PROLOGIX_READ).await?;
        let reply = read_line(&mut self.transport).await?;
        debug!(reply = %reply, "Received");
        Ok(reply)
    }

    pub async fn close(&mut self) -> Result<()> {
        self.transport.close().await
    }
}

fn number(attribute: &str, value: &Value) -> Result<f64> {
    value.as_f64().ok_or_else(|| DeviceError::TypeMismatch {
        attribute: attribute.to_string(),
        expected: "number",
    })
}

#[async_trait]
impl Backend for ScpiLink {
    async fn read(&mut self, attribute: &str) -> Result<Value> {
        match attribute {
            FREQUENCY => Ok(Value::Number(scpi::parse_number(&self.query(scpi::FREQUENCY_QUERY).await?)?)),
            POWER => Ok(Value::Number(scpi::parse_number(&self.query(scpi::POWER_QUERY).await?)?)),
            OUTPUT => Ok(Value::Flag(scpi::parse_bool(&self.query(scpi::OUTPUT_QUERY).await?)?)),
            other => Err(DeviceError::UnknownAttribute(other.to_string())),
        }
    }

    async fn write(&mut self, attribute: &str, value: &Value) -> Result<()> {
        let command = match attribute {
            FREQUENCY => scpi::set_frequency(number(attribute, value)?),
            POWER => scpi::set_power(number(attribute, value)?),
            OUTPUT => scpi::set_output(value.as_bool().ok_or_else(|| DeviceError::TypeMismatch {
                attribute: attribute.to_string(),
                expected: "flag",
            })?),
            other => return Err(DeviceError::UnknownAttribute(other.to_string())),
        };
        self.command(&command).await
    }
}

/// Attribute declarations; `ramp` applies to the frequency only.
pub fn attributes(ramp: Option<RampConfig>) -> Vec<AttributeSpec> {
    vec![
        AttributeSpec::number(FREQUENCY, 1.0)
            .with_limits(FREQUENCY_LIMITS.0, FREQUENCY_LIMITS.1)
            .with_ramp(ramp)
            .with_units("Hz"),
        AttributeSpec::number(POWER, 0.01)
            .with_limits(POWER_LIMITS.0, POWER_LIMITS.1)
            .with_units("dBm"),
        AttributeSpec::flag(OUTPUT),
    ]
}

/// Agilent 83650B driver.
pub struct Agilent83650B {
    name: String,
    link: ScpiLink,
    reconciler: Reconciler,
}

impl Agilent83650B {
    pub fn new(name: impl Into<String>, link: ScpiLink, ramp: Option<RampConfig>) -> Self {
        let name = name.into();
        Self {
            reconciler: Reconciler::new(name.clone(), attributes(ramp)),
            name,
            link,
        }
    }

    pub fn from_config(config: &Agilent83650bConfig, transport: Box<dyn Transport>) -> Self {
        let link = ScpiLink::new(transport, config.gpib_address);
        let mut device = Self::new(&config.connection.name, link, config.ramp);
        device.reconciler = device.reconciler.with_settle_time(config.connection.settle_time);
        device
    }

    pub fn is_ramped(&self) -> bool {
        self.reconciler
            .spec(FREQUENCY)
            .is_some_and(|spec| spec.ramp.is_some())
    }
}

#[async_trait]
impl Device for Agilent83650B {
    fn name(&self) -> &str {
        &self.name
    }

    fn attributes(&self) -> &[AttributeSpec] {
        self.reconciler.specs()
    }

    async fn configure(&mut self) -> Result<()> {
        info!(
            device = %self.name,
            gpib_address = self.link.gpib_address,
            ramped = self.is_ramped(),
            "Configuring Agilent 83650B"
        );
        self.link.setup().await?;
        self.refresh().await?;
        Ok(())
    }

    async fn reconcile(&mut self, desired: &DesiredState, mode: ProgramMode) -> Result<Reconciliation> {
        self.reconciler.reconcile(&mut self.link, desired, mode).await
    }

    async fn refresh(&mut self) -> Result<StateMap> {
        self.reconciler.refresh(&mut self.link).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        info!(device = %self.name, "Closing Agilent 83650B");
        self.link.close().await
    }

    fn front_panel(&self) -> FrontPanel {
        self.reconciler.front_panel()
    }

    fn interrupt_handle(&self) -> Interrupt {
        self.reconciler.interrupt_handle()
    }
}
