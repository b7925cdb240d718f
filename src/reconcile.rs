//! Device state reconciliation ("smart programming").
//!
//! A reconcile pass compares the desired values against a fresh hardware read,
//! writes only the attributes that are out of tolerance, and then reads the
//! hardware again. The second read, never the written value, becomes the
//! observed and front-panel state: servo actuators and synthesizers may settle
//! slightly off the commanded value.
//!
//! ```text
//! validate -> read all -> diff (tolerance) -> write dirty (declared order)
//!          -> [settle] -> read all -> publish -> warn on mismatch
//! ```

use crate::error::{DeviceError, Result};
use crate::front_panel::FrontPanel;
use crate::ramp::{self, Interrupt};
use crate::state::{AttributeSpec, DesiredState, StateMap, Value};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attribute-level access to one device.
///
/// Implemented by each driver's protocol link; the reconciler never sees the
/// wire format.
#[async_trait]
pub trait Backend: Send {
    /// Query the current hardware value of one attribute.
    async fn read(&mut self, attribute: &str) -> Result<Value>;

    /// Command a new value. Implementations issue any addressing directive
    /// the transport needs before the value-set command.
    async fn write(&mut self, attribute: &str, value: &Value) -> Result<()>;
}

/// How a reconcile pass decides what to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgramMode {
    /// Write only attributes that differ by more than their tolerance.
    #[default]
    Smart,
    /// Write every desired attribute.
    Fresh,
}

/// A desired value the hardware did not end up at.
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    pub attribute: String,
    pub desired: Value,
    pub observed: Value,
}

/// Report of one reconcile pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// Confirmed hardware state after the pass.
    pub observed: StateMap,
    /// Whether any write was issued.
    pub changed: bool,
    /// Attributes that were written, in write order.
    pub written: Vec<String>,
    /// Non-fatal differences between desired and confirmed state.
    pub mismatches: Vec<Mismatch>,
}

/// Owns the attribute declarations, the observed state and the front panel of
/// one device.
#[derive(Debug)]
pub struct Reconciler {
    device: String,
    specs: Vec<AttributeSpec>,
    observed: StateMap,
    panel: FrontPanel,
    interrupt: Interrupt,
    settle_time: Option<Duration>,
}

impl Reconciler {
    pub fn new(device: impl Into<String>, specs: Vec<AttributeSpec>) -> Self {
        Self {
            device: device.into(),
            specs,
            observed: StateMap::new(),
            panel: FrontPanel::new(),
            interrupt: Interrupt::new(),
            settle_time: None,
        }
    }

    /// Wait this long after the last write before the confirmation read.
    pub fn with_settle_time(mut self, settle_time: Option<Duration>) -> Self {
        self.settle_time = settle_time;
        self
    }

    pub fn specs(&self) -> &[AttributeSpec] {
        &self.specs
    }

    pub fn spec(&self, attribute: &str) -> Option<&AttributeSpec> {
        self.specs.iter().find(|s| s.name == attribute)
    }

    /// Last observed hardware state (may be older than the front panel if a
    /// ramp aborted without a confirmation read).
    pub fn observed(&self) -> &StateMap {
        &self.observed
    }

    pub fn front_panel(&self) -> FrontPanel {
        self.panel.clone()
    }

    pub fn interrupt_handle(&self) -> Interrupt {
        self.interrupt.clone()
    }

    /// Reject desired values that are undeclared, of the wrong kind, or
    /// outside limits.
    pub fn validate(&self, desired: &DesiredState) -> Result<()> {
        for (name, value) in desired.iter() {
            let spec = self
                .spec(name)
                .ok_or_else(|| DeviceError::UnknownAttribute(name.clone()))?;
            spec.validate(value)?;
        }
        Ok(())
    }

    /// Read every declared attribute and publish the result.
    pub async fn refresh<B: Backend + ?Sized>(&mut self, backend: &mut B) -> Result<StateMap> {
        let observed = self.read_all(backend).await?;
        self.publish(observed.clone());
        Ok(observed)
    }

    async fn read_all<B: Backend + ?Sized>(&self, backend: &mut B) -> Result<StateMap> {
        let mut observed = StateMap::new();
        for spec in &self.specs {
            let value = backend.read(&spec.name).await?;
            observed.insert(spec.name.clone(), value);
        }
        Ok(observed)
    }

    fn publish(&mut self, observed: StateMap) {
        self.panel.confirm(&observed);
        self.observed = observed;
    }

    /// Bring the hardware to `desired`, writing as little as possible.
    pub async fn reconcile<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        desired: &DesiredState,
        mode: ProgramMode,
    ) -> Result<Reconciliation> {
        if self.interrupt.take() {
            debug!(device = %self.device, "Dropped stop request made while idle");
        }
        self.validate(desired)?;

        let before = self.read_all(backend).await?;

        let dirty: Vec<AttributeSpec> = self
            .specs
            .iter()
            .filter_map(|spec| {
                let target = desired.get(&spec.name)?;
                let needs_write = match mode {
                    ProgramMode::Fresh => true,
                    ProgramMode::Smart => before
                        .get(&spec.name)
                        .map_or(true, |current| target.differs(current, spec.tolerance)),
                };
                needs_write.then(|| spec.clone())
            })
            .collect();

        if dirty.is_empty() {
            debug!(device = %self.device, "Used smart programming; nothing to write");
            let mismatches = self.mismatches(desired, &before);
            self.publish(before.clone());
            return Ok(Reconciliation {
                observed: before,
                changed: false,
                written: Vec::new(),
                mismatches,
            });
        }

        let mut written = Vec::with_capacity(dirty.len());
        for spec in &dirty {
            let Some(target) = desired.get(&spec.name) else {
                continue;
            };
            let result = match (spec.ramp, target, before.get(&spec.name)) {
                (Some(config), Value::Number(to), Some(Value::Number(from))) => {
                    ramp::run(backend, &spec.name, *from, *to, &config, &self.interrupt)
                        .await
                        .map(|_| ())
                }
                _ => backend.write(&spec.name, target).await,
            };

            if let Err(err) = result {
                self.after_failed_write(backend, &err).await;
                return Err(err);
            }
            info!(device = %self.device, attribute = %spec.name, value = %target, "Programmed");
            written.push(spec.name.clone());
        }

        if let Some(settle) = self.settle_time {
            tokio::time::sleep(settle).await;
        }

        let after = self.read_all(backend).await?;
        let mismatches = self.mismatches(desired, &after);
        self.publish(after.clone());

        Ok(Reconciliation {
            observed: after,
            changed: true,
            written,
            mismatches,
        })
    }

    /// Record where an aborted ramp left the hardware.
    async fn after_failed_write<B: Backend + ?Sized>(&mut self, backend: &mut B, err: &DeviceError) {
        let (attribute, last_reached) = match err {
            DeviceError::RampAborted {
                attribute,
                last_reached,
                ..
            }
            | DeviceError::RampInterrupted {
                attribute,
                last_reached,
            } => (attribute.clone(), *last_reached),
            _ => return,
        };

        match self.read_all(backend).await {
            Ok(observed) => self.publish(observed),
            Err(read_err) => {
                warn!(
                    device = %self.device,
                    attribute = %attribute,
                    error = %read_err,
                    "Confirmation read after aborted ramp failed"
                );
                self.observed.insert(attribute, Value::Number(last_reached));
            }
        }
    }

    fn mismatches(&self, desired: &DesiredState, observed: &StateMap) -> Vec<Mismatch> {
        let mut mismatches = Vec::new();
        for spec in &self.specs {
            let (Some(want), Some(got)) = (desired.get(&spec.name), observed.get(&spec.name)) else {
                continue;
            };
            if want.differs(got, spec.tolerance) {
                warn!(
                    device = %self.device,
                    attribute = %spec.name,
                    desired = %want,
                    observed = %got,
                    "Value mismatch after programming"
                );
                mismatches.push(Mismatch {
                    attribute: spec.name.clone(),
                    desired: *want,
                    observed: *got,
                });
            }
        }
        mismatches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Instant;
    use tracing_test::traced_test;

    /// In-memory device that settles `offset` away from every commanded value.
    #[derive(Default)]
    struct FakeDevice {
        values: HashMap<String, Value>,
        offset: f64,
        writes: Vec<(String, Value)>,
        reads: usize,
    }

    #[async_trait]
    impl Backend for FakeDevice {
        async fn read(&mut self, attribute: &str) -> Result<Value> {
            self.reads += 1;
            self.values
                .get(attribute)
                .copied()
                .ok_or_else(|| DeviceError::UnknownAttribute(attribute.to_string()))
        }

        async fn write(&mut self, attribute: &str, value: &Value) -> Result<()> {
            self.writes.push((attribute.to_string(), *value));
            let settled = match value {
                Value::Number(v) => Value::Number(v + self.offset),
                flag => *flag,
            };
            self.values.insert(attribute.to_string(), settled);
            Ok(())
        }
    }

    fn synth() -> (Reconciler, FakeDevice) {
        let reconciler = Reconciler::new(
            "synth",
            vec![
                AttributeSpec::number("freq", 1.0).with_limits(10e6, 50e9),
                AttributeSpec::number("amp", 0.01),
                AttributeSpec::flag("gate"),
            ],
        );
        let mut device = FakeDevice::default();
        device.values.insert("freq".into(), Value::Number(100e6));
        device.values.insert("amp".into(), Value::Number(0.0));
        device.values.insert("gate".into(), Value::Flag(true));
        (reconciler, device)
    }

    #[tokio::test]
    async fn test_within_tolerance_writes_nothing() {
        let (mut reconciler, mut device) = synth();
        let desired: DesiredState = [("freq", Value::Number(100e6 + 0.5)), ("gate", Value::Flag(true))]
            .into_iter()
            .collect();

        let report = reconciler
            .reconcile(&mut device, &desired, ProgramMode::Smart)
            .await
            .unwrap();

        assert!(!report.changed);
        assert!(device.writes.is_empty());
        assert_eq!(report.observed.get("freq"), Some(&Value::Number(100e6)));
        assert_eq!(reconciler.front_panel().get("freq"), Some(Value::Number(100e6)));
    }

    #[tokio::test]
    async fn test_only_dirty_attribute_written() {
        let (mut reconciler, mut device) = synth();
        let desired: DesiredState = [
            ("freq", Value::Number(100e6)),
            ("amp", Value::Number(-3.0)),
            ("gate", Value::Flag(true)),
        ]
        .into_iter()
        .collect();

        let report = reconciler
            .reconcile(&mut device, &desired, ProgramMode::Smart)
            .await
            .unwrap();

        assert!(report.changed);
        assert_eq!(report.written, vec!["amp".to_string()]);
        assert_eq!(device.writes, vec![("amp".to_string(), Value::Number(-3.0))]);
    }

    #[tokio::test]
    async fn test_fresh_mode_writes_everything_in_declared_order() {
        let (mut reconciler, mut device) = synth();
        let desired: DesiredState = [("gate", Value::Flag(true)), ("freq", Value::Number(100e6))]
            .into_iter()
            .collect();

        reconciler
            .reconcile(&mut device, &desired, ProgramMode::Fresh)
            .await
            .unwrap();

        let order: Vec<&str> = device.writes.iter().map(|(a, _)| a.as_str()).collect();
        assert_eq!(order, vec!["freq", "gate"]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_front_panel_takes_confirmation_read_not_desired() {
        let (mut reconciler, mut device) = synth();
        device.offset = 7.0;
        let desired: DesiredState = [("freq", Value::Number(200e6))].into_iter().collect();

        let report = reconciler
            .reconcile(&mut device, &desired, ProgramMode::Smart)
            .await
            .unwrap();

        let confirmed = Value::Number(200e6 + 7.0);
        assert_eq!(report.observed.get("freq"), Some(&confirmed));
        assert_eq!(reconciler.front_panel().get("freq"), Some(confirmed));
        assert_eq!(report.mismatches.len(), 1);
        assert!(logs_contain("Value mismatch after programming"));
    }

    #[tokio::test]
    async fn test_invalid_desired_rejected_before_io() {
        let (mut reconciler, mut device) = synth();

        let unknown: DesiredState = [("phase", Value::Number(1.0))].into_iter().collect();
        assert!(matches!(
            reconciler.reconcile(&mut device, &unknown, ProgramMode::Smart).await,
            Err(DeviceError::UnknownAttribute(_))
        ));

        let too_high: DesiredState = [("freq", Value::Number(60e9))].into_iter().collect();
        assert!(matches!(
            reconciler.reconcile(&mut device, &too_high, ProgramMode::Smart).await,
            Err(DeviceError::OutOfRange { .. })
        ));

        assert_eq!(device.reads, 0);
        assert!(device.writes.is_empty());
    }

    /// Reaches a commanded value only `delay` after the write.
    struct SlowDevice {
        value: f64,
        pending: Option<(f64, Instant)>,
        delay: Duration,
    }

    impl SlowDevice {
        fn new(value: f64, delay: Duration) -> Self {
            Self {
                value,
                pending: None,
                delay,
            }
        }
    }

    #[async_trait]
    impl Backend for SlowDevice {
        async fn read(&mut self, _attribute: &str) -> Result<Value> {
            if let Some((target, written_at)) = self.pending {
                if written_at.elapsed() >= self.delay {
                    self.value = target;
                    self.pending = None;
                }
            }
            Ok(Value::Number(self.value))
        }

        async fn write(&mut self, _attribute: &str, value: &Value) -> Result<()> {
            let target = value.as_f64().unwrap_or(self.value);
            self.pending = Some((target, Instant::now()));
            Ok(())
        }
    }

    fn stage() -> Reconciler {
        Reconciler::new("stage", vec![AttributeSpec::number("position", 0.001)])
    }

    #[tokio::test]
    async fn test_settle_time_waits_before_confirmation_read() {
        let mut reconciler = stage().with_settle_time(Some(Duration::from_millis(60)));
        let mut device = SlowDevice::new(0.0, Duration::from_millis(20));
        let desired: DesiredState = [("position", 5.0)].into_iter().collect();

        let report = reconciler
            .reconcile(&mut device, &desired, ProgramMode::Smart)
            .await
            .unwrap();

        assert!(report.mismatches.is_empty());
        assert_eq!(reconciler.front_panel().get("position"), Some(Value::Number(5.0)));
    }

    #[tokio::test]
    async fn test_without_settle_time_slow_device_is_a_mismatch() {
        let mut reconciler = stage();
        let mut device = SlowDevice::new(0.0, Duration::from_millis(500));
        let desired: DesiredState = [("position", 5.0)].into_iter().collect();

        let report = reconciler
            .reconcile(&mut device, &desired, ProgramMode::Smart)
            .await
            .unwrap();

        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].observed, Value::Number(0.0));
        assert_eq!(reconciler.front_panel().get("position"), Some(Value::Number(0.0)));
    }

    #[tokio::test]
    async fn test_stop_request_while_idle_does_not_abort_next_ramp() {
        let ramp = crate::ramp::RampConfig {
            step_size: 10.0,
            min_step_duration: Duration::ZERO,
        };
        let mut reconciler = Reconciler::new(
            "synth",
            vec![AttributeSpec::number("freq", 1.0).with_ramp(Some(ramp))],
        );
        let mut device = FakeDevice::default();
        device.values.insert("freq".into(), Value::Number(0.0));

        reconciler.interrupt_handle().trigger();
        let desired: DesiredState = [("freq", 40.0)].into_iter().collect();
        let report = reconciler
            .reconcile(&mut device, &desired, ProgramMode::Smart)
            .await
            .unwrap();

        assert_eq!(report.written, vec!["freq".to_string()]);
        assert_eq!(device.writes.len(), 4);
        assert_eq!(reconciler.front_panel().get("freq"), Some(Value::Number(40.0)));
        assert!(!reconciler.interrupt_handle().is_triggered());
    }

    #[tokio::test]
    async fn test_refresh_publishes_all_attributes() {
        let (mut reconciler, mut device) = synth();
        let observed = reconciler.refresh(&mut device).await.unwrap();
        assert_eq!(observed.len(), 3);
        assert_eq!(reconciler.front_panel().snapshot().values, observed);
        assert_eq!(reconciler.observed(), &observed);
    }
}
