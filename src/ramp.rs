//! Software-timed stepped transitions.
//!
//! Instead of jumping straight to a new value, a ramped attribute moves by at
//! most `step_size` per write and holds each step for at least
//! `min_step_duration`. The last step snaps exactly onto the target.
//!
//! A ramp can be interrupted between steps through an [`Interrupt`] handle.
//! Nothing is rolled back when a ramp stops early: the error carries the last
//! value that was successfully written.

use crate::error::{DeviceError, Result};
use crate::reconcile::Backend;
use crate::state::Value;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Step size and hold time of a ramp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RampConfig {
    /// Largest change per write, in the attribute's units.
    pub step_size: f64,
    /// Minimum hold time of every step.
    #[serde(with = "humantime_serde")]
    pub min_step_duration: Duration,
}

/// Flag checked between ramp steps. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that the running ramp stops before its next step. A request
    /// made while no reconcile is running is dropped when the next one starts.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Consume a pending request.
    pub(crate) fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Result of a completed ramp.
#[derive(Debug, Clone, PartialEq)]
pub struct RampOutcome {
    /// Every value written, in order. The last one equals the target.
    pub steps: Vec<f64>,
}

/// Walk `attribute` from `from` to `to`.
pub async fn run<B: Backend + ?Sized>(
    backend: &mut B,
    attribute: &str,
    from: f64,
    to: f64,
    config: &RampConfig,
    interrupt: &Interrupt,
) -> Result<RampOutcome> {
    let step = config.step_size.abs();
    if step == 0.0 || !step.is_finite() {
        return Err(DeviceError::OutOfRange {
            attribute: format!("{attribute}.step_size"),
            value: config.step_size,
            min: f64::MIN_POSITIVE,
            max: f64::MAX,
        });
    }

    let direction = if to >= from { 1.0 } else { -1.0 };
    let mut current = from;
    let mut steps = Vec::new();
    let mut k: u64 = 0;

    info!(attribute, from, to, step, "Starting ramp");

    loop {
        let remaining = to - current;
        let next = if remaining.abs() <= step {
            if remaining == 0.0 && !steps.is_empty() {
                break;
            }
            to
        } else {
            // Offsets from the start avoid accumulating rounding error.
            k += 1;
            from + direction * step * k as f64
        };

        if interrupt.take() {
            info!(attribute, last_reached = current, "Ramp interrupted");
            return Err(DeviceError::RampInterrupted {
                attribute: attribute.to_string(),
                last_reached: current,
            });
        }

        if let Err(source) = backend.write(attribute, &Value::Number(next)).await {
            return Err(DeviceError::RampAborted {
                attribute: attribute.to_string(),
                last_reached: current,
                source: Box::new(source),
            });
        }
        debug!(attribute, value = next, "Ramp step written");
        steps.push(next);
        current = next;

        tokio::time::sleep(config.min_step_duration).await;

        if next == to {
            break;
        }
    }

    Ok(RampOutcome { steps })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct Recorder {
        writes: Vec<f64>,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl Backend for Recorder {
        async fn read(&mut self, _attribute: &str) -> Result<Value> {
            Ok(Value::Number(self.writes.last().copied().unwrap_or_default()))
        }

        async fn write(&mut self, _attribute: &str, value: &Value) -> Result<()> {
            if self.fail_on == Some(self.writes.len()) {
                return Err(DeviceError::transport("test", "link dropped"));
            }
            self.writes.push(value.as_f64().unwrap_or_default());
            Ok(())
        }
    }

    fn config(step: f64, ms: u64) -> RampConfig {
        RampConfig {
            step_size: step,
            min_step_duration: Duration::from_millis(ms),
        }
    }

    #[tokio::test]
    async fn test_ramp_steps_and_snap() {
        let mut backend = Recorder::default();
        let start = tokio::time::Instant::now();
        let outcome = run(&mut backend, "freq", 400e6, 500e6, &config(10e6, 10), &Interrupt::new())
            .await
            .unwrap();

        assert_eq!(outcome.steps.len(), 10);
        assert_eq!(backend.writes, outcome.steps);
        for (i, value) in outcome.steps.iter().enumerate() {
            assert_eq!(*value, 400e6 + 10e6 * (i as f64 + 1.0));
        }
        assert_eq!(*outcome.steps.last().unwrap(), 500e6);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_ramp_downwards_with_partial_last_step() {
        let mut backend = Recorder::default();
        let outcome = run(&mut backend, "freq", 100.0, 75.0, &config(10.0, 0), &Interrupt::new())
            .await
            .unwrap();
        assert_eq!(outcome.steps, vec![90.0, 80.0, 75.0]);
    }

    #[tokio::test]
    async fn test_ramp_failure_reports_last_reached() {
        let mut backend = Recorder {
            fail_on: Some(3),
            ..Default::default()
        };
        let err = run(&mut backend, "freq", 0.0, 100.0, &config(10.0, 0), &Interrupt::new())
            .await
            .unwrap_err();
        match err {
            DeviceError::RampAborted { last_reached, .. } => assert_eq!(last_reached, 30.0),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.writes, vec![10.0, 20.0, 30.0]);
    }

    #[tokio::test]
    async fn test_interrupt_stops_before_next_step() {
        let mut backend = Recorder::default();
        let interrupt = Interrupt::new();
        interrupt.trigger();
        let err = run(&mut backend, "freq", 0.0, 100.0, &config(10.0, 0), &interrupt)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::RampInterrupted { last_reached, .. } if last_reached == 0.0));
        assert!(backend.writes.is_empty());
        assert!(!interrupt.is_triggered());
    }

    #[tokio::test]
    async fn test_zero_step_rejected() {
        let mut backend = Recorder::default();
        assert!(run(&mut backend, "freq", 0.0, 1.0, &config(0.0, 0), &Interrupt::new())
            .await
            .is_err());
    }
}
