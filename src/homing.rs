//! Homing guard for motor controllers.
//!
//! Absolute positions are meaningless until the controller has found its
//! reference. Whether the controller is homed is hardware-resident state, so
//! it is read from the device every time instead of being cached here.
//!
//! Homing drives the actuator towards the end of its travel. For actuators
//! that steer a high-power beam this must not happen unattended, which is what
//! [`HomingPolicy::Manual`] is for.

use crate::error::{DeviceError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// What to do when a reconcile finds the controller un-homed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HomingPolicy {
    /// Run the homing sequence automatically.
    Auto,
    /// Refuse to move; the operator homes the device by hand.
    #[default]
    Manual,
}

/// Controllers that can report and establish their reference position.
#[async_trait]
pub trait Homeable: Send {
    /// Query the controller's homed status bit.
    async fn is_homed(&mut self) -> Result<bool>;

    /// Run the homing sequence and wait for it to finish.
    async fn home(&mut self) -> Result<()>;
}

/// Make sure `controller` is homed before any motion is commanded.
pub async fn ensure_homed<H: Homeable + ?Sized>(
    device: &str,
    controller: &mut H,
    policy: HomingPolicy,
) -> Result<()> {
    if controller.is_homed().await? {
        return Ok(());
    }

    match policy {
        HomingPolicy::Manual => {
            warn!(device, "Controller not homed; homing policy is manual");
            Err(DeviceError::NotHomed {
                device: device.to_string(),
            })
        }
        HomingPolicy::Auto => {
            info!(device, "Homing device...");
            controller.home().await?;
            if !controller.is_homed().await? {
                return Err(DeviceError::InvalidResponse(format!(
                    "{device}: homing finished but controller does not report homed"
                )));
            }
            info!(device, "Device homed");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Controller {
        homed: bool,
        home_calls: usize,
        broken: bool,
    }

    #[async_trait]
    impl Homeable for Controller {
        async fn is_homed(&mut self) -> Result<bool> {
            Ok(self.homed)
        }

        async fn home(&mut self) -> Result<()> {
            self.home_calls += 1;
            self.homed = !self.broken;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_manual_policy_refuses() {
        let mut controller = Controller::default();
        let err = ensure_homed("kdc", &mut controller, HomingPolicy::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::NotHomed { .. }));
        assert_eq!(controller.home_calls, 0);
        assert!(!controller.homed);
    }

    #[tokio::test]
    async fn test_auto_policy_homes_once() {
        let mut controller = Controller::default();
        ensure_homed("kdc", &mut controller, HomingPolicy::Auto).await.unwrap();
        ensure_homed("kdc", &mut controller, HomingPolicy::Auto).await.unwrap();
        assert_eq!(controller.home_calls, 1);
        assert!(controller.homed);
    }

    #[tokio::test]
    async fn test_already_homed_skips_policy() {
        let mut controller = Controller {
            homed: true,
            ..Default::default()
        };
        ensure_homed("kdc", &mut controller, HomingPolicy::Manual).await.unwrap();
        assert_eq!(controller.home_calls, 0);
    }

    #[tokio::test]
    async fn test_homing_that_does_not_stick_is_an_error() {
        let mut controller = Controller {
            broken: true,
            ..Default::default()
        };
        assert!(ensure_homed("kdc", &mut controller, HomingPolicy::Auto).await.is_err());
    }
}
