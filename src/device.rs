//! The device lifecycle interface.
//!
//! Every driver owns a [`Reconciler`](crate::reconcile::Reconciler) and a
//! protocol link over an exclusively owned transport. The lifecycle is:
//!
//! ```text
//! configure -> (reconcile | refresh)* -> shutdown
//! ```
//!
//! `transition_to_buffered` and `program_manual` are the two entry points a
//! run controller uses; they differ only in [`ProgramMode`].

use crate::error::Result;
use crate::front_panel::FrontPanel;
use crate::ramp::Interrupt;
use crate::reconcile::{ProgramMode, Reconciliation};
use crate::state::{AttributeSpec, DesiredState, StateMap};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

#[async_trait]
pub trait Device: Send {
    fn name(&self) -> &str;

    /// Declared attributes, in write order.
    fn attributes(&self) -> &[AttributeSpec];

    /// Bring the connection up: identity checks, startup homing, channel
    /// enable, initial refresh.
    async fn configure(&mut self) -> Result<()>;

    async fn reconcile(&mut self, desired: &DesiredState, mode: ProgramMode) -> Result<Reconciliation>;

    /// Read every attribute and publish it to the front panel.
    async fn refresh(&mut self) -> Result<StateMap>;

    /// Release the transport.
    async fn shutdown(&mut self) -> Result<()>;

    fn front_panel(&self) -> FrontPanel;

    /// Handle that stops a running ramp between steps.
    fn interrupt_handle(&self) -> Interrupt;

    /// Program the static values of a run, skipping values already in place.
    async fn transition_to_buffered(&mut self, desired: &DesiredState) -> Result<Reconciliation> {
        self.reconcile(desired, ProgramMode::Smart).await
    }

    /// Operator-initiated programming: every given value is written.
    async fn program_manual(&mut self, values: &DesiredState) -> Result<Reconciliation> {
        self.reconcile(values, ProgramMode::Fresh).await
    }
}

/// A device shared between a poller and whoever programs it. The mutex
/// serializes all traffic on the device's transport.
pub type SharedDevice = Arc<Mutex<Box<dyn Device>>>;

pub fn share(device: Box<dyn Device>) -> SharedDevice {
    Arc::new(Mutex::new(device))
}
