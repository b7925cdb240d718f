//! Core library for the lab_devices drivers.
//!
//! This library contains laboratory instrument drivers built around one shared
//! algorithm: smart programming with remote verification. A device is only
//! written when its hardware state is outside tolerance of the requested
//! state, and the operator-facing state is always taken from a read-back,
//! never from what was requested.
//!
//! Supported hardware:
//! - Thorlabs Elliptec ELL14 rotation mounts on a shared interface board
//! - Thorlabs KDC101 DC servo controller with a Z812 actuator
//! - Agilent 83650B synthesizer behind a Prologix GPIB-USB converter
//!
//! Every family also has a simulator in [`sim`] that speaks the real wire
//! protocol; it is selected with `mock = true` in the configuration.

pub mod config;
pub mod device;
pub mod devices;
pub mod error;
pub mod front_panel;
pub mod homing;
pub mod identity;
pub mod logging;
pub mod poller;
pub mod protocol;
pub mod ramp;
pub mod reconcile;
pub mod sim;
pub mod state;
pub mod transport;
pub mod units;

pub use device::{Device, SharedDevice};
pub use error::{DeviceError, Result};
pub use front_panel::{FrontPanel, PanelSnapshot};
pub use reconcile::{Mismatch, ProgramMode, Reconciliation};
pub use state::{AttributeSpec, DesiredState, StateMap, Value};
