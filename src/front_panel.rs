//! Operator-facing device state.
//!
//! The front panel is a `tokio::sync::watch` channel holding the most recent
//! *confirmed* hardware read. Any number of subscribers (a CLI printer, a
//! logger, a UI) can await changes without polling.
//!
//! Only the reconciler can publish to it, and it only ever publishes values
//! that were just read back from the device.

use crate::state::{StateMap, Value};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// One published front-panel state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PanelSnapshot {
    pub values: StateMap,
    /// Time of the hardware read the values came from. `None` before the
    /// first read.
    pub read_at: Option<DateTime<Utc>>,
}

/// Shared handle to a device's front panel. Clones share the same channel.
#[derive(Debug, Clone)]
pub struct FrontPanel {
    sender: Arc<watch::Sender<PanelSnapshot>>,
}

impl Default for FrontPanel {
    fn default() -> Self {
        Self::new()
    }
}

impl FrontPanel {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(PanelSnapshot::default());
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Current snapshot (clone).
    pub fn snapshot(&self) -> PanelSnapshot {
        self.sender.borrow().clone()
    }

    /// Current value of one attribute.
    pub fn get(&self, attribute: &str) -> Option<Value> {
        self.sender.borrow().values.get(attribute).copied()
    }

    /// Subscribe to future updates.
    pub fn subscribe(&self) -> watch::Receiver<PanelSnapshot> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish a confirmed hardware read.
    pub(crate) fn confirm(&self, observed: &StateMap) {
        self.sender.send_replace(PanelSnapshot {
            values: observed.clone(),
            read_at: Some(Utc::now()),
        });
    }
}
