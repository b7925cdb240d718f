//! Periodic remote-value checks.
//!
//! A [`Poller`] refreshes one shared device on a fixed interval so the front
//! panel follows changes made outside this process (a knob turned on the
//! synthesizer, a mount nudged by hand). Polling takes the device mutex, so it
//! never interleaves with a reconcile on the same transport.

use crate::device::{Device, SharedDevice};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Handle to a running polling task.
pub struct Poller {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: JoinHandle<u64>,
}

impl Poller {
    /// Start refreshing `device` every `period`. The first refresh happens
    /// immediately.
    pub fn spawn(device: SharedDevice, period: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut refreshes = 0u64;

            info!(period = ?period, "Device polling started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let mut device = device.lock().await;
                        match device.refresh().await {
                            Ok(observed) => {
                                refreshes += 1;
                                debug!(device = %device.name(), values = observed.len(), "Remote values checked");
                            }
                            Err(e) => {
                                warn!(device = %device.name(), error = %e, "Failed to check remote values");
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("Device polling shutdown requested");
                        break;
                    }
                }
            }
            refreshes
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            task_handle,
        }
    }

    /// Stop polling and wait for the task. Returns the number of successful
    /// refreshes. A refresh in progress is allowed to finish.
    pub async fn stop(mut self) -> u64 {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match (&mut self.task_handle).await {
            Ok(refreshes) => refreshes,
            Err(e) => {
                warn!(error = %e, "Polling task ended abnormally");
                0
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if self.shutdown_tx.is_some() {
            self.task_handle.abort();
        }
    }
}
