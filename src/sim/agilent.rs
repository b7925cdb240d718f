//! Simulated Agilent 83650B behind a Prologix GPIB-USB converter.

use super::{FaultInjector, Outbox};
use crate::error::Result;
use crate::protocol::scpi;
use crate::transport::Transport;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug)]
struct SynthState {
    gpib_address: u8,
    selected: Option<u8>,
    frequency: f64,
    power: f64,
    output: bool,
    /// Added to every commanded frequency.
    frequency_offset: f64,
    /// Reply waiting for `++read`.
    staged: Option<String>,
    log: Vec<String>,
    faults: FaultInjector,
}

/// Test-side view of a simulated synthesizer.
#[derive(Clone)]
pub struct AgilentSimHandle {
    state: Arc<Mutex<SynthState>>,
}

impl AgilentSimHandle {
    /// Synthesizer at `gpib_address`, at 1 GHz, -10 dBm, output off.
    pub fn new(gpib_address: u8) -> Self {
        Self {
            state: Arc::new(Mutex::new(SynthState {
                gpib_address,
                selected: None,
                frequency: 1e9,
                power: -10.0,
                output: false,
                frequency_offset: 0.0,
                staged: None,
                log: Vec::new(),
                faults: FaultInjector::default(),
            })),
        }
    }

    pub fn connect(&self) -> AgilentSim {
        AgilentSim {
            state: self.state.clone(),
            outbox: Outbox::default(),
        }
    }

    pub fn frequency(&self) -> f64 {
        self.state.lock().frequency
    }

    pub fn set_frequency(&self, hz: f64) {
        self.state.lock().frequency = hz;
    }

    pub fn power(&self) -> f64 {
        self.state.lock().power
    }

    pub fn set_power(&self, dbm: f64) {
        self.state.lock().power = dbm;
    }

    pub fn output(&self) -> bool {
        self.state.lock().output
    }

    pub fn set_frequency_offset(&self, hz: f64) {
        self.state.lock().frequency_offset = hz;
    }

    /// Converter directives plus every line that reached the synthesizer.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Instrument set commands (no `++` directives, no queries).
    pub fn set_commands(&self) -> Vec<String> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|c| is_set(c))
            .cloned()
            .collect()
    }

    /// Values written with `:FREQuency:CW`, in order.
    pub fn frequency_writes(&self) -> Vec<f64> {
        self.set_commands()
            .iter()
            .filter_map(|c| c.strip_prefix(":FREQuency:CW "))
            .filter_map(|rest| rest.split_whitespace().next()?.parse().ok())
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    pub fn fail_after_sets(&self, n: usize) {
        self.state.lock().faults.fail_after(n);
    }
}

fn is_set(command: &str) -> bool {
    !command.starts_with("++") && !command.ends_with('?')
}

/// Transport end of the simulated converter.
pub struct AgilentSim {
    state: Arc<Mutex<SynthState>>,
    outbox: Outbox,
}

impl AgilentSim {
    fn handle(&mut self, line: &str) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(directive) = line.strip_prefix("++") {
            state.log.push(line.to_string());
            let mut parts = directive.split_whitespace();
            match parts.next() {
                Some("addr") => state.selected = parts.next().and_then(|a| a.parse().ok()),
                Some("read") => {
                    if let Some(reply) = state.staged.take() {
                        trace!(reply = %reply, "agilent-sim");
                        self.outbox.push(reply.as_bytes());
                        self.outbox.push(b"\n");
                    }
                }
                _ => {}
            }
            return Ok(());
        }

        if state.selected != Some(state.gpib_address) {
            return Ok(());
        }
        state.log.push(line.to_string());

        if is_set(line) {
            state.faults.record_set("agilent-sim")?;
        }

        let (header, argument) = match line.split_once(' ') {
            Some((header, argument)) => (header, argument.split_whitespace().next().unwrap_or_default()),
            None => (line, ""),
        };
        match header {
            scpi::FREQUENCY_QUERY => state.staged = Some(format!("{:+.11E}", state.frequency)),
            scpi::POWER_QUERY => state.staged = Some(format!("{:+.2}", state.power)),
            scpi::OUTPUT_QUERY => state.staged = Some(if state.output { "1" } else { "0" }.to_string()),
            ":FREQuency:CW" => {
                if let Ok(hz) = argument.parse::<f64>() {
                    state.frequency = hz + state.frequency_offset;
                }
            }
            ":POWer:LEVel" => {
                if let Ok(dbm) = argument.parse::<f64>() {
                    state.power = dbm;
                }
            }
            ":POWer:STATe" => state.output = argument.eq_ignore_ascii_case("ON") || argument == "1",
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for AgilentSim {
    fn describe(&self) -> String {
        "agilent83650b-sim".to_string()
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(bytes).to_string();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            self.handle(line)?;
        }
        Ok(())
    }

    async fn read_until(&mut self, delimiter: u8) -> Result<Vec<u8>> {
        self.outbox.read_until("agilent83650b-sim", delimiter)
    }

    async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        self.outbox.read_exact("agilent83650b-sim", len)
    }

    async fn close(&mut self) -> Result<()> {
        self.outbox.clear();
        Ok(())
    }
}
