//! USB serial port watcher.
//!
//! Polls the OS port enumeration for candidate machine ports (WCH bridge
//! chips: CH340, CH9102), probes new ports by subscribing to the state-info
//! letter and watching for its notification, and announces confirmed
//! machines. A connected port disappearing from the enumeration is a loss.
//!
//! Probing is serialized: at most one probe runs at a time, and a port that
//! was probed (successfully or not) is not probed again while it remains
//! present.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::serial::{LinePort, encode_subscribe, open_port};

/// Vendor id for WCH serial bridges used by the machine's USB-C port.
pub const VENDOR_ID_WCH: u16 = 0x1A86;
/// Enumeration poll interval.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// How long a probed port has to answer before it is declared not-a-machine.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// A candidate port from enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePort {
    /// OS port name (`COM3`, `/dev/ttyACM0`).
    pub name: String,
    /// USB serial number when the OS reports one.
    pub serial_number: Option<String>,
}

/// Events published by the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    /// A machine answered the probe on this port.
    MachineFound {
        /// OS port name.
        port_name: String,
        /// USB serial number when known.
        serial_number: Option<String>,
    },
    /// The connected machine's port disappeared from enumeration.
    MachineLost {
        /// OS port name that vanished.
        port_name: String,
    },
}

/// Port enumeration and probing, abstracted for tests.
pub trait PortScanner: Send + 'static {
    /// Ports currently present that match the machine's vendor id.
    fn candidate_ports(&mut self) -> Vec<CandidatePort>;
    /// Probe a port; `true` when a machine answered.
    fn probe(&mut self, port_name: &str) -> bool;
}

/// Scanner backed by the OS serial enumeration.
#[derive(Debug, Default)]
pub struct OsScanner;

impl PortScanner for OsScanner {
    fn candidate_ports(&mut self) -> Vec<CandidatePort> {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                tracing::debug!(error = %e, "port enumeration failed");
                return Vec::new();
            },
        };
        ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                serialport::SerialPortType::UsbPort(info) if info.vid == VENDOR_ID_WCH => {
                    Some(CandidatePort { name: port.port_name, serial_number: info.serial_number })
                },
                _ => None,
            })
            .collect()
    }

    fn probe(&mut self, port_name: &str) -> bool {
        let mut port = match open_port(port_name) {
            Ok(port) => port,
            Err(e) => {
                tracing::debug!(port_name, error = %e, "probe open failed");
                return false;
            },
        };

        // Subscribe the state-info letter; a machine answers with [M]
        if port.write_all(encode_subscribe('M').as_bytes()).is_err() {
            return false;
        }

        let deadline = Instant::now() + PROBE_TIMEOUT;
        let mut received = Vec::new();
        let mut buf = [0u8; 256];
        while Instant::now() < deadline {
            match port.read_chunk(&mut buf) {
                Ok(0) => {},
                Ok(n) => {
                    received.extend_from_slice(&buf[..n]);
                    if received.windows(3).any(|w| w == b"[M]") {
                        return true;
                    }
                },
                Err(_) => return false,
            }
        }
        tracing::debug!(port_name, bytes = received.len(), "probe timeout, not a machine");
        false
    }
}

/// Tracks which ports have been seen and which one carries the machine.
///
/// Pure bookkeeping: [`WatcherState::tick`] takes the current enumeration
/// plus a probe callback and returns the events to publish. The async
/// wrapper supplies the OS scanner on an interval.
#[derive(Debug, Default)]
pub struct WatcherState {
    known_ports: HashSet<String>,
    connected_port: Option<String>,
}

impl WatcherState {
    /// Create an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a port is carrying the machine (after the session
    /// attaches), so its loss is reported.
    pub fn set_connected(&mut self, port_name: Option<String>) {
        self.connected_port = port_name;
    }

    /// Process one enumeration pass.
    pub fn tick(
        &mut self,
        present: Vec<CandidatePort>,
        probe: &mut dyn FnMut(&str) -> bool,
    ) -> Vec<WatcherEvent> {
        let mut events = Vec::new();
        let present_names: HashSet<String> =
            present.iter().map(|p| p.name.clone()).collect();

        if let Some(connected) = self.connected_port.clone() {
            if !present_names.contains(&connected) {
                tracing::warn!(port_name = %connected, "connected machine port disappeared");
                self.connected_port = None;
                events.push(WatcherEvent::MachineLost { port_name: connected });
            }
        }

        // Probe at most one new candidate per tick, and none while connected
        if self.connected_port.is_none() {
            let new_candidate = present
                .iter()
                .find(|p| !self.known_ports.contains(&p.name));
            if let Some(candidate) = new_candidate {
                if probe(&candidate.name) {
                    tracing::info!(port_name = %candidate.name, "machine found on serial port");
                    self.connected_port = Some(candidate.name.clone());
                    events.push(WatcherEvent::MachineFound {
                        port_name: candidate.name.clone(),
                        serial_number: candidate.serial_number.clone(),
                    });
                }
            }
        }

        self.known_ports = present_names;
        events
    }
}

/// Spawn the watcher loop over a scanner.
///
/// Probes run on the blocking pool so enumeration hiccups never stall the
/// runtime. The loop exits when the event receiver is dropped.
pub fn spawn_watcher<S: PortScanner>(mut scanner: S) -> mpsc::UnboundedReceiver<WatcherEvent> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut state = WatcherState::new();
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let (events, returned_scanner, returned_state) =
                match tokio::task::spawn_blocking(move || {
                    let present = scanner.candidate_ports();
                    let events = state.tick(present, &mut |name| scanner.probe(name));
                    (events, scanner, state)
                })
                .await
                {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::error!(error = %e, "port watcher worker panicked");
                        return;
                    },
                };
            scanner = returned_scanner;
            state = returned_state;

            for event in events {
                if tx.send(event).is_err() {
                    return;
                }
            }
        }
    });

    rx
}
