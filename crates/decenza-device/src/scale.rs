//! Half Decent Scale session.
//!
//! The scale speaks a fixed 7-byte packet protocol in both directions:
//!
//! ```text
//! [0x03, type, data0, data1, data2, data3, XOR]
//! ```
//!
//! Weight packets (type `0xCE` steady / `0xCA` changing) carry a signed
//! big-endian decigram value in `data0:data1`. Commands (tare, LED, timer)
//! use the same shape with the XOR of the first six bytes as the tail.
//!
//! The session derives a weight flow rate from consecutive samples and
//! smooths it with a trailing moving average over an 11-sample window,
//! matching the smoothing the history engine applies to stored shots.

use std::collections::VecDeque;

use decenza_codec::wire;

/// Packet length in both directions.
pub const PACKET_LEN: usize = 7;
/// Leading byte of every packet.
const PACKET_HEADER: u8 = 0x03;
/// Weight packet, reading steady.
const TYPE_WEIGHT_STEADY: u8 = 0xCE;
/// Weight packet, reading changing.
const TYPE_WEIGHT_CHANGING: u8 = 0xCA;
/// Button press packet.
const TYPE_BUTTON: u8 = 0xAA;
/// Tare command.
const TYPE_TARE: u8 = 0x0F;
/// Timer command.
const TYPE_TIMER: u8 = 0x0B;
/// LED command.
const TYPE_LED: u8 = 0x0A;

/// Samples in the flow-rate smoothing window (half-window 5).
const FLOW_WINDOW: usize = 11;

/// Events parsed from scale packets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleEvent {
    /// A weight reading in grams.
    Weight {
        /// Grams on the platform.
        grams: f64,
        /// Whether the reading was flagged steady by the scale.
        steady: bool,
    },
    /// A physical button was pressed.
    Button {
        /// Button number.
        number: u8,
    },
}

fn xor_tail(packet: &[u8]) -> u8 {
    packet.iter().take(PACKET_LEN - 1).fold(0, |acc, b| acc ^ b)
}

/// Parse one 7-byte packet. Bad header, type, or checksum yields `None`.
#[must_use]
pub fn parse_packet(packet: &[u8]) -> Option<ScaleEvent> {
    if packet.len() < PACKET_LEN || packet[0] != PACKET_HEADER {
        return None;
    }
    if xor_tail(packet) != packet[6] {
        return None;
    }
    match packet[1] {
        TYPE_WEIGHT_STEADY | TYPE_WEIGHT_CHANGING => {
            let decigrams = wire::decode_i16_be(packet, 2);
            Some(ScaleEvent::Weight {
                grams: f64::from(decigrams) / 10.0,
                steady: packet[1] == TYPE_WEIGHT_STEADY,
            })
        },
        TYPE_BUTTON => Some(ScaleEvent::Button { number: packet[2] }),
        _ => None,
    }
}

fn command(kind: u8, data: [u8; 4]) -> [u8; PACKET_LEN] {
    let mut packet = [PACKET_HEADER, kind, data[0], data[1], data[2], data[3], 0];
    packet[6] = xor_tail(&packet);
    packet
}

/// Tare (zero) the scale.
#[must_use]
pub fn tare_command() -> [u8; PACKET_LEN] {
    command(TYPE_TARE, [0, 0, 0, 0])
}

/// Turn the weight LED on or off.
#[must_use]
pub fn led_command(on: bool) -> [u8; PACKET_LEN] {
    command(TYPE_LED, [u8::from(on), 0, 0, 0])
}

/// Start, stop, or zero the scale timer.
#[must_use]
pub fn timer_command(action: TimerAction) -> [u8; PACKET_LEN] {
    command(TYPE_TIMER, [action as u8, 0, 0, 0])
}

/// Timer actions for [`timer_command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Zero the timer.
    Zero = 0x02,
    /// Start the timer.
    Start = 0x03,
    /// Stop the timer.
    Stop = 0x00,
}

/// Splits a byte stream into aligned packets.
///
/// The scale occasionally delivers partial packets over USB; bytes are
/// buffered until a full 7-byte packet starting with the header byte is
/// available, resynchronizing on the header after garbage.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    buffer: Vec<u8>,
}

impl PacketBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and drain complete packets.
    pub fn push(&mut self, data: &[u8]) -> Vec<[u8; PACKET_LEN]> {
        self.buffer.extend_from_slice(data);
        let mut packets = Vec::new();
        loop {
            // Resync to the header byte
            match self.buffer.iter().position(|&b| b == PACKET_HEADER) {
                Some(0) => {},
                Some(pos) => {
                    self.buffer.drain(..pos);
                },
                None => {
                    self.buffer.clear();
                    break;
                },
            }
            if self.buffer.len() < PACKET_LEN {
                break;
            }
            let mut packet = [0u8; PACKET_LEN];
            packet.copy_from_slice(&self.buffer[..PACKET_LEN]);
            self.buffer.drain(..PACKET_LEN);
            packets.push(packet);
        }
        packets
    }
}

/// Tracks weight over time and produces a smoothed flow rate.
#[derive(Debug, Default)]
pub struct FlowTracker {
    last: Option<(f64, f64)>,
    rates: VecDeque<f64>,
}

impl FlowTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a weight sample at `time` seconds, returning the smoothed
    /// grams-per-second rate.
    pub fn push(&mut self, time: f64, grams: f64) -> f64 {
        if let Some((last_time, last_grams)) = self.last {
            let dt = time - last_time;
            if dt > 0.0 {
                let rate = (grams - last_grams) / dt;
                if self.rates.len() == FLOW_WINDOW {
                    self.rates.pop_front();
                }
                self.rates.push_back(rate);
            }
        }
        self.last = Some((time, grams));
        self.smoothed()
    }

    /// Reset for a new shot.
    pub fn clear(&mut self) {
        self.last = None;
        self.rates.clear();
    }

    fn smoothed(&self) -> f64 {
        if self.rates.is_empty() {
            return 0.0;
        }
        self.rates.iter().sum::<f64>() / self.rates.len() as f64
    }
}
