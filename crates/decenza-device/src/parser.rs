//! Notification parsers.
//!
//! Each parser takes the raw payload of one notification and produces a
//! typed value, or `None` when the buffer is shorter than the fixed layout
//! (truncated notifications are discarded, never partially decoded).

use decenza_codec::{fixed, wire};

use crate::state::{MachineState, MachineSubState};

/// One time-point of extraction telemetry.
///
/// Fixed 14-byte notification. The byte at offset 9 is reserved by firmware
/// and is not decoded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShotSample {
    /// Seconds since shot start (wire: centiseconds, big-endian u16).
    pub timer: f64,
    /// Group pressure in bar.
    pub group_pressure: f64,
    /// Group flow in mL/s.
    pub group_flow: f64,
    /// Mix water temperature in Celsius.
    pub mix_temp: f64,
    /// Group head temperature in Celsius.
    pub head_temp: f64,
    /// Temperature goal in Celsius.
    pub set_temp_goal: f64,
    /// Flow goal in mL/s.
    pub set_flow_goal: f64,
    /// Pressure goal in bar.
    pub set_pressure_goal: f64,
    /// Index of the active profile frame.
    pub frame_number: u8,
    /// Steam heater temperature in Celsius (integer precision).
    pub steam_temp: u8,
}

/// Length of a shot sample notification.
pub const SHOT_SAMPLE_LEN: usize = 14;

/// Parse a shot sample. Buffers shorter than 14 bytes are discarded.
#[must_use]
pub fn parse_shot_sample(data: &[u8]) -> Option<ShotSample> {
    if data.len() < SHOT_SAMPLE_LEN {
        return None;
    }
    Some(ShotSample {
        timer: f64::from(wire::decode_u16_be(data, 0)) / 100.0,
        group_pressure: fixed::decode_u8p4(data[2]),
        group_flow: fixed::decode_u8p4(data[3]),
        mix_temp: fixed::decode_u16p8(wire::decode_u16_be(data, 4)),
        head_temp: fixed::decode_u16p8(wire::decode_u16_be(data, 6)),
        set_temp_goal: fixed::decode_u8p1(data[8]),
        // data[9] is reserved
        set_flow_goal: fixed::decode_u8p4(data[10]),
        set_pressure_goal: fixed::decode_u8p4(data[11]),
        frame_number: data[12],
        steam_temp: data[13],
    })
}

/// Parse a state-info notification: `(state, substate)`.
#[must_use]
pub fn parse_state_info(data: &[u8]) -> Option<(MachineState, MachineSubState)> {
    if data.len() < 2 {
        return None;
    }
    Some((MachineState::from_byte(data[0]), MachineSubState::from_byte(data[1])))
}

/// Parse a water-level notification into liters.
#[must_use]
pub fn parse_water_level(data: &[u8]) -> Option<f64> {
    if data.len() < 2 {
        return None;
    }
    Some(fixed::decode_u16p8(wire::decode_u16_be(data, 0)))
}

/// Parse the firmware version read into its display string.
///
/// Layout: BLE API level, BLE release (F8_1_7), three reserved bytes,
/// firmware API level, firmware release (F8_1_7).
#[must_use]
pub fn parse_version(data: &[u8]) -> Option<String> {
    if data.len() < 10 {
        return None;
    }
    let ble_api = data[0];
    let ble_release = fixed::decode_f8_1_7(data[1]);
    let fw_api = data[5];
    let fw_release = fixed::decode_f8_1_7(data[6]);
    Some(format!("FW {fw_api}.{fw_release:.1}, BLE {ble_api}.{ble_release:.1}"))
}
